#![forbid(unsafe_code)]

//! # Hive Agent
//!
//! The sandbox executor that hosts one LLM invocation per run, isolated in a
//! short-lived child process. The worker spawns `agent-exec`, writes one JSON
//! request line to its stdin, and reads one JSON response line from its
//! stdout; this crate implements the child side of that protocol plus the
//! pluggable chat-client contract.

/// The pluggable chat-client contract and its implementations.
pub mod chat;
/// The child-process run loop.
pub mod child;
/// Token and cost estimation.
pub mod cost;
/// The stdin/stdout wire format.
pub mod wire;
