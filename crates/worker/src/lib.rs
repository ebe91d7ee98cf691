#![forbid(unsafe_code)]

//! # Hive Worker
//!
//! The worker runtime operating one node for its lifetime: registration and
//! heartbeats against the control-plane REST API, the streaming lease-pull
//! loop with exponential-backoff reconnection, the per-lease message
//! pipeline (at-least-once receive, poison detection, retryable
//! classification, dead-letter routing), the HTTP output sink, and the
//! parent side of the sandboxed child-process executor.

/// The control-plane REST client (register, heartbeat).
pub mod api;
/// The input-queue connector contract and the in-memory broker.
pub mod connector;
/// The parent side of the child-process executor.
pub mod executor;
/// The per-lease message pipeline.
pub mod pipeline;
/// The node runtime: heartbeats, the pull loop, and shutdown draining.
pub mod runtime;
/// The HTTP output sink with idempotency keys and retry backoff.
pub mod sink;
