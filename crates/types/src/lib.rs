#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! # Hive Types
//!
//! This crate is the foundational library for the Hive platform, containing
//! all core data structures, error types, and configuration objects.
//!
//! ## Architectural Role
//!
//! As the base crate, `hive-types` has minimal dependencies and is itself a
//! dependency for almost every other crate in the workspace. This structure
//! prevents circular dependencies and provides a stable, canonical definition
//! for shared types like `AgentSpec`, `Run`, `Node`, and the error enums.

/// Agent definitions: spec, budget, tools, and connector configuration.
pub mod agent;
/// Shared configuration structures for the control plane and worker binaries.
pub mod config;
/// Deployments: the intention to run an agent version in an environment.
pub mod deployment;
/// A unified set of all error types used across the platform.
pub mod error;
/// Run state-transition events published on the control-plane event bus.
pub mod event;
/// Transient exclusive lease and advisory lock records.
pub mod lease;
/// Worker node registration, capacity, and liveness state.
pub mod node;
/// Runs: a single execution of an agent version against one input.
pub mod run;
/// Semantic-version validation for agent versions.
pub mod version;

/// A crate-wide `Result` alias defaulting to the storage error type, which is
/// the error most commonly crossed between components.
pub type Result<T, E = crate::error::StoreError> = std::result::Result<T, E>;
