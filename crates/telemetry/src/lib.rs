#![cfg_attr(
    not(test),
    deny(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::panic,
        clippy::unimplemented,
        clippy::todo,
        clippy::indexing_slicing
    )
)]

//! # Hive Telemetry
//!
//! Observability infrastructure for the Hive platform: structured logging
//! initialization, a Prometheus metrics endpoint, and abstract sinks that
//! decouple metric instrumentation from the backend.

/// A lightweight HTTP server exposing `/metrics`, `/healthz`, and `/readyz`.
pub mod http;
/// The initialization routine for global structured logging.
pub mod init;
/// The concrete implementation of metric sinks using the `prometheus` crate.
pub mod prometheus;
/// Abstract traits (`*MetricsSink`) defining the contract for metrics reporting.
pub mod sinks;
/// A simple RAII timer for measuring the duration of a scope.
pub mod time;

// Re-export the public helper functions for easy access to the global sinks.
pub use sinks::{control_metrics, worker_metrics};
