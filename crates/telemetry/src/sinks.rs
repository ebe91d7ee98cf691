//! Defines abstract traits for metrics reporting, decoupling core logic from
//! the backend.

use once_cell::sync::OnceCell;

// --- Static sink access ---

/// A no-op sink for use in tests or when telemetry is disabled.
#[derive(Debug, Clone, Copy)]
pub struct NopSink;

/// A lazily-initialized static reference to the global `MetricsSink`
/// implementation.
pub static SINK: OnceCell<&'static dyn MetricsSink> = OnceCell::new();
static NOP_SINK: NopSink = NopSink;

/// Returns a static reference to the configured control-plane metrics sink.
/// If no sink has been initialized, it returns a no-op sink.
pub fn control_metrics() -> &'static dyn ControlMetricsSink {
    SINK.get().copied().unwrap_or(&NOP_SINK)
}

/// Returns a static reference to the configured worker metrics sink.
/// If no sink has been initialized, it returns a no-op sink.
pub fn worker_metrics() -> &'static dyn WorkerMetricsSink {
    SINK.get().copied().unwrap_or(&NOP_SINK)
}

// --- Trait definitions ---

/// A sink for metrics emitted by the control plane's dispatch loop and lease
/// service.
pub trait ControlMetricsSink: Send + Sync + std::fmt::Debug {
    /// Increments the total number of runs assigned to a node.
    fn inc_runs_assigned(&self);
    /// Increments the total number of runs that reached `completed`.
    fn inc_runs_completed(&self);
    /// Increments the total number of runs that reached `failed`.
    fn inc_runs_failed(&self);
    /// Increments the total number of runs returned to pending for retry.
    fn inc_runs_retried(&self);
    /// Increments the total number of leases reclaimed by TTL expiry.
    fn inc_leases_expired(&self);
    /// Sets the gauge for runs currently waiting for placement.
    fn set_pending_runs(&self, count: u64);
    /// Sets the gauge for nodes with an open pull stream.
    fn set_connected_pullers(&self, count: u64);
    /// Observes the wall-clock duration of one dispatch tick, in seconds.
    fn observe_dispatch_duration(&self, seconds: f64);
}

impl ControlMetricsSink for NopSink {
    fn inc_runs_assigned(&self) {}
    fn inc_runs_completed(&self) {}
    fn inc_runs_failed(&self) {}
    fn inc_runs_retried(&self) {}
    fn inc_leases_expired(&self) {}
    fn set_pending_runs(&self, _count: u64) {}
    fn set_connected_pullers(&self, _count: u64) {}
    fn observe_dispatch_duration(&self, _seconds: f64) {}
}

/// A sink for metrics emitted by the worker's pull loop and message pipeline.
pub trait WorkerMetricsSink: Send + Sync + std::fmt::Debug {
    /// Increments the total number of lease grants received on the stream.
    fn inc_leases_received(&self);
    /// Increments the total number of leases reported as completed.
    fn inc_leases_completed(&self);
    /// Increments the total number of leases reported as failed.
    fn inc_leases_failed(&self);
    /// Increments the counter of dead-lettered messages, labeled by reason.
    fn inc_dead_lettered(&self, reason: &str);
    /// Increments the counter of output-sink delivery retries.
    fn inc_sink_retries(&self);
    /// Sets the gauge for leases currently executing.
    fn set_active_leases(&self, count: u64);
    /// Observes the end-to-end execution duration of one lease, in seconds.
    fn observe_execution_duration(&self, seconds: f64);
}

impl WorkerMetricsSink for NopSink {
    fn inc_leases_received(&self) {}
    fn inc_leases_completed(&self) {}
    fn inc_leases_failed(&self) {}
    fn inc_dead_lettered(&self, _reason: &str) {}
    fn inc_sink_retries(&self) {}
    fn set_active_leases(&self, _count: u64) {}
    fn observe_execution_duration(&self, _seconds: f64) {}
}

/// The combined sink installed once per process.
pub trait MetricsSink: ControlMetricsSink + WorkerMetricsSink {}
impl MetricsSink for NopSink {}
