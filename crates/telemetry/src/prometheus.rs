//! A concrete implementation of the metric sinks using the Prometheus crate.

use crate::sinks::*;
use once_cell::sync::OnceCell;
use prometheus::{
    exponential_buckets, register_gauge, register_histogram, register_int_counter,
    register_int_counter_vec, Gauge, Histogram, IntCounter, IntCounterVec,
};

// --- Metric statics ---
// OnceCell holds the collectors; they are initialized exactly once by
// `install`.

static RUNS_ASSIGNED_TOTAL: OnceCell<IntCounter> = OnceCell::new();
static RUNS_COMPLETED_TOTAL: OnceCell<IntCounter> = OnceCell::new();
static RUNS_FAILED_TOTAL: OnceCell<IntCounter> = OnceCell::new();
static RUNS_RETRIED_TOTAL: OnceCell<IntCounter> = OnceCell::new();
static LEASES_EXPIRED_TOTAL: OnceCell<IntCounter> = OnceCell::new();
static PENDING_RUNS: OnceCell<Gauge> = OnceCell::new();
static CONNECTED_PULLERS: OnceCell<Gauge> = OnceCell::new();
static DISPATCH_DURATION_SECONDS: OnceCell<Histogram> = OnceCell::new();

static LEASES_RECEIVED_TOTAL: OnceCell<IntCounter> = OnceCell::new();
static LEASES_COMPLETED_TOTAL: OnceCell<IntCounter> = OnceCell::new();
static LEASES_FAILED_TOTAL: OnceCell<IntCounter> = OnceCell::new();
static DEAD_LETTERED_TOTAL: OnceCell<IntCounterVec> = OnceCell::new();
static SINK_RETRIES_TOTAL: OnceCell<IntCounter> = OnceCell::new();
static ACTIVE_LEASES: OnceCell<Gauge> = OnceCell::new();
static EXECUTION_DURATION_SECONDS: OnceCell<Histogram> = OnceCell::new();

/// The Prometheus-backed implementation of the metric sinks.
#[derive(Debug, Clone, Copy)]
pub struct PrometheusSink;

/// Helper macro to reduce boilerplate for getting a metric from OnceCell.
/// Panics if `install()` has not been called, which indicates a critical
/// application setup error.
macro_rules! get_metric {
    ($metric:ident) => {
        $metric
            .get()
            .expect("Prometheus sink not initialized. Call telemetry::prometheus::install() first.")
    };
}

impl ControlMetricsSink for PrometheusSink {
    fn inc_runs_assigned(&self) {
        get_metric!(RUNS_ASSIGNED_TOTAL).inc();
    }
    fn inc_runs_completed(&self) {
        get_metric!(RUNS_COMPLETED_TOTAL).inc();
    }
    fn inc_runs_failed(&self) {
        get_metric!(RUNS_FAILED_TOTAL).inc();
    }
    fn inc_runs_retried(&self) {
        get_metric!(RUNS_RETRIED_TOTAL).inc();
    }
    fn inc_leases_expired(&self) {
        get_metric!(LEASES_EXPIRED_TOTAL).inc();
    }
    fn set_pending_runs(&self, count: u64) {
        get_metric!(PENDING_RUNS).set(count as f64);
    }
    fn set_connected_pullers(&self, count: u64) {
        get_metric!(CONNECTED_PULLERS).set(count as f64);
    }
    fn observe_dispatch_duration(&self, seconds: f64) {
        get_metric!(DISPATCH_DURATION_SECONDS).observe(seconds);
    }
}

impl WorkerMetricsSink for PrometheusSink {
    fn inc_leases_received(&self) {
        get_metric!(LEASES_RECEIVED_TOTAL).inc();
    }
    fn inc_leases_completed(&self) {
        get_metric!(LEASES_COMPLETED_TOTAL).inc();
    }
    fn inc_leases_failed(&self) {
        get_metric!(LEASES_FAILED_TOTAL).inc();
    }
    fn inc_dead_lettered(&self, reason: &str) {
        get_metric!(DEAD_LETTERED_TOTAL)
            .with_label_values(&[reason])
            .inc();
    }
    fn inc_sink_retries(&self) {
        get_metric!(SINK_RETRIES_TOTAL).inc();
    }
    fn set_active_leases(&self, count: u64) {
        get_metric!(ACTIVE_LEASES).set(count as f64);
    }
    fn observe_execution_duration(&self, seconds: f64) {
        get_metric!(EXECUTION_DURATION_SECONDS).observe(seconds);
    }
}

impl MetricsSink for PrometheusSink {}

/// Registers every Hive metric with the default Prometheus registry and
/// returns the sink to install into [`crate::sinks::SINK`].
pub fn install() -> Result<&'static PrometheusSink, prometheus::Error> {
    static SINK_INSTANCE: PrometheusSink = PrometheusSink;

    RUNS_ASSIGNED_TOTAL
        .get_or_try_init(|| {
            register_int_counter!("hive_runs_assigned_total", "Runs assigned to a node")
        })
        .map(|_| ())?;
    RUNS_COMPLETED_TOTAL
        .get_or_try_init(|| {
            register_int_counter!("hive_runs_completed_total", "Runs that reached completed")
        })
        .map(|_| ())?;
    RUNS_FAILED_TOTAL
        .get_or_try_init(|| {
            register_int_counter!("hive_runs_failed_total", "Runs that reached failed")
        })
        .map(|_| ())?;
    RUNS_RETRIED_TOTAL
        .get_or_try_init(|| {
            register_int_counter!("hive_runs_retried_total", "Runs returned to pending for retry")
        })
        .map(|_| ())?;
    LEASES_EXPIRED_TOTAL
        .get_or_try_init(|| {
            register_int_counter!("hive_leases_expired_total", "Leases reclaimed by TTL expiry")
        })
        .map(|_| ())?;
    PENDING_RUNS
        .get_or_try_init(|| register_gauge!("hive_pending_runs", "Runs waiting for placement"))
        .map(|_| ())?;
    CONNECTED_PULLERS
        .get_or_try_init(|| {
            register_gauge!("hive_connected_pullers", "Nodes with an open pull stream")
        })
        .map(|_| ())?;
    DISPATCH_DURATION_SECONDS
        .get_or_try_init(|| {
            register_histogram!(
                "hive_dispatch_duration_seconds",
                "Wall-clock duration of one dispatch tick",
                exponential_buckets(0.0005, 2.0, 14)?
            )
        })
        .map(|_| ())?;

    LEASES_RECEIVED_TOTAL
        .get_or_try_init(|| {
            register_int_counter!("hive_leases_received_total", "Lease grants received")
        })
        .map(|_| ())?;
    LEASES_COMPLETED_TOTAL
        .get_or_try_init(|| {
            register_int_counter!("hive_leases_completed_total", "Leases reported completed")
        })
        .map(|_| ())?;
    LEASES_FAILED_TOTAL
        .get_or_try_init(|| {
            register_int_counter!("hive_leases_failed_total", "Leases reported failed")
        })
        .map(|_| ())?;
    DEAD_LETTERED_TOTAL
        .get_or_try_init(|| {
            register_int_counter_vec!(
                "hive_dead_lettered_total",
                "Input messages routed to the dead-letter destination",
                &["reason"]
            )
        })
        .map(|_| ())?;
    SINK_RETRIES_TOTAL
        .get_or_try_init(|| {
            register_int_counter!("hive_sink_retries_total", "Output sink delivery retries")
        })
        .map(|_| ())?;
    ACTIVE_LEASES
        .get_or_try_init(|| register_gauge!("hive_active_leases", "Leases currently executing"))
        .map(|_| ())?;
    EXECUTION_DURATION_SECONDS
        .get_or_try_init(|| {
            register_histogram!(
                "hive_execution_duration_seconds",
                "End-to-end execution duration of one lease",
                exponential_buckets(0.01, 2.0, 14)?
            )
        })
        .map(|_| ())?;

    Ok(&SINK_INSTANCE)
}
