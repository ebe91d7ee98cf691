//! Shared configuration structures for the Hive control plane and worker.
//!
//! Both binaries load a single toml document, deserialize it into these
//! structs, and call `validate()` before starting. Defaults follow the
//! platform's documented policy values.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// --- Control plane -----------------------------------------------------------

/// Listener addresses for the control-plane surfaces.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenConfig {
    /// REST API address.
    #[serde(default = "default_rest_addr")]
    pub rest_addr: String,
    /// gRPC lease-service address.
    #[serde(default = "default_grpc_addr")]
    pub grpc_addr: String,
    /// Telemetry (`/metrics`, `/healthz`, `/readyz`) address.
    #[serde(default = "default_telemetry_addr")]
    pub telemetry_addr: String,
}

fn default_rest_addr() -> String {
    "127.0.0.1:8080".to_string()
}
fn default_grpc_addr() -> String {
    "127.0.0.1:8090".to_string()
}
fn default_telemetry_addr() -> String {
    "127.0.0.1:9615".to_string()
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            rest_addr: default_rest_addr(),
            grpc_addr: default_grpc_addr(),
            telemetry_addr: default_telemetry_addr(),
        }
    }
}

/// Selects the storage backend for the control plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// Volatile in-process store; development and tests.
    #[default]
    Memory,
    /// Embedded redb database at `path`.
    Redb,
}

/// Storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StorageConfig {
    /// Which backend to open.
    #[serde(default)]
    pub backend: StorageBackend,
    /// Database file path, required for the redb backend.
    #[serde(default)]
    pub path: Option<String>,
}

/// Dispatch-tick policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// TTL stamped on each lease, seconds.
    #[serde(default = "default_lease_ttl_seconds")]
    pub lease_ttl_seconds: u64,
    /// Polling interval of the dispatch tick, milliseconds.
    #[serde(default = "default_dispatch_interval_ms")]
    pub interval_ms: u64,
    /// Retryable failures allowed per run before it terminates as failed.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_lease_ttl_seconds() -> u64 {
    30
}
fn default_dispatch_interval_ms() -> u64 {
    500
}
fn default_max_retries() -> u32 {
    3
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            lease_ttl_seconds: default_lease_ttl_seconds(),
            interval_ms: default_dispatch_interval_ms(),
            max_retries: default_max_retries(),
        }
    }
}

/// Node-liveness policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LivenessConfig {
    /// Heartbeat age beyond which a node is marked unreachable, seconds.
    #[serde(default = "default_heartbeat_timeout_seconds")]
    pub heartbeat_timeout_seconds: u64,
    /// How often the reaper scans, seconds.
    #[serde(default = "default_reap_interval_seconds")]
    pub reap_interval_seconds: u64,
}

fn default_heartbeat_timeout_seconds() -> u64 {
    60
}
fn default_reap_interval_seconds() -> u64 {
    5
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout_seconds: default_heartbeat_timeout_seconds(),
            reap_interval_seconds: default_reap_interval_seconds(),
        }
    }
}

/// Top-level control-plane configuration (`control-plane.toml`).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ControlPlaneConfig {
    /// Listener addresses.
    #[serde(default)]
    pub listen: ListenConfig,
    /// Storage backend selection.
    #[serde(default)]
    pub storage: StorageConfig,
    /// Dispatch-tick policy.
    #[serde(default)]
    pub dispatch: DispatchConfig,
    /// Liveness policy.
    #[serde(default)]
    pub liveness: LivenessConfig,
}

impl ControlPlaneConfig {
    /// Validates cross-field invariants. Returns a message per violation.
    pub fn validate(&self) -> Result<(), String> {
        let mut errors = Vec::new();
        if self.dispatch.lease_ttl_seconds == 0 {
            errors.push("dispatch.lease_ttl_seconds must be positive".to_string());
        }
        if self.dispatch.interval_ms == 0 {
            errors.push("dispatch.interval_ms must be positive".to_string());
        }
        if self.liveness.heartbeat_timeout_seconds == 0 {
            errors.push("liveness.heartbeat_timeout_seconds must be positive".to_string());
        }
        if self.storage.backend == StorageBackend::Redb && self.storage.path.is_none() {
            errors.push("storage.path is required for the redb backend".to_string());
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors.join("; "))
        }
    }
}

// --- Worker ------------------------------------------------------------------

/// Identity, capacity, and cadence of one worker node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeRuntimeConfig {
    /// Stable node identifier. Required.
    pub node_id: String,
    /// Base URL of the control-plane REST API. Required.
    pub control_plane_url: String,
    /// gRPC address of the lease service. Defaults to the control-plane host
    /// with the standard gRPC port when omitted.
    #[serde(default)]
    pub lease_service_url: Option<String>,
    /// Width of the lease-processing semaphore.
    #[serde(default = "default_max_concurrent_leases")]
    pub max_concurrent_leases: u32,
    /// Heartbeat cadence, seconds.
    #[serde(default = "default_heartbeat_interval_seconds")]
    pub heartbeat_interval_seconds: u64,
    /// How long shutdown waits for in-flight leases, seconds.
    #[serde(default = "default_drain_window_seconds")]
    pub drain_window_seconds: u64,
    /// Declared capacity.
    #[serde(default)]
    pub capacity: crate::node::NodeCapacity,
    /// Free-form labels matched against placement constraints.
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

fn default_max_concurrent_leases() -> u32 {
    5
}
fn default_heartbeat_interval_seconds() -> u64 {
    30
}
fn default_drain_window_seconds() -> u64 {
    30
}

/// Input-queue connector settings (peek-lock broker semantics).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Broker connection string. The in-memory broker ignores it.
    #[serde(default)]
    pub connection_string: String,
    /// Queue to receive from.
    #[serde(default = "default_queue_name")]
    pub queue_name: String,
    /// Messages prefetched by the broker client.
    #[serde(default = "default_prefetch_count")]
    pub prefetch_count: u32,
    /// Broker-side concurrent delivery limit.
    #[serde(default = "default_max_concurrent_calls")]
    pub max_concurrent_calls: u32,
    /// How long a receive waits for a message, seconds.
    #[serde(default = "default_max_wait_time_seconds")]
    pub max_wait_time_seconds: u64,
    /// Delivery count beyond which a message is poison.
    #[serde(default = "default_max_delivery_count")]
    pub max_delivery_count: u32,
    /// Whether the broker completes messages on receive. The pipeline
    /// requires explicit completion and rejects `true`.
    #[serde(default)]
    pub auto_complete: bool,
    /// Receive mode. Only "PeekLock" is supported.
    #[serde(default = "default_receive_mode")]
    pub receive_mode: String,
}

fn default_queue_name() -> String {
    "agent-input".to_string()
}
fn default_prefetch_count() -> u32 {
    16
}
fn default_max_concurrent_calls() -> u32 {
    5
}
fn default_max_wait_time_seconds() -> u64 {
    5
}
fn default_max_delivery_count() -> u32 {
    3
}
fn default_receive_mode() -> String {
    "PeekLock".to_string()
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            connection_string: String::new(),
            queue_name: default_queue_name(),
            prefetch_count: default_prefetch_count(),
            max_concurrent_calls: default_max_concurrent_calls(),
            max_wait_time_seconds: default_max_wait_time_seconds(),
            max_delivery_count: default_max_delivery_count(),
            auto_complete: false,
            receive_mode: default_receive_mode(),
        }
    }
}

/// Model-provider endpoint settings for the sandbox executor.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct FoundryConfig {
    /// Base URL of the OpenAI-compatible chat endpoint.
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Deployment (model) name used when the profile does not name one.
    #[serde(default)]
    pub deployment_name: Option<String>,
    /// API key. When absent with `use_managed_identity = false`, the executor
    /// falls back to the mock provider.
    #[serde(default)]
    pub api_key: Option<String>,
    /// Use ambient platform identity instead of an API key.
    #[serde(default)]
    pub use_managed_identity: bool,
}

/// Agent-execution defaults applied when the agent spec leaves them unset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRuntimeConfig {
    /// Model requested when the profile has none.
    #[serde(default = "default_model")]
    pub default_model: String,
    /// Sampling temperature.
    #[serde(default = "default_temperature")]
    pub default_temperature: f64,
    /// Completion-token ceiling.
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    /// Wall-clock budget per run, seconds.
    #[serde(default = "default_max_duration_seconds")]
    pub max_duration_seconds: u64,
    /// Path to the `agent-exec` child binary. Defaults to looking next to
    /// the worker binary.
    #[serde(default)]
    pub executor_path: Option<String>,
    /// Model-provider endpoint.
    #[serde(default)]
    pub foundry: FoundryConfig,
}

fn default_model() -> String {
    "gpt-4o".to_string()
}
fn default_temperature() -> f64 {
    0.7
}
fn default_max_tokens() -> u32 {
    4000
}
fn default_max_duration_seconds() -> u64 {
    60
}

impl Default for AgentRuntimeConfig {
    fn default() -> Self {
        Self {
            default_model: default_model(),
            default_temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            max_duration_seconds: default_max_duration_seconds(),
            executor_path: None,
            foundry: FoundryConfig::default(),
        }
    }
}

/// HTTP output-sink settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Destination endpoint for run results.
    pub endpoint: String,
    /// Per-request timeout, seconds.
    #[serde(default = "default_sink_timeout_seconds")]
    pub timeout_seconds: u64,
    /// Retry attempts after the first try.
    #[serde(default = "default_sink_max_retries")]
    pub max_retries: u32,
    /// Base backoff delay, milliseconds. Doubled per attempt.
    #[serde(default = "default_sink_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Backoff ceiling, milliseconds.
    #[serde(default = "default_sink_max_retry_delay_ms")]
    pub max_retry_delay_ms: u64,
    /// Extra headers attached to every delivery.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

fn default_sink_timeout_seconds() -> u64 {
    30
}
fn default_sink_max_retries() -> u32 {
    3
}
fn default_sink_base_delay_ms() -> u64 {
    200
}
fn default_sink_max_retry_delay_ms() -> u64 {
    5000
}

/// Top-level worker configuration (`worker.toml`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Node identity and cadence.
    pub node_runtime: NodeRuntimeConfig,
    /// Input-queue connector.
    #[serde(default)]
    pub queue: QueueConfig,
    /// Agent-execution defaults.
    #[serde(default)]
    pub agent_runtime: AgentRuntimeConfig,
    /// HTTP output sink.
    pub output: OutputConfig,
    /// Telemetry address for this worker.
    #[serde(default = "default_worker_telemetry_addr")]
    pub telemetry_addr: String,
}

fn default_worker_telemetry_addr() -> String {
    "127.0.0.1:9616".to_string()
}

impl WorkerConfig {
    /// Validates cross-field invariants. Returns a message per violation.
    pub fn validate(&self) -> Result<(), String> {
        let mut errors = Vec::new();
        if self.node_runtime.node_id.trim().is_empty() {
            errors.push("node_runtime.node_id is required".to_string());
        }
        if self.node_runtime.control_plane_url.trim().is_empty() {
            errors.push("node_runtime.control_plane_url is required".to_string());
        }
        if self.node_runtime.max_concurrent_leases == 0 {
            errors.push("node_runtime.max_concurrent_leases must be positive".to_string());
        }
        if self.node_runtime.capacity.slots == 0 {
            errors.push("node_runtime.capacity.slots must be positive".to_string());
        }
        if self.queue.auto_complete {
            errors.push("queue.auto_complete is not supported; the pipeline completes messages explicitly".to_string());
        }
        if self.queue.receive_mode != "PeekLock" {
            errors.push(format!(
                "queue.receive_mode '{}' is not supported (only PeekLock)",
                self.queue.receive_mode
            ));
        }
        if self.agent_runtime.max_duration_seconds == 0 {
            errors.push("agent_runtime.max_duration_seconds must be positive".to_string());
        }
        if self.output.endpoint.trim().is_empty() {
            errors.push("output.endpoint is required".to_string());
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors.join("; "))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_plane_defaults_parse_from_empty_document() {
        let cfg: ControlPlaneConfig = toml::from_str("").unwrap();
        assert_eq!(cfg.dispatch.lease_ttl_seconds, 30);
        assert_eq!(cfg.dispatch.interval_ms, 500);
        assert_eq!(cfg.dispatch.max_retries, 3);
        assert_eq!(cfg.liveness.heartbeat_timeout_seconds, 60);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn redb_backend_requires_a_path() {
        let cfg: ControlPlaneConfig = toml::from_str(
            r#"
            [storage]
            backend = "redb"
            "#,
        )
        .unwrap();
        assert!(cfg.validate().unwrap_err().contains("storage.path"));
    }

    #[test]
    fn worker_config_parses_with_defaults() {
        let cfg: WorkerConfig = toml::from_str(
            r#"
            [node_runtime]
            node_id = "node-a"
            control_plane_url = "http://127.0.0.1:8080"

            [node_runtime.capacity]
            slots = 4

            [output]
            endpoint = "http://127.0.0.1:9000/results"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.node_runtime.max_concurrent_leases, 5);
        assert_eq!(cfg.node_runtime.heartbeat_interval_seconds, 30);
        assert_eq!(cfg.queue.max_delivery_count, 3);
        assert_eq!(cfg.queue.receive_mode, "PeekLock");
        assert_eq!(cfg.agent_runtime.max_duration_seconds, 60);
        assert_eq!(cfg.output.max_retries, 3);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn worker_validation_collects_violations() {
        let cfg: WorkerConfig = toml::from_str(
            r#"
            [node_runtime]
            node_id = ""
            control_plane_url = ""

            [queue]
            auto_complete = true

            [output]
            endpoint = ""
            "#,
        )
        .unwrap();
        let msg = cfg.validate().unwrap_err();
        assert!(msg.contains("node_id"));
        assert!(msg.contains("auto_complete"));
        assert!(msg.contains("output.endpoint"));
    }
}
