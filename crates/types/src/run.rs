//! Runs: one execution of one agent version against one external input.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Run lifecycle state.
///
/// Status advances monotonically, with one sanctioned reversal:
/// `assigned → pending` on lease expiry or a retryable failure. Terminal
/// states are final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    /// Waiting for placement.
    Pending,
    /// Leased to a node, not yet acknowledged.
    Assigned,
    /// Acknowledged and executing.
    Running,
    /// Finished successfully. Terminal.
    Completed,
    /// Finished unsuccessfully. Terminal.
    Failed,
    /// Cancelled by an operator. Terminal.
    Cancelled,
}

impl RunStatus {
    /// Whether this state is terminal and therefore immutable.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Assigned => "assigned",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Accumulated cost of one run.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct RunCosts {
    /// Prompt tokens consumed.
    pub tokens_in: u64,
    /// Completion tokens produced.
    pub tokens_out: u64,
    /// Estimated spend in USD.
    pub usd: f64,
}

/// Error information recorded on a failed or cancelled run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct RunErrorInfo {
    /// Short human-readable message.
    #[serde(default)]
    pub error_message: String,
    /// Longer diagnostics (stderr excerpts, status codes).
    #[serde(default)]
    pub error_details: String,
    /// Machine-readable reason, e.g. a cancellation reason.
    #[serde(default)]
    pub reason: String,
}

/// A single execution of an agent version, driven by one external input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    /// Opaque run identifier.
    pub id: String,
    /// The agent being executed.
    pub agent_id: String,
    /// The agent version being executed.
    pub version: String,
    /// The node holding the assignment. Set exactly while status is
    /// `assigned` or `running`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    /// Lifecycle state.
    pub status: RunStatus,
    /// Named phase durations in milliseconds (receive, execute, deliver, ...).
    #[serde(default)]
    pub timings_ms: BTreeMap<String, u64>,
    /// Token and spend accounting.
    #[serde(default)]
    pub costs: RunCosts,
    /// The delivered result envelope, stored on completion.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    /// Error info, populated on failure or cancellation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RunErrorInfo>,
    /// Retryable failures consumed so far. The control plane terminates the
    /// run once this reaches the policy maximum.
    #[serde(default)]
    pub retry_count: u32,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Timestamp of entry into a terminal state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub terminal_at: Option<DateTime<Utc>>,
}

impl Run {
    /// Creates a fresh pending run for `agent_id`/`version`.
    pub fn new_pending(agent_id: &str, version: &str) -> Self {
        Self {
            id: new_run_id(),
            agent_id: agent_id.to_string(),
            version: version.to_string(),
            node_id: None,
            status: RunStatus::Pending,
            timings_ms: BTreeMap::new(),
            costs: RunCosts::default(),
            result: None,
            error: None,
            retry_count: 0,
            created_at: Utc::now(),
            terminal_at: None,
        }
    }
}

/// Generates a fresh run identifier.
pub fn new_run_id() -> String {
    format!("run-{}", uuid::Uuid::new_v4())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states_are_exactly_the_final_three() {
        assert!(!RunStatus::Pending.is_terminal());
        assert!(!RunStatus::Assigned.is_terminal());
        assert!(!RunStatus::Running.is_terminal());
        assert!(RunStatus::Completed.is_terminal());
        assert!(RunStatus::Failed.is_terminal());
        assert!(RunStatus::Cancelled.is_terminal());
    }

    #[test]
    fn status_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&RunStatus::Assigned).unwrap(), "\"assigned\"");
    }
}
