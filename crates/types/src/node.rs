//! Worker node registration, capacity, and liveness state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A node is considered unreachable once its heartbeat is older than this.
pub const HEARTBEAT_TIMEOUT_SECONDS: i64 = 60;

/// Node lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeState {
    /// Registered and heartbeating; eligible for placement.
    Active,
    /// Shutting down; finishes in-flight runs, receives no new leases.
    Draining,
    /// Heartbeat stale; leases on it will expire and runs return to pending.
    Unreachable,
}

/// Declared execution capacity of a node. `slots` is the placement currency;
/// `cpu` and `memory` are advisory hints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct NodeCapacity {
    /// Concurrent run slots this node offers.
    #[serde(default)]
    pub slots: u32,
    /// Optional CPU hint (cores).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<f64>,
    /// Optional memory hint, e.g. "8Gi".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<String>,
}

/// Observed node status, reported by the worker in each heartbeat.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeStatus {
    /// Current lifecycle state.
    pub state: NodeState,
    /// Runs currently executing or assigned on this node.
    pub active_runs: u32,
    /// Remaining free slots.
    pub available_slots: u32,
}

/// A worker process instance registered with the control plane.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// Stable identifier chosen by the worker.
    pub id: String,
    /// Free-form labels; recognized keys include `region` and `environment`.
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
    /// Declared capacity.
    #[serde(default)]
    pub capacity: NodeCapacity,
    /// Last reported status.
    pub status: NodeStatus,
    /// Timestamp of the most recent accepted heartbeat.
    pub last_heartbeat: DateTime<Utc>,
}

impl Node {
    /// Age of the last heartbeat relative to `now`, in whole seconds.
    pub fn heartbeat_age_seconds(&self, now: DateTime<Utc>) -> i64 {
        (now - self.last_heartbeat).num_seconds()
    }

    /// Whether this node is eligible for placement at `now`: active and
    /// heartbeat-fresh.
    pub fn is_placeable(&self, now: DateTime<Utc>) -> bool {
        self.status.state == NodeState::Active
            && self.heartbeat_age_seconds(now) <= HEARTBEAT_TIMEOUT_SECONDS
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn node(state: NodeState, heartbeat_age: i64) -> Node {
        Node {
            id: "n1".into(),
            metadata: BTreeMap::new(),
            capacity: NodeCapacity { slots: 4, cpu: None, memory: None },
            status: NodeStatus { state, active_runs: 0, available_slots: 4 },
            last_heartbeat: Utc::now() - Duration::seconds(heartbeat_age),
        }
    }

    #[test]
    fn placeable_requires_active_and_fresh() {
        let now = Utc::now();
        assert!(node(NodeState::Active, 10).is_placeable(now));
        assert!(!node(NodeState::Active, 90).is_placeable(now));
        assert!(!node(NodeState::Draining, 10).is_placeable(now));
        assert!(!node(NodeState::Unreachable, 10).is_placeable(now));
    }
}
