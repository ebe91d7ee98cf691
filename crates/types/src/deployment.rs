//! Deployments: the intention to run a specific agent version in an
//! environment, with replica and placement targets.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A placement constraint value: either a single value a node's metadata key
/// must equal, or a list of acceptable values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConstraintValue {
    /// The node's metadata value must equal this value exactly.
    One(serde_json::Value),
    /// The node's metadata value must be a member of this list.
    Many(Vec<serde_json::Value>),
}

impl ConstraintValue {
    /// Whether a node metadata value satisfies this constraint. Comparison is
    /// exact and case-sensitive.
    pub fn matches(&self, candidate: &serde_json::Value) -> bool {
        match self {
            Self::One(v) => v == candidate,
            Self::Many(vs) => vs.iter().any(|v| v == candidate),
        }
    }
}

/// A map of placement constraints keyed by node metadata key.
pub type PlacementConstraints = BTreeMap<String, ConstraintValue>;

/// Replica and placement targets for a deployment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentTarget {
    /// Desired replica count, at least 1.
    pub replicas: u32,
    /// Placement constraints on node metadata.
    #[serde(default)]
    pub placement: PlacementConstraints,
}

/// Deployment lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentState {
    /// Accepted, not yet rolling out.
    Pending,
    /// Rollout in progress.
    Deploying,
    /// All targeted replicas ready.
    Active,
    /// Rollout failed. Only an operator-initiated redeploy overwrites this.
    Failed,
}

/// Observed deployment status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentStatus {
    /// Current lifecycle state.
    pub state: DeploymentState,
    /// Replicas currently serving.
    pub ready_replicas: u32,
    /// When the status last changed.
    pub updated_at: DateTime<Utc>,
}

/// An intention to run a specific agent version in an environment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Deployment {
    /// Opaque deployment identifier.
    pub id: String,
    /// The agent being deployed.
    pub agent_id: String,
    /// The agent version being deployed (SemVer).
    pub version: String,
    /// Environment tag, e.g. "production".
    pub environment: String,
    /// Replica and placement targets.
    pub target: DeploymentTarget,
    /// Observed status.
    pub status: DeploymentStatus,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
}

/// Generates a fresh deployment identifier.
pub fn new_deployment_id() -> String {
    format!("deploy-{}", uuid::Uuid::new_v4())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn constraint_matches_single_and_list() {
        let one = ConstraintValue::One(json!("us-east-1"));
        assert!(one.matches(&json!("us-east-1")));
        assert!(!one.matches(&json!("US-EAST-1")));

        let many = ConstraintValue::Many(vec![json!("a"), json!("b")]);
        assert!(many.matches(&json!("b")));
        assert!(!many.matches(&json!("c")));
    }

    #[test]
    fn constraint_value_deserializes_untagged() {
        let single: ConstraintValue = serde_json::from_value(json!("eu-west-1")).unwrap();
        assert_eq!(single, ConstraintValue::One(json!("eu-west-1")));

        let list: ConstraintValue = serde_json::from_value(json!(["a", "b"])).unwrap();
        assert_eq!(list, ConstraintValue::Many(vec![json!("a"), json!("b")]));
    }
}
