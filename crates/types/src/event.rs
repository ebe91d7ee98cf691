//! Run state-transition events published on the control-plane event bus.

use crate::run::RunStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One observed run state transition. Published for every transition the
/// control plane performs; consumption is out of scope for the platform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunEvent {
    /// The run that transitioned.
    pub run_id: String,
    /// The state the run left.
    pub from: RunStatus,
    /// The state the run entered.
    pub to: RunStatus,
    /// The node involved, when the transition concerns an assignment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    /// When the transition was recorded.
    pub at: DateTime<Utc>,
}
