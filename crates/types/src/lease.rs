//! Transient exclusive assignment records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A short, owner-stamped right to execute a run on a specific node.
///
/// At most one un-expired lease exists per run at any wall-clock instant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lease {
    /// The run this lease covers. Unique among live leases.
    pub run_id: String,
    /// The owning node.
    pub node_id: String,
    /// When the lease lapses and the run becomes reclaimable.
    pub expires_at: DateTime<Utc>,
}

/// The same primitive keyed by an arbitrary string, used for general
/// serialization such as the dispatch tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lock {
    /// Arbitrary lock key, e.g. `scheduler:tick`.
    pub key: String,
    /// The recorded owner. Release and extend require an owner match.
    pub owner_id: String,
    /// When the lock lapses.
    pub expires_at: DateTime<Utc>,
}
