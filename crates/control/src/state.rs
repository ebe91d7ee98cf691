//! Shared control-plane state: the store, the lease store, the event bus,
//! the puller registry, and policy configuration.

use crate::events::EventBus;
use hive_ipc::lease::LeaseGrant;
use hive_lease::LeaseStore;
use hive_storage::Store;
use hive_telemetry::control_metrics;
use hive_types::config::{DispatchConfig, LivenessConfig};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tonic::Status;

/// The sending half of one node's pull stream. The bounded channel doubles
/// as the puller's grant quota: a full channel means the node has unconsumed
/// grants and receives no more until it drains them.
pub type GrantSender = mpsc::Sender<Result<LeaseGrant, Status>>;

/// Connected pull streams, keyed by node id.
#[derive(Debug, Default)]
pub struct PullerRegistry {
    inner: Mutex<HashMap<String, GrantSender>>,
}

/// Why a grant could not be handed to a puller.
#[derive(Debug, PartialEq, Eq)]
pub enum GrantSendError {
    /// No open stream for the node.
    NotConnected,
    /// The node has unconsumed grants up to its quota.
    AtQuota,
    /// The stream closed; the registry entry was removed.
    Disconnected,
}

impl PullerRegistry {
    /// Registers (or replaces) the stream for `node_id`. A reconnecting node
    /// supersedes its previous stream.
    pub fn register(&self, node_id: &str, sender: GrantSender) {
        let mut inner = self.inner.lock();
        if inner.insert(node_id.to_string(), sender).is_some() {
            tracing::info!(target: "lease-service", node_id, "puller stream replaced");
        }
        control_metrics().set_connected_pullers(inner.len() as u64);
    }

    /// Drops the stream for `node_id`.
    pub fn remove(&self, node_id: &str) {
        let mut inner = self.inner.lock();
        inner.remove(node_id);
        control_metrics().set_connected_pullers(inner.len() as u64);
    }

    /// Whether `node_id` currently holds an open stream.
    pub fn is_connected(&self, node_id: &str) -> bool {
        self.inner.lock().contains_key(node_id)
    }

    /// Number of connected pullers.
    pub fn connected(&self) -> usize {
        self.inner.lock().len()
    }

    /// Hands a grant to the node's stream without blocking the dispatch
    /// tick. A closed stream evicts the puller.
    pub fn try_send(&self, node_id: &str, grant: LeaseGrant) -> Result<(), GrantSendError> {
        let mut inner = self.inner.lock();
        let Some(sender) = inner.get(node_id) else {
            return Err(GrantSendError::NotConnected);
        };
        match sender.try_send(Ok(grant)) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => Err(GrantSendError::AtQuota),
            Err(mpsc::error::TrySendError::Closed(_)) => {
                inner.remove(node_id);
                control_metrics().set_connected_pullers(inner.len() as u64);
                Err(GrantSendError::Disconnected)
            }
        }
    }
}

/// Everything the REST surface, lease service, dispatch tick, and reaper
/// share.
#[derive(Debug)]
pub struct AppState {
    /// Entity storage.
    pub store: Arc<dyn Store>,
    /// Lease and advisory-lock store.
    pub leases: Arc<LeaseStore>,
    /// Run transition events.
    pub events: EventBus,
    /// Connected pull streams.
    pub pullers: PullerRegistry,
    /// Dispatch policy.
    pub dispatch: DispatchConfig,
    /// Liveness policy.
    pub liveness: LivenessConfig,
    /// This control-plane instance's identity, used as the advisory-lock
    /// owner for the dispatch tick.
    pub instance_id: String,
}

/// The shared handle passed to every component.
pub type SharedState = Arc<AppState>;

impl AppState {
    /// Builds the state around a store and policy configuration.
    pub fn new(
        store: Arc<dyn Store>,
        dispatch: DispatchConfig,
        liveness: LivenessConfig,
    ) -> SharedState {
        Arc::new(Self {
            store,
            leases: Arc::new(LeaseStore::new()),
            events: EventBus::default(),
            pullers: PullerRegistry::default(),
            dispatch,
            liveness,
            instance_id: format!("control-{}", uuid::Uuid::new_v4()),
        })
    }
}
