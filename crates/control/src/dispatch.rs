//! The dispatch tick: pending runs become leases on connected pullers.
//!
//! Each tick (serialized under the `scheduler:tick` advisory lock, so
//! multi-replica deployments degrade safely to a single dispatcher):
//! 1. Renew leases of runs still executing on heartbeat-fresh nodes.
//! 2. Reconcile expired leases: assigned/running runs whose lease lapsed
//!    return to pending.
//! 3. Walk pending runs in creation order, place each with the scheduler,
//!    acquire the lease, and stream the grant to the chosen node.

use crate::state::SharedState;
use chrono::Utc;
use hive_ipc::lease::LeaseGrant;
use hive_telemetry::control_metrics;
use hive_telemetry::time::DispatchTimer;
use hive_types::agent::AgentSnapshot;
use hive_types::deployment::PlacementConstraints;
use hive_types::error::ControlError;
use hive_types::run::{Run, RunStatus};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// TTL on the dispatch advisory lock; generously above one tick.
const TICK_LOCK_TTL_SECONDS: i64 = 30;

/// Drives the dispatch loop.
#[derive(Debug)]
pub struct Dispatcher {
    state: SharedState,
}

impl Dispatcher {
    /// Wraps the shared state.
    pub fn new(state: SharedState) -> Self {
        Self { state }
    }

    /// Ticks until cancelled.
    pub async fn run(&self, cancel: CancellationToken) {
        let interval = Duration::from_millis(self.state.dispatch.interval_ms);
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if let Err(e) = self.tick().await {
                // Dispatch errors are loop-local; the next tick retries.
                tracing::error!(target: "dispatch", error = %e, "tick failed");
            }
        }
    }

    /// One dispatch pass. Public so tests can drive it deterministically.
    pub async fn tick(&self) -> Result<(), ControlError> {
        let state = &self.state;
        if !state
            .leases
            .acquire_lock("scheduler:tick", &state.instance_id, TICK_LOCK_TTL_SECONDS)?
        {
            // Another replica holds the tick.
            return Ok(());
        }
        let result = self.tick_locked().await;
        state.leases.release_lock("scheduler:tick", &state.instance_id);
        result
    }

    async fn tick_locked(&self) -> Result<(), ControlError> {
        let _timer = DispatchTimer::new(control_metrics());
        self.extend_running().await?;
        self.reconcile_expired().await?;
        self.assign_pending().await
    }

    /// Keeps leases alive for runs that are actively executing on
    /// heartbeat-fresh nodes, so a lease shorter than the run's duration
    /// budget does not bounce a healthy run. A lease is topped up once it
    /// has less than half its TTL remaining; execution hangs are still
    /// bounded because a node that stops heartbeating stops earning
    /// extensions.
    async fn extend_running(&self) -> Result<(), ControlError> {
        let state = &self.state;
        let now = Utc::now();
        let ttl = state.dispatch.lease_ttl_seconds as i64;
        let nodes = state.store.list_nodes().await?;
        for run in state.store.list_runs().await? {
            if run.status != RunStatus::Running {
                continue;
            }
            let Some(node_id) = run.node_id.as_deref() else {
                continue;
            };
            let fresh = nodes
                .iter()
                .any(|n| n.id == node_id && n.is_placeable(now));
            if !fresh {
                continue;
            }
            if let Some(lease) = state.leases.get_lease(&run.id) {
                let remaining = (lease.expires_at - now).num_seconds();
                if remaining < ttl / 2 {
                    let _ = state.leases.extend_lease(&run.id, node_id, ttl)?;
                }
            }
        }
        Ok(())
    }

    /// Returns assigned/running runs whose lease lapsed back to pending.
    async fn reconcile_expired(&self) -> Result<(), ControlError> {
        let state = &self.state;
        let runs = state.store.list_runs().await?;
        for run in runs {
            let live = matches!(run.status, RunStatus::Assigned | RunStatus::Running);
            if !live || state.leases.get_lease(&run.id).is_some() {
                continue;
            }
            let from = run.status;
            let node_id = run.node_id.clone();
            let mut reverted = run;
            reverted.status = RunStatus::Pending;
            reverted.node_id = None;
            match state.store.update_run(reverted).await {
                Ok(run) => {
                    control_metrics().inc_leases_expired();
                    state
                        .events
                        .publish(&run.id, from, RunStatus::Pending, node_id.as_deref());
                    tracing::warn!(
                        target: "dispatch",
                        run_id = %run.id,
                        node_id = node_id.as_deref().unwrap_or("-"),
                        "lease expired; run returned to pending"
                    );
                }
                Err(e) => {
                    tracing::warn!(target: "dispatch", error = %e, "expiry revert failed");
                }
            }
        }
        Ok(())
    }

    /// Places pending runs FIFO by creation time.
    async fn assign_pending(&self) -> Result<(), ControlError> {
        let state = &self.state;
        let now = Utc::now();
        let nodes = state.store.list_nodes().await?;
        let mut all_runs = state.store.list_runs().await?;
        let deployments = state.store.list_deployments().await?;

        let mut pending: Vec<Run> = all_runs
            .iter()
            .filter(|r| r.status == RunStatus::Pending && r.node_id.is_none())
            .cloned()
            .collect();
        pending.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        control_metrics().set_pending_runs(pending.len() as u64);

        for run in pending {
            let constraints = constraints_for_run(&run, &deployments);
            let Some(node_id) = hive_scheduler::select_node(&nodes, &all_runs, &constraints, now)
            else {
                continue;
            };
            // The scheduler may pick a node without an open stream; such a
            // node cannot receive the grant, so skip without leasing.
            if !state.pullers.is_connected(&node_id) {
                continue;
            }

            let ttl = state.dispatch.lease_ttl_seconds as i64;
            if !state.leases.acquire_lease(&run.id, &node_id, ttl)? {
                continue;
            }

            let snapshot = match self.resolve_snapshot(&run).await {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    state.leases.admin_release(&run.id);
                    tracing::warn!(target: "dispatch", run_id = %run.id, error = %e, "snapshot resolution failed");
                    continue;
                }
            };

            let mut assigned = run.clone();
            assigned.status = RunStatus::Assigned;
            assigned.node_id = Some(node_id.clone());
            if let Err(e) = state.store.update_run(assigned.clone()).await {
                state.leases.admin_release(&run.id);
                tracing::warn!(target: "dispatch", run_id = %run.id, error = %e, "assignment write failed");
                continue;
            }

            let expires_at = state
                .leases
                .get_lease(&run.id)
                .map(|l| l.expires_at.timestamp_millis())
                .unwrap_or_else(|| (now + chrono::Duration::seconds(ttl)).timestamp_millis());
            let grant = LeaseGrant {
                lease_id: format!("lease-{}", uuid::Uuid::new_v4()),
                run_id: run.id.clone(),
                agent_spec: serde_json::to_string(&snapshot)
                    .map_err(|e| ControlError::Transport(e.to_string()))?,
                expires_at_unix_ms: expires_at,
            };

            match state.pullers.try_send(&node_id, grant) {
                Ok(()) => {
                    control_metrics().inc_runs_assigned();
                    state
                        .events
                        .publish(&run.id, RunStatus::Pending, RunStatus::Assigned, Some(&node_id));
                    tracing::info!(target: "dispatch", run_id = %run.id, node_id = %node_id, "run assigned");
                    // Later runs in this pass must see the new load.
                    if let Some(slot) = all_runs.iter_mut().find(|r| r.id == run.id) {
                        *slot = assigned;
                    }
                }
                Err(reason) => {
                    // Undo: the node never saw the grant.
                    state.leases.admin_release(&run.id);
                    let mut reverted = assigned;
                    reverted.status = RunStatus::Pending;
                    reverted.node_id = None;
                    if let Err(e) = state.store.update_run(reverted).await {
                        tracing::warn!(target: "dispatch", run_id = %run.id, error = %e, "grant revert failed");
                    }
                    tracing::debug!(target: "dispatch", run_id = %run.id, node_id = %node_id, ?reason, "grant not sent");
                }
            }
        }
        Ok(())
    }

    /// Resolves the effective agent spec for a run's version, walking back
    /// through "no spec change" versions to the newest snapshot, and
    /// falling back to the agent's head definition.
    async fn resolve_snapshot(&self, run: &Run) -> Result<AgentSnapshot, ControlError> {
        let store = &self.state.store;
        let version = store.get_version(&run.agent_id, &run.version).await?;
        let spec = match version.spec {
            Some(spec) => spec,
            None => {
                let older_snapshot = store
                    .list_versions(&run.agent_id)
                    .await?
                    .into_iter()
                    .filter(|v| v.created_at <= version.created_at)
                    .find_map(|v| v.spec);
                match older_snapshot {
                    Some(spec) => spec,
                    None => store.get_agent(&run.agent_id).await?,
                }
            }
        };
        Ok(AgentSnapshot {
            agent_id: run.agent_id.clone(),
            version: run.version.clone(),
            spec,
        })
    }
}

/// Derives placement constraints from the run's deployment: the most
/// recently updated deployment targeting the run's agent and version wins;
/// no deployment means no constraints.
pub fn constraints_for_run(
    run: &Run,
    deployments: &[hive_types::deployment::Deployment],
) -> PlacementConstraints {
    deployments
        .iter()
        .filter(|d| d.agent_id == run.agent_id && d.version == run.version)
        .max_by_key(|d| d.status.updated_at)
        .map(|d| d.target.placement.clone())
        .unwrap_or_default()
}
