//! The heartbeat-based liveness reaper.
//!
//! Nodes whose heartbeat age exceeds the timeout are marked unreachable and
//! their non-terminal runs forced back to pending; the lease TTL clears any
//! remaining lease shortly after, and the dispatch tick re-places the runs.

use crate::state::SharedState;
use chrono::Utc;
use hive_types::node::NodeState;
use hive_types::run::RunStatus;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Drives the liveness scan.
#[derive(Debug)]
pub struct Reaper {
    state: SharedState,
}

impl Reaper {
    /// Wraps the shared state.
    pub fn new(state: SharedState) -> Self {
        Self { state }
    }

    /// Scans until cancelled.
    pub async fn run(&self, cancel: CancellationToken) {
        let interval = Duration::from_secs(self.state.liveness.reap_interval_seconds);
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if let Err(e) = self.reap_once().await {
                tracing::error!(target: "liveness", error = %e, "reap pass failed");
            }
        }
    }

    /// One scan pass. Public so tests can drive it deterministically.
    pub async fn reap_once(&self) -> Result<(), hive_types::error::StoreError> {
        let state = &self.state;
        let now = Utc::now();
        let timeout = state.liveness.heartbeat_timeout_seconds as i64;

        for node in state.store.list_nodes().await? {
            let stale = node.heartbeat_age_seconds(now) > timeout;
            if !stale || node.status.state == NodeState::Unreachable {
                continue;
            }
            tracing::warn!(
                target: "liveness",
                node_id = %node.id,
                heartbeat_age = node.heartbeat_age_seconds(now),
                "node unreachable; reclaiming its runs"
            );
            let mut unreachable = node.clone();
            unreachable.status.state = NodeState::Unreachable;
            state.store.upsert_node(unreachable).await?;
            self.state.pullers.remove(&node.id);

            for run in state.store.list_runs().await? {
                let held = matches!(run.status, RunStatus::Assigned | RunStatus::Running)
                    && run.node_id.as_deref() == Some(node.id.as_str());
                if !held {
                    continue;
                }
                let from = run.status;
                state.leases.admin_release(&run.id);
                let mut reverted = run;
                reverted.status = RunStatus::Pending;
                reverted.node_id = None;
                match state.store.update_run(reverted).await {
                    Ok(run) => {
                        state
                            .events
                            .publish(&run.id, from, RunStatus::Pending, Some(&node.id));
                    }
                    Err(e) => {
                        tracing::warn!(target: "liveness", error = %e, "run reclaim failed");
                    }
                }
            }
        }
        Ok(())
    }
}
