#![forbid(unsafe_code)]

//! # Hive Storage
//!
//! Durable state for agents, versions, deployments, nodes, and runs behind
//! the [`Store`] contract. Two backends: [`MemoryStore`] for development and
//! tests, and [`RedbStore`] (embedded redb database, JSON-encoded values) for
//! production.
//!
//! Run terminal transitions (`complete_run`, `fail_run`, `cancel_run`) are
//! append-only: once a run is terminal, further transitions are rejected
//! with `Conflict` and write nothing.

use async_trait::async_trait;
use chrono::Utc;
use hive_types::agent::AgentSpec;
use hive_types::deployment::Deployment;
use hive_types::error::StoreError;
use hive_types::node::Node;
use hive_types::run::{Run, RunCosts, RunErrorInfo, RunStatus};
use hive_types::version::AgentVersion;
use std::collections::BTreeMap;

mod memory;
mod redb_store;

pub use memory::MemoryStore;
pub use redb_store::RedbStore;

/// The storage contract used by the control plane.
///
/// Per-entity operations are strongly consistent; there are no cross-entity
/// transactions beyond the implicit "delete agent cascades versions and
/// deployments". Backend failures surface as [`StoreError::Backend`] and are
/// safe to retry.
#[async_trait]
pub trait Store: Send + Sync + std::fmt::Debug {
    // --- Agents ---

    /// Persists a new agent. `Conflict` if the id is taken.
    async fn create_agent(&self, spec: AgentSpec) -> Result<AgentSpec, StoreError>;
    /// Fetches an agent by id.
    async fn get_agent(&self, id: &str) -> Result<AgentSpec, StoreError>;
    /// Lists all agents.
    async fn list_agents(&self) -> Result<Vec<AgentSpec>, StoreError>;
    /// Replaces an existing agent definition.
    async fn update_agent(&self, spec: AgentSpec) -> Result<AgentSpec, StoreError>;
    /// Deletes an agent and cascades its versions and deployments.
    async fn delete_agent(&self, id: &str) -> Result<(), StoreError>;

    // --- Versions ---

    /// Persists an immutable version snapshot. `Conflict` if
    /// `(agent_id, version)` exists; `NotFound` if the agent does not.
    async fn create_version(&self, version: AgentVersion) -> Result<AgentVersion, StoreError>;
    /// Fetches one version.
    async fn get_version(&self, agent_id: &str, version: &str)
        -> Result<AgentVersion, StoreError>;
    /// Lists an agent's versions, newest first.
    async fn list_versions(&self, agent_id: &str) -> Result<Vec<AgentVersion>, StoreError>;

    // --- Deployments ---

    /// Persists a new deployment.
    async fn create_deployment(&self, deployment: Deployment) -> Result<Deployment, StoreError>;
    /// Fetches a deployment by id.
    async fn get_deployment(&self, id: &str) -> Result<Deployment, StoreError>;
    /// Lists all deployments.
    async fn list_deployments(&self) -> Result<Vec<Deployment>, StoreError>;
    /// Lists deployments that target `agent_id`.
    async fn list_deployments_for_agent(
        &self,
        agent_id: &str,
    ) -> Result<Vec<Deployment>, StoreError>;
    /// Replaces an existing deployment.
    async fn update_deployment(&self, deployment: Deployment) -> Result<Deployment, StoreError>;
    /// Deletes a deployment.
    async fn delete_deployment(&self, id: &str) -> Result<(), StoreError>;

    // --- Nodes ---

    /// Creates or replaces a node registration. Registration is idempotent.
    async fn upsert_node(&self, node: Node) -> Result<Node, StoreError>;
    /// Fetches a node by id.
    async fn get_node(&self, id: &str) -> Result<Node, StoreError>;
    /// Lists all nodes.
    async fn list_nodes(&self) -> Result<Vec<Node>, StoreError>;
    /// Deregisters a node.
    async fn delete_node(&self, id: &str) -> Result<(), StoreError>;

    // --- Runs ---

    /// Persists a new run.
    async fn create_run(&self, run: Run) -> Result<Run, StoreError>;
    /// Fetches a run by id.
    async fn get_run(&self, id: &str) -> Result<Run, StoreError>;
    /// Lists all runs.
    async fn list_runs(&self) -> Result<Vec<Run>, StoreError>;
    /// Replaces a non-terminal run record. Rejected with `Conflict` once the
    /// stored run is terminal.
    async fn update_run(&self, run: Run) -> Result<Run, StoreError>;

    /// Transitions a run to `completed`, stamping `terminal_at` and
    /// persisting timings and costs.
    async fn complete_run(
        &self,
        run_id: &str,
        timings_ms: BTreeMap<String, u64>,
        costs: RunCosts,
    ) -> Result<Run, StoreError>;

    /// Transitions a run to `failed` with error info and timings.
    async fn fail_run(
        &self,
        run_id: &str,
        error_message: &str,
        error_details: &str,
        timings_ms: BTreeMap<String, u64>,
    ) -> Result<Run, StoreError>;

    /// Transitions a run to `cancelled` with a reason.
    async fn cancel_run(&self, run_id: &str, reason: &str) -> Result<Run, StoreError>;
}

// --- Shared transition logic -------------------------------------------------
// Both backends funnel run mutations through these helpers so the terminal
// monotonicity invariant lives in exactly one place.

fn guard_not_terminal(run: &Run) -> Result<(), StoreError> {
    if run.status.is_terminal() {
        return Err(StoreError::Conflict(format!(
            "run '{}' is already terminal ({})",
            run.id, run.status
        )));
    }
    Ok(())
}

pub(crate) fn apply_complete(
    run: &mut Run,
    timings_ms: BTreeMap<String, u64>,
    costs: RunCosts,
) -> Result<(), StoreError> {
    guard_not_terminal(run)?;
    run.status = RunStatus::Completed;
    run.node_id = None;
    run.timings_ms.extend(timings_ms);
    run.costs = costs;
    run.terminal_at = Some(Utc::now());
    Ok(())
}

pub(crate) fn apply_fail(
    run: &mut Run,
    error_message: &str,
    error_details: &str,
    timings_ms: BTreeMap<String, u64>,
) -> Result<(), StoreError> {
    guard_not_terminal(run)?;
    run.status = RunStatus::Failed;
    run.node_id = None;
    run.timings_ms.extend(timings_ms);
    run.error = Some(RunErrorInfo {
        error_message: error_message.to_string(),
        error_details: error_details.to_string(),
        reason: String::new(),
    });
    run.terminal_at = Some(Utc::now());
    Ok(())
}

pub(crate) fn apply_cancel(run: &mut Run, reason: &str) -> Result<(), StoreError> {
    guard_not_terminal(run)?;
    run.status = RunStatus::Cancelled;
    run.node_id = None;
    run.error = Some(RunErrorInfo {
        error_message: "run cancelled".to_string(),
        error_details: String::new(),
        reason: reason.to_string(),
    });
    run.terminal_at = Some(Utc::now());
    Ok(())
}
