//! The in-process store used by tests and single-node development.

use crate::{apply_cancel, apply_complete, apply_fail, Store};
use async_trait::async_trait;
use hive_types::agent::AgentSpec;
use hive_types::deployment::Deployment;
use hive_types::error::StoreError;
use hive_types::node::Node;
use hive_types::run::{Run, RunCosts};
use hive_types::version::AgentVersion;
use parking_lot::RwLock;
use std::collections::BTreeMap;

#[derive(Debug, Default)]
struct Inner {
    agents: BTreeMap<String, AgentSpec>,
    // Keyed by (agent_id, version).
    versions: BTreeMap<(String, String), AgentVersion>,
    deployments: BTreeMap<String, Deployment>,
    nodes: BTreeMap<String, Node>,
    runs: BTreeMap<String, Run>,
}

/// A volatile [`Store`] backed by in-process maps.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn mutate_run<F>(&self, run_id: &str, f: F) -> Result<Run, StoreError>
    where
        F: FnOnce(&mut Run) -> Result<(), StoreError>,
    {
        let mut inner = self.inner.write();
        let run = inner.runs.get_mut(run_id).ok_or_else(|| StoreError::NotFound {
            entity: "run",
            id: run_id.to_string(),
        })?;
        f(run)?;
        Ok(run.clone())
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn create_agent(&self, spec: AgentSpec) -> Result<AgentSpec, StoreError> {
        let mut inner = self.inner.write();
        if inner.agents.contains_key(&spec.id) {
            return Err(StoreError::Conflict(format!("agent '{}' already exists", spec.id)));
        }
        inner.agents.insert(spec.id.clone(), spec.clone());
        Ok(spec)
    }

    async fn get_agent(&self, id: &str) -> Result<AgentSpec, StoreError> {
        self.inner.read().agents.get(id).cloned().ok_or_else(|| StoreError::NotFound {
            entity: "agent",
            id: id.to_string(),
        })
    }

    async fn list_agents(&self) -> Result<Vec<AgentSpec>, StoreError> {
        Ok(self.inner.read().agents.values().cloned().collect())
    }

    async fn update_agent(&self, spec: AgentSpec) -> Result<AgentSpec, StoreError> {
        let mut inner = self.inner.write();
        if !inner.agents.contains_key(&spec.id) {
            return Err(StoreError::NotFound { entity: "agent", id: spec.id.clone() });
        }
        inner.agents.insert(spec.id.clone(), spec.clone());
        Ok(spec)
    }

    async fn delete_agent(&self, id: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        if inner.agents.remove(id).is_none() {
            return Err(StoreError::NotFound { entity: "agent", id: id.to_string() });
        }
        inner.versions.retain(|(agent_id, _), _| agent_id != id);
        inner.deployments.retain(|_, d| d.agent_id != id);
        Ok(())
    }

    async fn create_version(&self, version: AgentVersion) -> Result<AgentVersion, StoreError> {
        let mut inner = self.inner.write();
        if !inner.agents.contains_key(&version.agent_id) {
            return Err(StoreError::NotFound {
                entity: "agent",
                id: version.agent_id.clone(),
            });
        }
        let key = (version.agent_id.clone(), version.version.clone());
        if inner.versions.contains_key(&key) {
            return Err(StoreError::Conflict(format!(
                "version '{}' already exists for agent '{}'",
                version.version, version.agent_id
            )));
        }
        inner.versions.insert(key, version.clone());
        Ok(version)
    }

    async fn get_version(
        &self,
        agent_id: &str,
        version: &str,
    ) -> Result<AgentVersion, StoreError> {
        self.inner
            .read()
            .versions
            .get(&(agent_id.to_string(), version.to_string()))
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                entity: "version",
                id: format!("{agent_id}/{version}"),
            })
    }

    async fn list_versions(&self, agent_id: &str) -> Result<Vec<AgentVersion>, StoreError> {
        let mut versions: Vec<AgentVersion> = self
            .inner
            .read()
            .versions
            .values()
            .filter(|v| v.agent_id == agent_id)
            .cloned()
            .collect();
        versions.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(versions)
    }

    async fn create_deployment(&self, deployment: Deployment) -> Result<Deployment, StoreError> {
        let mut inner = self.inner.write();
        if inner.deployments.contains_key(&deployment.id) {
            return Err(StoreError::Conflict(format!(
                "deployment '{}' already exists",
                deployment.id
            )));
        }
        inner.deployments.insert(deployment.id.clone(), deployment.clone());
        Ok(deployment)
    }

    async fn get_deployment(&self, id: &str) -> Result<Deployment, StoreError> {
        self.inner.read().deployments.get(id).cloned().ok_or_else(|| StoreError::NotFound {
            entity: "deployment",
            id: id.to_string(),
        })
    }

    async fn list_deployments(&self) -> Result<Vec<Deployment>, StoreError> {
        Ok(self.inner.read().deployments.values().cloned().collect())
    }

    async fn list_deployments_for_agent(
        &self,
        agent_id: &str,
    ) -> Result<Vec<Deployment>, StoreError> {
        Ok(self
            .inner
            .read()
            .deployments
            .values()
            .filter(|d| d.agent_id == agent_id)
            .cloned()
            .collect())
    }

    async fn update_deployment(&self, deployment: Deployment) -> Result<Deployment, StoreError> {
        let mut inner = self.inner.write();
        if !inner.deployments.contains_key(&deployment.id) {
            return Err(StoreError::NotFound {
                entity: "deployment",
                id: deployment.id.clone(),
            });
        }
        inner.deployments.insert(deployment.id.clone(), deployment.clone());
        Ok(deployment)
    }

    async fn delete_deployment(&self, id: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        inner.deployments.remove(id).map(|_| ()).ok_or_else(|| StoreError::NotFound {
            entity: "deployment",
            id: id.to_string(),
        })
    }

    async fn upsert_node(&self, node: Node) -> Result<Node, StoreError> {
        self.inner.write().nodes.insert(node.id.clone(), node.clone());
        Ok(node)
    }

    async fn get_node(&self, id: &str) -> Result<Node, StoreError> {
        self.inner.read().nodes.get(id).cloned().ok_or_else(|| StoreError::NotFound {
            entity: "node",
            id: id.to_string(),
        })
    }

    async fn list_nodes(&self) -> Result<Vec<Node>, StoreError> {
        Ok(self.inner.read().nodes.values().cloned().collect())
    }

    async fn delete_node(&self, id: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        inner.nodes.remove(id).map(|_| ()).ok_or_else(|| StoreError::NotFound {
            entity: "node",
            id: id.to_string(),
        })
    }

    async fn create_run(&self, run: Run) -> Result<Run, StoreError> {
        let mut inner = self.inner.write();
        if inner.runs.contains_key(&run.id) {
            return Err(StoreError::Conflict(format!("run '{}' already exists", run.id)));
        }
        inner.runs.insert(run.id.clone(), run.clone());
        Ok(run)
    }

    async fn get_run(&self, id: &str) -> Result<Run, StoreError> {
        self.inner.read().runs.get(id).cloned().ok_or_else(|| StoreError::NotFound {
            entity: "run",
            id: id.to_string(),
        })
    }

    async fn list_runs(&self) -> Result<Vec<Run>, StoreError> {
        Ok(self.inner.read().runs.values().cloned().collect())
    }

    async fn update_run(&self, run: Run) -> Result<Run, StoreError> {
        let mut inner = self.inner.write();
        let stored = inner.runs.get_mut(&run.id).ok_or_else(|| StoreError::NotFound {
            entity: "run",
            id: run.id.clone(),
        })?;
        if stored.status.is_terminal() {
            return Err(StoreError::Conflict(format!(
                "run '{}' is already terminal ({})",
                stored.id, stored.status
            )));
        }
        *stored = run.clone();
        Ok(run)
    }

    async fn complete_run(
        &self,
        run_id: &str,
        timings_ms: BTreeMap<String, u64>,
        costs: RunCosts,
    ) -> Result<Run, StoreError> {
        self.mutate_run(run_id, |run| apply_complete(run, timings_ms, costs))
    }

    async fn fail_run(
        &self,
        run_id: &str,
        error_message: &str,
        error_details: &str,
        timings_ms: BTreeMap<String, u64>,
    ) -> Result<Run, StoreError> {
        self.mutate_run(run_id, |run| {
            apply_fail(run, error_message, error_details, timings_ms)
        })
    }

    async fn cancel_run(&self, run_id: &str, reason: &str) -> Result<Run, StoreError> {
        self.mutate_run(run_id, |run| apply_cancel(run, reason))
    }
}
