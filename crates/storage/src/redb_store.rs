//! The embedded redb-backed store used in production.
//!
//! Each entity kind lives in its own table keyed by id; values are
//! JSON-encoded so map-valued fields stay self-describing at rest. Versions
//! are keyed by `agent_id/version` (neither side can contain `/`: agent ids
//! are generated, version strings are validated SemVer).

use crate::{apply_cancel, apply_complete, apply_fail, Store};
use async_trait::async_trait;
use hive_types::agent::AgentSpec;
use hive_types::deployment::Deployment;
use hive_types::error::StoreError;
use hive_types::node::Node;
use hive_types::run::{Run, RunCosts};
use hive_types::version::AgentVersion;
use redb::{Database, ReadableTable, TableDefinition};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;

const AGENTS: TableDefinition<&str, &[u8]> = TableDefinition::new("agents");
const VERSIONS: TableDefinition<&str, &[u8]> = TableDefinition::new("agent_versions");
const DEPLOYMENTS: TableDefinition<&str, &[u8]> = TableDefinition::new("deployments");
const NODES: TableDefinition<&str, &[u8]> = TableDefinition::new("nodes");
const RUNS: TableDefinition<&str, &[u8]> = TableDefinition::new("runs");

type Table = TableDefinition<'static, &'static str, &'static [u8]>;

fn backend<E: std::fmt::Display>(e: E) -> StoreError {
    StoreError::Backend(e.to_string())
}

fn version_key(agent_id: &str, version: &str) -> String {
    format!("{agent_id}/{version}")
}

/// A [`Store`] backed by an embedded redb database.
pub struct RedbStore {
    db: Database,
}

impl std::fmt::Debug for RedbStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedbStore").finish_non_exhaustive()
    }
}

impl RedbStore {
    /// Opens (or creates) the database at `path` and ensures every table
    /// exists, so reads never observe a missing table.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let db = Database::create(path).map_err(backend)?;
        let tx = db.begin_write().map_err(backend)?;
        {
            for table in [AGENTS, VERSIONS, DEPLOYMENTS, NODES, RUNS] {
                tx.open_table(table).map_err(backend)?;
            }
        }
        tx.commit().map_err(backend)?;
        Ok(Self { db })
    }

    fn put<T: Serialize>(
        &self,
        table: Table,
        key: &str,
        value: &T,
        must_be_new: bool,
        entity: &'static str,
    ) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec(value)?;
        let tx = self.db.begin_write().map_err(backend)?;
        {
            let mut t = tx.open_table(table).map_err(backend)?;
            if must_be_new && t.get(key).map_err(backend)?.is_some() {
                return Err(StoreError::Conflict(format!("{entity} '{key}' already exists")));
            }
            t.insert(key, bytes.as_slice()).map_err(backend)?;
        }
        tx.commit().map_err(backend)?;
        Ok(())
    }

    fn fetch<T: DeserializeOwned>(
        &self,
        table: Table,
        key: &str,
        entity: &'static str,
    ) -> Result<T, StoreError> {
        let tx = self.db.begin_read().map_err(backend)?;
        let t = tx.open_table(table).map_err(backend)?;
        let result = match t.get(key).map_err(backend)? {
            Some(guard) => Ok(serde_json::from_slice(guard.value())?),
            None => Err(StoreError::NotFound { entity, id: key.to_string() }),
        };
        result
    }

    fn exists(&self, table: Table, key: &str) -> Result<bool, StoreError> {
        let tx = self.db.begin_read().map_err(backend)?;
        let t = tx.open_table(table).map_err(backend)?;
        let result = t.get(key).map_err(backend)?.is_some();
        Ok(result)
    }

    fn scan<T: DeserializeOwned>(&self, table: Table) -> Result<Vec<T>, StoreError> {
        let tx = self.db.begin_read().map_err(backend)?;
        let t = tx.open_table(table).map_err(backend)?;
        let mut out = Vec::new();
        for entry in t.iter().map_err(backend)? {
            let (_, value) = entry.map_err(backend)?;
            out.push(serde_json::from_slice(value.value())?);
        }
        Ok(out)
    }

    fn remove(&self, table: Table, key: &str, entity: &'static str) -> Result<(), StoreError> {
        let tx = self.db.begin_write().map_err(backend)?;
        let removed = {
            let mut t = tx.open_table(table).map_err(backend)?;
            let was_present = t.remove(key).map_err(backend)?.is_some();
            was_present
        };
        tx.commit().map_err(backend)?;
        if removed {
            Ok(())
        } else {
            Err(StoreError::NotFound { entity, id: key.to_string() })
        }
    }

    fn mutate_run<F>(&self, run_id: &str, f: F) -> Result<Run, StoreError>
    where
        F: FnOnce(&mut Run) -> Result<(), StoreError>,
    {
        let tx = self.db.begin_write().map_err(backend)?;
        let run = {
            let mut t = tx.open_table(RUNS).map_err(backend)?;
            let mut run: Run = {
                let guard = t.get(run_id).map_err(backend)?;
                match guard {
                    Some(g) => serde_json::from_slice(g.value())?,
                    None => {
                        return Err(StoreError::NotFound {
                            entity: "run",
                            id: run_id.to_string(),
                        })
                    }
                }
            };
            f(&mut run)?;
            let bytes = serde_json::to_vec(&run)?;
            t.insert(run_id, bytes.as_slice()).map_err(backend)?;
            run
        };
        tx.commit().map_err(backend)?;
        Ok(run)
    }
}

#[async_trait]
impl Store for RedbStore {
    async fn create_agent(&self, spec: AgentSpec) -> Result<AgentSpec, StoreError> {
        self.put(AGENTS, &spec.id, &spec, true, "agent")?;
        Ok(spec)
    }

    async fn get_agent(&self, id: &str) -> Result<AgentSpec, StoreError> {
        self.fetch(AGENTS, id, "agent")
    }

    async fn list_agents(&self) -> Result<Vec<AgentSpec>, StoreError> {
        self.scan(AGENTS)
    }

    async fn update_agent(&self, spec: AgentSpec) -> Result<AgentSpec, StoreError> {
        if !self.exists(AGENTS, &spec.id)? {
            return Err(StoreError::NotFound { entity: "agent", id: spec.id.clone() });
        }
        self.put(AGENTS, &spec.id, &spec, false, "agent")?;
        Ok(spec)
    }

    async fn delete_agent(&self, id: &str) -> Result<(), StoreError> {
        // Cascade inside one transaction so a crash cannot strand versions
        // or deployments of a deleted agent.
        let tx = self.db.begin_write().map_err(backend)?;
        {
            let mut agents = tx.open_table(AGENTS).map_err(backend)?;
            if agents.remove(id).map_err(backend)?.is_none() {
                return Err(StoreError::NotFound { entity: "agent", id: id.to_string() });
            }

            let mut versions = tx.open_table(VERSIONS).map_err(backend)?;
            let version_keys: Vec<String> = {
                let mut keys = Vec::new();
                for entry in versions.iter().map_err(backend)? {
                    let (key, value) = entry.map_err(backend)?;
                    let v: AgentVersion = serde_json::from_slice(value.value())?;
                    if v.agent_id == id {
                        keys.push(key.value().to_string());
                    }
                }
                keys
            };
            for key in &version_keys {
                versions.remove(key.as_str()).map_err(backend)?;
            }

            let mut deployments = tx.open_table(DEPLOYMENTS).map_err(backend)?;
            let deployment_keys: Vec<String> = {
                let mut keys = Vec::new();
                for entry in deployments.iter().map_err(backend)? {
                    let (key, value) = entry.map_err(backend)?;
                    let d: Deployment = serde_json::from_slice(value.value())?;
                    if d.agent_id == id {
                        keys.push(key.value().to_string());
                    }
                }
                keys
            };
            for key in &deployment_keys {
                deployments.remove(key.as_str()).map_err(backend)?;
            }
        }
        tx.commit().map_err(backend)?;
        Ok(())
    }

    async fn create_version(&self, version: AgentVersion) -> Result<AgentVersion, StoreError> {
        if !self.exists(AGENTS, &version.agent_id)? {
            return Err(StoreError::NotFound {
                entity: "agent",
                id: version.agent_id.clone(),
            });
        }
        let key = version_key(&version.agent_id, &version.version);
        self.put(VERSIONS, &key, &version, true, "version")?;
        Ok(version)
    }

    async fn get_version(
        &self,
        agent_id: &str,
        version: &str,
    ) -> Result<AgentVersion, StoreError> {
        self.fetch(VERSIONS, &version_key(agent_id, version), "version")
    }

    async fn list_versions(&self, agent_id: &str) -> Result<Vec<AgentVersion>, StoreError> {
        let mut versions: Vec<AgentVersion> = self
            .scan::<AgentVersion>(VERSIONS)?
            .into_iter()
            .filter(|v| v.agent_id == agent_id)
            .collect();
        versions.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(versions)
    }

    async fn create_deployment(&self, deployment: Deployment) -> Result<Deployment, StoreError> {
        self.put(DEPLOYMENTS, &deployment.id, &deployment, true, "deployment")?;
        Ok(deployment)
    }

    async fn get_deployment(&self, id: &str) -> Result<Deployment, StoreError> {
        self.fetch(DEPLOYMENTS, id, "deployment")
    }

    async fn list_deployments(&self) -> Result<Vec<Deployment>, StoreError> {
        self.scan(DEPLOYMENTS)
    }

    async fn list_deployments_for_agent(
        &self,
        agent_id: &str,
    ) -> Result<Vec<Deployment>, StoreError> {
        Ok(self
            .scan::<Deployment>(DEPLOYMENTS)?
            .into_iter()
            .filter(|d| d.agent_id == agent_id)
            .collect())
    }

    async fn update_deployment(&self, deployment: Deployment) -> Result<Deployment, StoreError> {
        if !self.exists(DEPLOYMENTS, &deployment.id)? {
            return Err(StoreError::NotFound {
                entity: "deployment",
                id: deployment.id.clone(),
            });
        }
        self.put(DEPLOYMENTS, &deployment.id, &deployment, false, "deployment")?;
        Ok(deployment)
    }

    async fn delete_deployment(&self, id: &str) -> Result<(), StoreError> {
        self.remove(DEPLOYMENTS, id, "deployment")
    }

    async fn upsert_node(&self, node: Node) -> Result<Node, StoreError> {
        self.put(NODES, &node.id, &node, false, "node")?;
        Ok(node)
    }

    async fn get_node(&self, id: &str) -> Result<Node, StoreError> {
        self.fetch(NODES, id, "node")
    }

    async fn list_nodes(&self) -> Result<Vec<Node>, StoreError> {
        self.scan(NODES)
    }

    async fn delete_node(&self, id: &str) -> Result<(), StoreError> {
        self.remove(NODES, id, "node")
    }

    async fn create_run(&self, run: Run) -> Result<Run, StoreError> {
        self.put(RUNS, &run.id, &run, true, "run")?;
        Ok(run)
    }

    async fn get_run(&self, id: &str) -> Result<Run, StoreError> {
        self.fetch(RUNS, id, "run")
    }

    async fn list_runs(&self) -> Result<Vec<Run>, StoreError> {
        self.scan(RUNS)
    }

    async fn update_run(&self, run: Run) -> Result<Run, StoreError> {
        let id = run.id.clone();
        self.mutate_run(&id, move |stored| {
            if stored.status.is_terminal() {
                return Err(StoreError::Conflict(format!(
                    "run '{}' is already terminal ({})",
                    stored.id, stored.status
                )));
            }
            *stored = run;
            Ok(())
        })
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
