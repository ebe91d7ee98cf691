//! The redb backend against a real database file.

use chrono::Utc;
use hive_storage::{RedbStore, Store};
use hive_types::agent::{AgentSpec, ConnectorConfig, ConnectorKind};
use hive_types::error::StoreError;
use hive_types::run::{Run, RunCosts, RunStatus};
use hive_types::version::AgentVersion;
use std::collections::BTreeMap;

fn agent(id: &str) -> AgentSpec {
    let now = Utc::now();
    AgentSpec {
        id: id.to_string(),
        name: "triage".into(),
        description: "Invoice triage".into(),
        instructions: "Classify the invoice.".into(),
        model_profile: BTreeMap::from([
            ("model".to_string(), serde_json::json!("gpt-4o")),
            ("temperature".to_string(), serde_json::json!(0.2)),
        ]),
        budget: None,
        tools: vec!["lookup".into()],
        input: ConnectorConfig { kind: ConnectorKind::ServiceBus, settings: BTreeMap::new() },
        output: ConnectorConfig { kind: ConnectorKind::Http, settings: BTreeMap::new() },
        metadata: BTreeMap::from([("team".to_string(), "billing".to_string())]),
        created_at: now,
        updated_at: now,
    }
}

fn open_store(dir: &tempfile::TempDir) -> RedbStore {
    RedbStore::open(dir.path().join("hive.redb")).unwrap()
}

#[tokio::test]
async fn entities_survive_a_reopen() {
    let dir = tempfile::tempdir().unwrap();
    {
        let store = open_store(&dir);
        store.create_agent(agent("agent-1")).await.unwrap();
        store
            .create_version(AgentVersion {
                agent_id: "agent-1".into(),
                version: "1.2.3".into(),
                spec: Some(agent("agent-1")),
                created_at: Utc::now(),
            })
            .await
            .unwrap();
    }

    // Reopen from disk.
    let store = open_store(&dir);
    let loaded = store.get_agent("agent-1").await.unwrap();
    assert_eq!(loaded.name, "triage");
    assert_eq!(loaded.model_profile["model"], serde_json::json!("gpt-4o"));
    let version = store.get_version("agent-1", "1.2.3").await.unwrap();
    assert!(version.spec.is_some());
}

#[tokio::test]
async fn duplicate_version_conflicts() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir);
    store.create_agent(agent("agent-1")).await.unwrap();
    let version = AgentVersion {
        agent_id: "agent-1".into(),
        version: "1.0.0".into(),
        spec: None,
        created_at: Utc::now(),
    };
    store.create_version(version.clone()).await.unwrap();
    let err = store.create_version(version).await.unwrap_err();
    assert!(matches!(err, StoreError::Conflict(_)));
}

#[tokio::test]
async fn cascade_delete_clears_versions_and_deployments() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir);
    store.create_agent(agent("agent-1")).await.unwrap();
    store.create_agent(agent("agent-2")).await.unwrap();
    for (agent_id, version) in [("agent-1", "1.0.0"), ("agent-1", "1.1.0"), ("agent-2", "1.0.0")] {
        store
            .create_version(AgentVersion {
                agent_id: agent_id.into(),
                version: version.into(),
                spec: None,
                created_at: Utc::now(),
            })
            .await
            .unwrap();
    }

    store.delete_agent("agent-1").await.unwrap();

    assert!(store.get_agent("agent-1").await.is_err());
    assert!(store.list_versions("agent-1").await.unwrap().is_empty());
    // The other agent's versions are untouched.
    assert_eq!(store.list_versions("agent-2").await.unwrap().len(), 1);
}

#[tokio::test]
async fn run_transitions_are_terminal_once() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir);
    let run = store
        .create_run(Run::new_pending("agent-1", "1.0.0"))
        .await
        .unwrap();

    let completed = store
        .complete_run(
            &run.id,
            BTreeMap::from([("total_ms".to_string(), 40u64)]),
            RunCosts { tokens_in: 9, tokens_out: 3, usd: 0.0005 },
        )
        .await
        .unwrap();
    assert_eq!(completed.status, RunStatus::Completed);
    assert_eq!(completed.timings_ms["total_ms"], 40);

    let err = store
        .fail_run(&run.id, "late failure", "", BTreeMap::new())
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::Conflict(_)));
}
