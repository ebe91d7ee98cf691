//! Agent and agent-version endpoints.

use super::{split_verb, ApiError};
use crate::state::SharedState;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::Utc;
use hive_types::agent::{new_agent_id, AgentSpec, Budget, ConnectorConfig};
use hive_types::version::{validate_version, AgentVersion};
use serde::Deserialize;
use std::collections::BTreeMap;

/// The caller-supplied agent definition; ids and timestamps are assigned by
/// the control plane.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentSpecInput {
    /// Display name.
    pub name: String,
    /// Free-text description.
    #[serde(default)]
    pub description: String,
    /// System prompt.
    pub instructions: String,
    /// Model options; must contain `"model"`.
    pub model_profile: BTreeMap<String, serde_json::Value>,
    /// Optional per-run limits.
    #[serde(default)]
    pub budget: Option<Budget>,
    /// Tool names, unique.
    #[serde(default)]
    pub tools: Vec<String>,
    /// Input connector.
    pub input: ConnectorConfig,
    /// Output connector.
    pub output: ConnectorConfig,
    /// Free-form labels.
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl AgentSpecInput {
    fn into_spec(self, id: String) -> AgentSpec {
        let now = Utc::now();
        AgentSpec {
            id,
            name: self.name,
            description: self.description,
            instructions: self.instructions,
            model_profile: self.model_profile,
            budget: self.budget,
            tools: self.tools,
            input: self.input,
            output: self.output,
            metadata: self.metadata,
            created_at: now,
            updated_at: now,
        }
    }
}

pub(crate) async fn create_agent(
    State(state): State<SharedState>,
    Json(input): Json<AgentSpecInput>,
) -> Result<(StatusCode, Json<AgentSpec>), ApiError> {
    let spec = input.into_spec(new_agent_id());
    spec.validate()?;
    let created = state.store.create_agent(spec).await?;
    Ok((StatusCode::CREATED, Json(created)))
}

pub(crate) async fn list_agents(
    State(state): State<SharedState>,
) -> Result<Json<Vec<AgentSpec>>, ApiError> {
    Ok(Json(state.store.list_agents().await?))
}

pub(crate) async fn get_agent(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Json<AgentSpec>, ApiError> {
    Ok(Json(state.store.get_agent(&id).await?))
}

pub(crate) async fn update_agent(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Json(input): Json<AgentSpecInput>,
) -> Result<Json<AgentSpec>, ApiError> {
    let existing = state.store.get_agent(&id).await?;
    let mut spec = input.into_spec(id);
    spec.created_at = existing.created_at;
    spec.validate()?;
    Ok(Json(state.store.update_agent(spec).await?))
}

pub(crate) async fn delete_agent(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.store.delete_agent(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Request body for `POST /v1/agents/{id}:version`.
#[derive(Debug, Deserialize)]
pub struct CreateVersionRequest {
    /// The SemVer 2.0.0 version string.
    pub version: String,
    /// Optional full spec snapshot; absent means "no spec change".
    #[serde(default)]
    pub spec: Option<AgentSpecInput>,
}

/// Dispatches `POST /v1/agents/{id}:{verb}`.
pub(crate) async fn agent_verb(
    State(state): State<SharedState>,
    Path(segment): Path<String>,
    Json(body): Json<serde_json::Value>,
) -> Result<(StatusCode, Json<AgentVersion>), ApiError> {
    let Some((id, verb)) = split_verb(&segment) else {
        return Err(ApiError::not_found(format!("no POST route for agent '{segment}'")));
    };
    match verb {
        "version" => {
            let request: CreateVersionRequest = serde_json::from_value(body)
                .map_err(|e| ApiError::validation(&e.to_string()))?;
            create_version(state, id, request).await
        }
        other => Err(ApiError::not_found(format!("unknown agent verb '{other}'"))),
    }
}

async fn create_version(
    state: SharedState,
    agent_id: &str,
    request: CreateVersionRequest,
) -> Result<(StatusCode, Json<AgentVersion>), ApiError> {
    let parsed = validate_version(&request.version)?;
    let agent = state.store.get_agent(agent_id).await?;

    let spec = match request.spec {
        Some(input) => {
            let mut spec = input.into_spec(agent.id.clone());
            spec.created_at = agent.created_at;
            spec.validate()?;
            Some(spec)
        }
        None => None,
    };

    let version = AgentVersion {
        agent_id: agent.id,
        version: parsed.to_string(),
        spec,
        created_at: Utc::now(),
    };
    let created = state.store.create_version(version).await?;
    Ok((StatusCode::CREATED, Json(created)))
}

pub(crate) async fn list_versions(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Json<Vec<AgentVersion>>, ApiError> {
    // A miss on the agent is a 404, not an empty list.
    state.store.get_agent(&id).await?;
    Ok(Json(state.store.list_versions(&id).await?))
}

pub(crate) async fn get_version(
    State(state): State<SharedState>,
    Path((id, version)): Path<(String, String)>,
) -> Result<Json<AgentVersion>, ApiError> {
    Ok(Json(state.store.get_version(&id, &version).await?))
}
