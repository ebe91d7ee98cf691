//! Deployment endpoints.

use super::ApiError;
use crate::state::SharedState;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::Utc;
use hive_types::deployment::{
    new_deployment_id, Deployment, DeploymentState, DeploymentStatus, DeploymentTarget,
};
use hive_types::version::validate_version;
use serde::Deserialize;

/// Request body for `POST /v1/deployments`.
#[derive(Debug, Deserialize)]
pub struct CreateDeploymentRequest {
    /// The agent to deploy.
    pub agent_id: String,
    /// The agent version to deploy.
    pub version: String,
    /// Environment tag, e.g. "production".
    pub environment: String,
    /// Replica and placement targets.
    pub target: DeploymentTarget,
}

pub(crate) async fn create_deployment(
    State(state): State<SharedState>,
    Json(request): Json<CreateDeploymentRequest>,
) -> Result<(StatusCode, Json<Deployment>), ApiError> {
    if request.target.replicas == 0 {
        return Err(ApiError::validation("target.replicas must be at least 1"));
    }
    if request.environment.trim().is_empty() {
        return Err(ApiError::validation("environment must not be empty"));
    }
    validate_version(&request.version)?;
    state.store.get_agent(&request.agent_id).await?;
    state
        .store
        .get_version(&request.agent_id, &request.version)
        .await?;

    let deployment = Deployment {
        id: new_deployment_id(),
        agent_id: request.agent_id,
        version: request.version,
        environment: request.environment,
        target: request.target,
        status: DeploymentStatus {
            state: DeploymentState::Pending,
            ready_replicas: 0,
            updated_at: Utc::now(),
        },
        created_at: Utc::now(),
    };
    let created = state.store.create_deployment(deployment).await?;
    Ok((StatusCode::CREATED, Json(created)))
}

pub(crate) async fn list_deployments(
    State(state): State<SharedState>,
) -> Result<Json<Vec<Deployment>>, ApiError> {
    Ok(Json(state.store.list_deployments().await?))
}

pub(crate) async fn get_deployment(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Json<Deployment>, ApiError> {
    Ok(Json(state.store.get_deployment(&id).await?))
}

pub(crate) async fn delete_deployment(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.store.delete_deployment(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}
