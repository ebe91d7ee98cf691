//! Run endpoints, including the operator-driven terminal transitions.

use super::{split_verb, ApiError};
use crate::state::SharedState;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use hive_types::run::{Run, RunCosts, RunStatus};
use serde::Deserialize;
use std::collections::BTreeMap;

/// Request body for `POST /v1/runs`.
#[derive(Debug, Deserialize)]
pub struct CreateRunRequest {
    /// The agent to execute.
    pub agent_id: String,
    /// The agent version to execute.
    pub version: String,
}

pub(crate) async fn create_run(
    State(state): State<SharedState>,
    Json(request): Json<CreateRunRequest>,
) -> Result<(StatusCode, Json<Run>), ApiError> {
    state.store.get_agent(&request.agent_id).await?;
    state
        .store
        .get_version(&request.agent_id, &request.version)
        .await?;
    let run = Run::new_pending(&request.agent_id, &request.version);
    let created = state.store.create_run(run).await?;
    Ok((StatusCode::CREATED, Json(created)))
}

pub(crate) async fn list_runs(
    State(state): State<SharedState>,
) -> Result<Json<Vec<Run>>, ApiError> {
    Ok(Json(state.store.list_runs().await?))
}

pub(crate) async fn get_run(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Json<Run>, ApiError> {
    Ok(Json(state.store.get_run(&id).await?))
}

/// Request body for `POST /v1/runs/{id}:complete`.
#[derive(Debug, Default, Deserialize)]
pub struct CompleteRunRequest {
    /// Phase durations, merged into the run's timings.
    #[serde(default)]
    pub timings_ms: BTreeMap<String, u64>,
    /// Final cost accounting.
    #[serde(default)]
    pub costs: RunCosts,
}

/// Request body for `POST /v1/runs/{id}:fail`.
#[derive(Debug, Deserialize)]
pub struct FailRunRequest {
    /// Short error message. Required.
    pub error_message: String,
    /// Longer diagnostics.
    #[serde(default)]
    pub error_details: String,
    /// Phase durations, merged into the run's timings.
    #[serde(default)]
    pub timings_ms: BTreeMap<String, u64>,
}

/// Request body for `POST /v1/runs/{id}:cancel`.
#[derive(Debug, Default, Deserialize)]
pub struct CancelRunRequest {
    /// Cancellation reason recorded on the run.
    #[serde(default)]
    pub reason: String,
}

/// Dispatches `POST /v1/runs/{id}:{verb}` for the operator-driven terminal
/// transitions.
pub(crate) async fn run_verb(
    State(state): State<SharedState>,
    Path(segment): Path<String>,
    Json(body): Json<serde_json::Value>,
) -> Result<Json<Run>, ApiError> {
    let Some((id, verb)) = split_verb(&segment) else {
        return Err(ApiError::not_found(format!("no POST route for run '{segment}'")));
    };
    let before = state.store.get_run(id).await?;
    let from = before.status;
    let node_id = before.node_id.clone();

    let run = match verb {
        "complete" => {
            let request: CompleteRunRequest = serde_json::from_value(body)
                .map_err(|e| ApiError::validation(&e.to_string()))?;
            let run = state
                .store
                .complete_run(id, request.timings_ms, request.costs)
                .await?;
            state
                .events
                .publish(id, from, RunStatus::Completed, node_id.as_deref());
            run
        }
        "fail" => {
            let request: FailRunRequest = serde_json::from_value(body)
                .map_err(|e| ApiError::validation(&e.to_string()))?;
            if request.error_message.trim().is_empty() {
                return Err(ApiError::validation("error_message must not be empty"));
            }
            let run = state
                .store
                .fail_run(id, &request.error_message, &request.error_details, request.timings_ms)
                .await?;
            state
                .events
                .publish(id, from, RunStatus::Failed, node_id.as_deref());
            run
        }
        "cancel" => {
            let request: CancelRunRequest = serde_json::from_value(body)
                .map_err(|e| ApiError::validation(&e.to_string()))?;
            let run = state.store.cancel_run(id, &request.reason).await?;
            state
                .events
                .publish(id, from, RunStatus::Cancelled, node_id.as_deref());
            run
        }
        other => return Err(ApiError::not_found(format!("unknown run verb '{other}'"))),
    };

    // Operator transitions bypass the owner check, so the lease is cleared
    // administratively.
    state.leases.admin_release(id);
    Ok(Json(run))
}
