//! Node registration, heartbeat, and diagnostics endpoints.

use super::{split_verb, ApiError, ErrorBody};
use crate::state::SharedState;
use axum::extract::{FromRequest, Path, Request, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use hive_scheduler::NodeLoad;
use hive_types::node::{Node, NodeCapacity, NodeState, NodeStatus};
use serde::Deserialize;
use std::collections::BTreeMap;

/// Request body for `POST /v1/nodes:register`.
#[derive(Debug, Deserialize)]
pub struct RegisterNodeRequest {
    /// Stable identifier chosen by the worker.
    pub node_id: String,
    /// Free-form labels matched against placement constraints.
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
    /// Declared capacity.
    #[serde(default)]
    pub capacity: NodeCapacity,
}

/// Handles `POST /v1/nodes:register`; invoked from the router fallback
/// because the verb rides in a literal path segment.
pub(crate) async fn register_node(state: SharedState, req: Request) -> Response {
    let Json(body) = match Json::<RegisterNodeRequest>::from_request(req, &()).await {
        Ok(json) => json,
        Err(rejection) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(ErrorBody {
                    error: "validation failed".to_string(),
                    errors: vec![rejection.to_string()],
                }),
            )
                .into_response();
        }
    };
    if body.node_id.trim().is_empty() {
        return ApiError::validation("node_id must not be empty").into_response();
    }

    // Registration is idempotent: a restarting worker re-registers under
    // its stable id and simply refreshes its record.
    let node = Node {
        id: body.node_id,
        metadata: body.metadata,
        capacity: body.capacity.clone(),
        status: NodeStatus {
            state: NodeState::Active,
            active_runs: 0,
            available_slots: body.capacity.slots,
        },
        last_heartbeat: Utc::now(),
    };
    match state.store.upsert_node(node).await {
        Ok(node) => {
            tracing::info!(target: "rest", node_id = %node.id, slots = node.capacity.slots, "node registered");
            (StatusCode::CREATED, Json(node)).into_response()
        }
        Err(e) => ApiError::from(e).into_response(),
    }
}

/// Request body for `POST /v1/nodes/{id}:heartbeat`.
#[derive(Debug, Deserialize)]
pub struct HeartbeatRequest {
    /// The node's self-reported status.
    pub status: NodeStatus,
    /// Sender-side send time; defaults to receipt time. Arrivals older than
    /// the stored heartbeat are dropped.
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

/// Dispatches `POST /v1/nodes/{id}:{verb}`.
pub(crate) async fn node_verb(
    State(state): State<SharedState>,
    Path(segment): Path<String>,
    Json(body): Json<serde_json::Value>,
) -> Result<Json<Node>, ApiError> {
    let Some((id, verb)) = split_verb(&segment) else {
        return Err(ApiError::not_found(format!("no POST route for node '{segment}'")));
    };
    match verb {
        "heartbeat" => {
            let request: HeartbeatRequest = serde_json::from_value(body)
                .map_err(|e| ApiError::validation(&e.to_string()))?;
            heartbeat(state, id, request).await
        }
        other => Err(ApiError::not_found(format!("unknown node verb '{other}'"))),
    }
}

async fn heartbeat(
    state: SharedState,
    node_id: &str,
    request: HeartbeatRequest,
) -> Result<Json<Node>, ApiError> {
    let node = state.store.get_node(node_id).await?;
    let timestamp = request.timestamp.unwrap_or_else(Utc::now);

    // Heartbeats are monotonic by timestamp; an out-of-order arrival is
    // dropped and the stored record returned unchanged.
    if timestamp < node.last_heartbeat {
        tracing::debug!(target: "rest", node_id, "dropped out-of-order heartbeat");
        return Ok(Json(node));
    }

    let mut updated = node;
    updated.status = request.status;
    updated.last_heartbeat = timestamp;
    let stored = state.store.upsert_node(updated).await?;
    Ok(Json(stored))
}

pub(crate) async fn list_nodes(
    State(state): State<SharedState>,
) -> Result<Json<Vec<Node>>, ApiError> {
    Ok(Json(state.store.list_nodes().await?))
}

pub(crate) async fn get_node(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Json<Node>, ApiError> {
    Ok(Json(state.store.get_node(&id).await?))
}

pub(crate) async fn deregister_node(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.store.delete_node(&id).await?;
    state.pullers.remove(&id);
    Ok(StatusCode::NO_CONTENT)
}

/// `GET /v1/scheduler/load`: the per-node load table used by placement.
pub(crate) async fn scheduler_load(
    State(state): State<SharedState>,
) -> Result<Json<BTreeMap<String, NodeLoad>>, ApiError> {
    let nodes = state.store.list_nodes().await?;
    let runs = state.store.list_runs().await?;
    Ok(Json(hive_scheduler::node_load(&nodes, &runs)))
}
