//! The REST API surface (JSON over axum).
//!
//! Paths follow the platform's custom-verb convention
//! (`/v1/nodes:register`, `/v1/runs/{id}:complete`): the verb rides in the
//! final path segment after a colon. Colon verbs on an id segment are
//! dispatched by the POST handler of the plain `/:id` route; the bare
//! `/v1/nodes:register` literal is handled by the router fallback.

use crate::state::SharedState;
use axum::extract::{Request, State};
use axum::http::{Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use hive_types::error::StoreError;
use serde::Serialize;

pub mod agents;
pub mod deployments;
pub mod nodes;
pub mod runs;

/// The JSON error body: `{error, errors[]}`.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    /// Summary message.
    pub error: String,
    /// Individual violations, for validation failures.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

/// An API error carrying its HTTP status.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    body: ErrorBody,
}

impl ApiError {
    /// A 400 with one violation per message.
    pub fn validation(message: &str) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            body: ErrorBody {
                error: "validation failed".to_string(),
                errors: message.split("; ").map(str::to_string).collect(),
            },
        }
    }

    /// A plain 404.
    pub fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            body: ErrorBody { error: message.into(), errors: Vec::new() },
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        let status = match &e {
            StoreError::NotFound { .. } => StatusCode::NOT_FOUND,
            StoreError::Conflict(_) => StatusCode::CONFLICT,
            StoreError::Validation(_) => return ApiError::validation(&e.to_string()),
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            body: ErrorBody { error: e.to_string(), errors: Vec::new() },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

/// Splits a path segment of the form `{id}:{verb}`.
pub(crate) fn split_verb(segment: &str) -> Option<(&str, &str)> {
    segment.split_once(':')
}

/// Assembles the full REST router.
pub fn router(state: SharedState) -> Router {
    Router::new()
        .route("/v1/agents", get(agents::list_agents).post(agents::create_agent))
        .route(
            "/v1/agents/:id",
            get(agents::get_agent)
                .put(agents::update_agent)
                .delete(agents::delete_agent)
                .post(agents::agent_verb),
        )
        .route("/v1/agents/:id/versions", get(agents::list_versions))
        .route("/v1/agents/:id/versions/:version", get(agents::get_version))
        .route(
            "/v1/deployments",
            get(deployments::list_deployments).post(deployments::create_deployment),
        )
        .route(
            "/v1/deployments/:id",
            get(deployments::get_deployment).delete(deployments::delete_deployment),
        )
        .route("/v1/nodes", get(nodes::list_nodes))
        .route(
            "/v1/nodes/:id",
            get(nodes::get_node).delete(nodes::deregister_node).post(nodes::node_verb),
        )
        .route("/v1/runs", get(runs::list_runs).post(runs::create_run))
        .route("/v1/runs/:id", get(runs::get_run).post(runs::run_verb))
        .route("/v1/scheduler/load", get(nodes::scheduler_load))
        .fallback(fallback)
        .with_state(state)
}

/// Handles the colon-verb literals that have no id segment.
async fn fallback(State(state): State<SharedState>, req: Request) -> Response {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    if method == Method::POST && path == "/v1/nodes:register" {
        return nodes::register_node(state, req).await;
    }
    (
        StatusCode::NOT_FOUND,
        Json(ErrorBody { error: format!("no route for {method} {path}"), errors: Vec::new() }),
    )
        .into_response()
}
