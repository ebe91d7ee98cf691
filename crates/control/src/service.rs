//! The gRPC lease service: Pull streaming plus Ack/Complete/Fail handling.
//!
//! All terminal transitions are owner-checked against the run's recorded
//! assignment, so a late report from a node whose lease already expired and
//! was reassigned is rejected without side effects.

use crate::state::SharedState;
use hive_ipc::lease::lease_service_server::LeaseService;
use hive_ipc::lease::{
    AckRequest, AckResponse, CompleteRequest, CompleteResponse, FailRequest, FailResponse,
    LeaseGrant, PullRequest,
};
use hive_telemetry::control_metrics;
use hive_types::error::StoreError;
use hive_types::run::{Run, RunCosts, RunStatus};
use std::collections::BTreeMap;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status};

/// The tonic service implementation.
#[derive(Debug)]
pub struct LeaseServiceImpl {
    state: SharedState,
}

impl LeaseServiceImpl {
    /// Wraps the shared state.
    pub fn new(state: SharedState) -> Self {
        Self { state }
    }

    fn map_store_error(e: StoreError) -> Status {
        match e {
            StoreError::NotFound { .. } => Status::not_found(e.to_string()),
            StoreError::Conflict(_) => Status::failed_precondition(e.to_string()),
            StoreError::Validation(_) => Status::invalid_argument(e.to_string()),
            _ => Status::internal(e.to_string()),
        }
    }

    /// Loads the run and verifies the caller holds its assignment.
    async fn owned_run(&self, run_id: &str, node_id: &str) -> Result<Run, Status> {
        let run = self
            .state
            .store
            .get_run(run_id)
            .await
            .map_err(Self::map_store_error)?;
        if run.node_id.as_deref() != Some(node_id) {
            tracing::warn!(
                target: "lease-service",
                run_id,
                caller = node_id,
                assigned = run.node_id.as_deref().unwrap_or("-"),
                "rejected report from non-owner"
            );
            return Err(Status::permission_denied(format!(
                "node '{node_id}' is not the owner of run '{run_id}'"
            )));
        }
        Ok(run)
    }
}

fn timings_map(wire: std::collections::HashMap<String, u64>) -> BTreeMap<String, u64> {
    wire.into_iter().collect()
}

#[tonic::async_trait]
impl LeaseService for LeaseServiceImpl {
    type PullStream = ReceiverStream<Result<LeaseGrant, Status>>;

    async fn pull(
        &self,
        request: Request<PullRequest>,
    ) -> Result<Response<Self::PullStream>, Status> {
        let req = request.into_inner();
        if req.node_id.trim().is_empty() {
            return Err(Status::invalid_argument("node_id must not be empty"));
        }
        // Only registered nodes may pull.
        self.state
            .store
            .get_node(&req.node_id)
            .await
            .map_err(|_| Status::not_found(format!("node '{}' is not registered", req.node_id)))?;

        let quota = req.max_leases.max(1) as usize;
        let (tx, rx) = mpsc::channel(quota);
        self.state.pullers.register(&req.node_id, tx);
        tracing::info!(target: "lease-service", node_id = %req.node_id, max_leases = req.max_leases, "puller connected");
        Ok(Response::new(ReceiverStream::new(rx)))
    }

    async fn ack(&self, request: Request<AckRequest>) -> Result<Response<AckResponse>, Status> {
        let req = request.into_inner();
        // Ack advances assigned → running for the owner; anything else is
        // ignored rather than failed, per the transition contract.
        match self.owned_run(&req.run_id, &req.node_id).await {
            Ok(mut run) if run.status == RunStatus::Assigned => {
                run.status = RunStatus::Running;
                match self.state.store.update_run(run).await {
                    Ok(_) => {
                        self.state.events.publish(
                            &req.run_id,
                            RunStatus::Assigned,
                            RunStatus::Running,
                            Some(&req.node_id),
                        );
                    }
                    Err(e) => {
                        tracing::warn!(target: "lease-service", run_id = %req.run_id, error = %e, "ack write failed");
                    }
                }
            }
            Ok(run) => {
                tracing::debug!(target: "lease-service", run_id = %req.run_id, status = %run.status, "ack ignored");
            }
            Err(_) => {}
        }
        Ok(Response::new(AckResponse {}))
    }

    async fn complete(
        &self,
        request: Request<CompleteRequest>,
    ) -> Result<Response<CompleteResponse>, Status> {
        let req = request.into_inner();
        let mut run = self.owned_run(&req.run_id, &req.node_id).await?;
        let from = run.status;

        // Persist the delivered result envelope before the terminal
        // transition seals the record.
        if !req.result.is_empty() {
            run.result = Some(
                serde_json::from_str(&req.result)
                    .unwrap_or_else(|_| serde_json::Value::String(req.result.clone())),
            );
            self.state
                .store
                .update_run(run)
                .await
                .map_err(Self::map_store_error)?;
        }

        let costs = req
            .costs
            .map(|c| RunCosts { tokens_in: c.tokens_in, tokens_out: c.tokens_out, usd: c.usd })
            .unwrap_or_default();
        self.state
            .store
            .complete_run(&req.run_id, timings_map(req.timings_ms), costs)
            .await
            .map_err(Self::map_store_error)?;

        self.state.leases.release_lease(&req.run_id, &req.node_id);
        self.state
            .events
            .publish(&req.run_id, from, RunStatus::Completed, Some(&req.node_id));
        control_metrics().inc_runs_completed();
        tracing::info!(target: "lease-service", run_id = %req.run_id, node_id = %req.node_id, "run completed");
        Ok(Response::new(CompleteResponse {}))
    }

    async fn fail(&self, request: Request<FailRequest>) -> Result<Response<FailResponse>, Status> {
        let req = request.into_inner();
        let run = self.owned_run(&req.run_id, &req.node_id).await?;
        let from = run.status;

        self.state.leases.release_lease(&req.run_id, &req.node_id);

        // The control plane is authoritative for the retry budget.
        let should_retry = req.retryable && run.retry_count < self.state.dispatch.max_retries;
        if should_retry {
            let mut reverted = run;
            reverted.status = RunStatus::Pending;
            reverted.node_id = None;
            reverted.retry_count += 1;
            reverted.error = Some(hive_types::run::RunErrorInfo {
                error_message: req.error_message.clone(),
                error_details: req.error_details.clone(),
                reason: "retry scheduled".to_string(),
            });
            reverted.timings_ms.extend(timings_map(req.timings_ms));
            self.state
                .store
                .update_run(reverted)
                .await
                .map_err(Self::map_store_error)?;
            self.state
                .events
                .publish(&req.run_id, from, RunStatus::Pending, Some(&req.node_id));
            control_metrics().inc_runs_retried();
            tracing::info!(
                target: "lease-service",
                run_id = %req.run_id,
                node_id = %req.node_id,
                error = %req.error_message,
                "retryable failure; run returned to pending"
            );
        } else {
            self.state
                .store
                .fail_run(
                    &req.run_id,
                    &req.error_message,
                    &req.error_details,
                    timings_map(req.timings_ms),
                )
                .await
                .map_err(Self::map_store_error)?;
            self.state
                .events
                .publish(&req.run_id, from, RunStatus::Failed, Some(&req.node_id));
            control_metrics().inc_runs_failed();
            tracing::info!(
                target: "lease-service",
                run_id = %req.run_id,
                node_id = %req.node_id,
                error = %req.error_message,
                retryable = req.retryable,
                "run failed terminally"
            );
        }

        Ok(Response::new(FailResponse { should_retry }))
    }
}
