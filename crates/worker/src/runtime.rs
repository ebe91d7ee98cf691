//! The node runtime: registration, heartbeats, the streaming pull loop with
//! exponential-backoff reconnection, concurrency-limited lease processing,
//! and shutdown draining.

use crate::api::ControlPlaneApi;
use crate::connector::QueueConnector;
use crate::executor::{Executor, ProcessExecutor};
use crate::pipeline::{LeaseOutcome, LeaseProcessor, PipelineConfig};
use crate::sink::HttpSink;
use anyhow::{Context, Result};
use chrono::Utc;
use hive_ipc::lease::lease_service_client::LeaseServiceClient;
use hive_ipc::lease::{AckRequest, CompleteRequest, FailRequest, LeaseGrant, PullRequest, RunCosts as WireCosts};
use hive_telemetry::worker_metrics;
use hive_types::config::WorkerConfig;
use hive_types::node::{NodeState, NodeStatus};
use rand::Rng;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tonic::transport::Channel;

/// Reconnect backoff ceiling, seconds.
const MAX_BACKOFF_SECONDS: u64 = 60;

fn backoff_delay(attempt: u32) -> Duration {
    let base = 2u64.saturating_pow(attempt.min(6)).min(MAX_BACKOFF_SECONDS);
    let jitter = rand::thread_rng().gen_range(0.0..2.0);
    Duration::from_secs_f64(base as f64 + jitter)
}

#[derive(Debug, Default)]
struct Counters {
    active_leases: AtomicU32,
}

/// One worker node for the lifetime of the process.
pub struct NodeRuntime {
    cfg: WorkerConfig,
    api: ControlPlaneApi,
    processor: Arc<LeaseProcessor>,
    counters: Arc<Counters>,
    semaphore: Arc<Semaphore>,
}

impl NodeRuntime {
    /// Wires the runtime from its configuration and the input connector.
    pub fn new(cfg: WorkerConfig, queue: Arc<dyn QueueConnector>) -> Result<Self> {
        let api = ControlPlaneApi::new(&cfg.node_runtime.control_plane_url)?;
        let sink = Arc::new(
            HttpSink::new(cfg.output.clone()).map_err(|e| anyhow::anyhow!(e.to_string()))?,
        );
        let executor: Arc<dyn Executor> = Arc::new(
            ProcessExecutor::from_config(
                cfg.agent_runtime.executor_path.as_deref(),
                &cfg.agent_runtime.foundry,
            )
            .map_err(|e| anyhow::anyhow!(e.to_string()))?,
        );
        let pipeline_cfg = PipelineConfig {
            max_delivery_count: cfg.queue.max_delivery_count,
            max_wait_time: Duration::from_secs(cfg.queue.max_wait_time_seconds),
            default_max_duration_seconds: cfg.agent_runtime.max_duration_seconds,
            default_max_tokens: cfg.agent_runtime.max_tokens,
        };
        let processor = Arc::new(LeaseProcessor::new(queue, executor, sink, pipeline_cfg));
        let max_leases = cfg.node_runtime.max_concurrent_leases as usize;
        Ok(Self {
            cfg,
            api,
            processor,
            counters: Arc::new(Counters::default()),
            semaphore: Arc::new(Semaphore::new(max_leases)),
        })
    }

    fn status(&self, state: NodeState) -> NodeStatus {
        let active = self.counters.active_leases.load(Ordering::SeqCst);
        NodeStatus {
            state,
            active_runs: active,
            available_slots: self.cfg.node_runtime.max_concurrent_leases.saturating_sub(active),
        }
    }

    fn grpc_endpoint(&self) -> String {
        let raw = self
            .cfg
            .node_runtime
            .lease_service_url
            .clone()
            .unwrap_or_else(|| self.cfg.node_runtime.control_plane_url.clone());
        if raw.starts_with("http") {
            raw
        } else {
            format!("http://{raw}")
        }
    }

    /// Runs the node until `cancel` fires: register, heartbeat, pull, drain.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let node = &self.cfg.node_runtime;
        self.api
            .register(&node.node_id, &node.metadata, &node.capacity)
            .await
            .context("node registration failed")?;
        tracing::info!(target: "worker", node_id = %node.node_id, "registered with control plane");

        let heartbeat = self.spawn_heartbeat(cancel.clone());

        self.pull_loop(&cancel).await;

        // Drain: wait for in-flight leases within the window, then send a
        // final draining heartbeat.
        let drain_window = Duration::from_secs(node.drain_window_seconds);
        let drained = tokio::time::timeout(drain_window, async {
            while self.counters.active_leases.load(Ordering::SeqCst) > 0 {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        })
        .await
        .is_ok();
        if !drained {
            tracing::warn!(
                target: "worker",
                in_flight = self.counters.active_leases.load(Ordering::SeqCst),
                "drain window expired with leases still in flight"
            );
        }

        if let Err(e) = self
            .api
            .heartbeat(&node.node_id, &self.status(NodeState::Draining))
            .await
        {
            tracing::warn!(target: "worker", error = %e, "final draining heartbeat failed");
        }
        heartbeat.abort();
        tracing::info!(target: "worker", node_id = %node.node_id, "shutdown complete");
        Ok(())
    }

    fn spawn_heartbeat(&self, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        let api = self.api.clone();
        let node_id = self.cfg.node_runtime.node_id.clone();
        let interval = Duration::from_secs(self.cfg.node_runtime.heartbeat_interval_seconds);
        let max = self.cfg.node_runtime.max_concurrent_leases;
        let counters = Arc::clone(&self.counters);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            let mut consecutive_failures: u32 = 0;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let active = counters.active_leases.load(Ordering::SeqCst);
                let status = NodeStatus {
                    state: NodeState::Active,
                    active_runs: active,
                    available_slots: max.saturating_sub(active),
                };
                match api.heartbeat(&node_id, &status).await {
                    Ok(()) => consecutive_failures = 0,
                    Err(e) => {
                        consecutive_failures += 1;
                        // Heartbeat failures never terminate the process;
                        // past three missed intervals the control plane will
                        // consider us unreachable, so escalate to error.
                        if consecutive_failures >= 3 {
                            tracing::error!(target: "worker", error = %e, consecutive_failures, "heartbeat failing");
                        } else {
                            tracing::warn!(target: "worker", error = %e, "heartbeat failed");
                        }
                    }
                }
            }
        })
    }

    async fn pull_loop(&self, cancel: &CancellationToken) {
        let endpoint = self.grpc_endpoint();
        let mut attempt: u32 = 0;
        loop {
            if cancel.is_cancelled() {
                return;
            }
            let channel = match Channel::from_shared(endpoint.clone()) {
                Ok(endpoint) => endpoint.connect_lazy(),
                Err(e) => {
                    tracing::error!(target: "worker", error = %e, "invalid lease service endpoint");
                    return;
                }
            };
            let mut client = LeaseServiceClient::new(channel);

            let request = PullRequest {
                node_id: self.cfg.node_runtime.node_id.clone(),
                max_leases: self.cfg.node_runtime.max_concurrent_leases,
            };
            match client.pull(request).await {
                Ok(response) => {
                    tracing::info!(target: "worker", "pull stream open");
                    attempt = 0;
                    let mut stream = response.into_inner();
                    loop {
                        let message = tokio::select! {
                            _ = cancel.cancelled() => return,
                            message = stream.message() => message,
                        };
                        match message {
                            Ok(Some(grant)) => {
                                if self.handle_grant(&mut client, grant, cancel).await.is_err() {
                                    return;
                                }
                            }
                            Ok(None) => {
                                tracing::warn!(target: "worker", "pull stream closed by server");
                                break;
                            }
                            Err(status) => {
                                tracing::warn!(target: "worker", error = %status, "pull stream error");
                                break;
                            }
                        }
                    }
                }
                Err(status) => {
                    tracing::warn!(target: "worker", error = %status, attempt, "pull connect failed");
                }
            }

            let delay = backoff_delay(attempt);
            attempt = attempt.saturating_add(1);
            tracing::info!(target: "worker", delay_ms = delay.as_millis() as u64, "reconnecting after backoff");
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Acquires a processing slot, acks the grant, and spawns the pipeline.
    /// Backpressure decision: no Ack is sent until a slot is free, so the
    /// stream is consumed at the rate of local capacity.
    async fn handle_grant(
        &self,
        client: &mut LeaseServiceClient<Channel>,
        grant: LeaseGrant,
        cancel: &CancellationToken,
    ) -> Result<(), ()> {
        let permit = tokio::select! {
            _ = cancel.cancelled() => return Err(()),
            permit = Arc::clone(&self.semaphore).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => return Err(()),
            },
        };

        worker_metrics().inc_leases_received();
        let ack = AckRequest {
            lease_id: grant.lease_id.clone(),
            run_id: grant.run_id.clone(),
            node_id: self.cfg.node_runtime.node_id.clone(),
            timestamp_unix_ms: Utc::now().timestamp_millis(),
        };
        if let Err(status) = client.ack(ack).await {
            tracing::warn!(target: "worker", run_id = %grant.run_id, error = %status, "ack failed");
        }

        let active = self.counters.active_leases.fetch_add(1, Ordering::SeqCst) + 1;
        worker_metrics().set_active_leases(u64::from(active));

        let processor = Arc::clone(&self.processor);
        let counters = Arc::clone(&self.counters);
        let node_id = self.cfg.node_runtime.node_id.clone();
        let mut report_client = client.clone();
        let lease_cancel = cancel.child_token();
        tokio::spawn(async move {
            let started = std::time::Instant::now();
            let outcome = processor
                .process(&grant.run_id, &grant.agent_spec, &lease_cancel)
                .await;
            worker_metrics().observe_execution_duration(started.elapsed().as_secs_f64());

            match outcome {
                LeaseOutcome::Complete { result, timings_ms, costs } => {
                    worker_metrics().inc_leases_completed();
                    let request = CompleteRequest {
                        lease_id: grant.lease_id.clone(),
                        run_id: grant.run_id.clone(),
                        node_id: node_id.clone(),
                        result: result.to_string(),
                        timings_ms: timings_ms.into_iter().collect(),
                        costs: Some(WireCosts {
                            tokens_in: costs.tokens_in,
                            tokens_out: costs.tokens_out,
                            usd: costs.usd,
                        }),
                    };
                    if let Err(status) = report_client.complete(request).await {
                        tracing::warn!(target: "worker", run_id = %grant.run_id, error = %status, "complete report failed");
                    }
                }
                LeaseOutcome::Fail { error_message, error_details, retryable, timings_ms } => {
                    worker_metrics().inc_leases_failed();
                    let request = FailRequest {
                        lease_id: grant.lease_id.clone(),
                        run_id: grant.run_id.clone(),
                        node_id: node_id.clone(),
                        error_message,
                        error_details,
                        timings_ms: timings_ms.into_iter().collect(),
                        retryable,
                    };
                    match report_client.fail(request).await {
                        Ok(response) => {
                            let should_retry = response.into_inner().should_retry;
                            tracing::info!(target: "worker", run_id = %grant.run_id, should_retry, "fail reported");
                        }
                        Err(status) => {
                            tracing::warn!(target: "worker", run_id = %grant.run_id, error = %status, "fail report failed");
                        }
                    }
                }
            }

            let active = counters.active_leases.fetch_sub(1, Ordering::SeqCst) - 1;
            worker_metrics().set_active_leases(u64::from(active));
            drop(permit);
        });
        Ok(())
    }
}
