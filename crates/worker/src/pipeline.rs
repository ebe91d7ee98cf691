//! The per-lease message pipeline.
//!
//! For each lease: receive one input message, run the poison check, execute
//! the agent in the sandbox, deliver the output, and settle the message.
//! Failures split into retryable (abandon so the broker redelivers, unless
//! redelivery would exceed the delivery budget) and non-retryable
//! (dead-letter), and the lease outcome reported to the control plane
//! mirrors that classification.

use crate::connector::{QueueConnector, QueueMessage};
use crate::executor::Executor;
use crate::sink::HttpSink;
use hive_agent::wire::ExecRequest;
use hive_telemetry::worker_metrics;
use hive_types::agent::AgentSnapshot;
use hive_types::error::{classify_error_text, DeadLetterReason, PipelineError};
use hive_types::run::RunCosts;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Pipeline policy knobs, derived from the worker configuration.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Delivery count beyond which a message is poison.
    pub max_delivery_count: u32,
    /// How long a receive waits before the lease fails with "no input".
    pub max_wait_time: Duration,
    /// Duration budget applied when the agent spec has none.
    pub default_max_duration_seconds: u64,
    /// Token budget applied when the agent spec has none.
    pub default_max_tokens: u32,
}

/// The outcome of processing one lease, reported via `Complete` or `Fail`.
#[derive(Debug, Clone, PartialEq)]
pub enum LeaseOutcome {
    /// Execution and delivery succeeded (or the message was settled without
    /// execution, e.g. poison routing).
    Complete {
        /// JSON result stored with the run.
        result: serde_json::Value,
        /// Phase durations in milliseconds.
        timings_ms: BTreeMap<String, u64>,
        /// Token and spend accounting.
        costs: RunCosts,
    },
    /// Execution or delivery failed.
    Fail {
        /// Short error message.
        error_message: String,
        /// Longer diagnostics.
        error_details: String,
        /// Whether the control plane should consider re-dispatching the run.
        retryable: bool,
        /// Phase durations in milliseconds.
        timings_ms: BTreeMap<String, u64>,
    },
}

impl LeaseOutcome {
    fn fail(message: impl Into<String>, details: impl Into<String>, retryable: bool) -> Self {
        Self::Fail {
            error_message: message.into(),
            error_details: details.into(),
            retryable,
            timings_ms: BTreeMap::new(),
        }
    }

    fn with_timings(mut self, timings: BTreeMap<String, u64>) -> Self {
        match &mut self {
            Self::Complete { timings_ms, .. } | Self::Fail { timings_ms, .. } => {
                *timings_ms = timings;
            }
        }
        self
    }
}

/// Processes leases against one queue, executor, and sink.
#[derive(Debug)]
pub struct LeaseProcessor {
    queue: Arc<dyn QueueConnector>,
    executor: Arc<dyn Executor>,
    sink: Arc<HttpSink>,
    cfg: PipelineConfig,
}

impl LeaseProcessor {
    /// Wires the pipeline together.
    pub fn new(
        queue: Arc<dyn QueueConnector>,
        executor: Arc<dyn Executor>,
        sink: Arc<HttpSink>,
        cfg: PipelineConfig,
    ) -> Self {
        Self { queue, executor, sink, cfg }
    }

    /// Runs the full pipeline for one lease over `run_id`.
    pub async fn process(
        &self,
        run_id: &str,
        agent_spec_json: &str,
        cancel: &CancellationToken,
    ) -> LeaseOutcome {
        let total = Instant::now();
        let mut timings = BTreeMap::new();

        // 1. Receive one input message.
        let receive_started = Instant::now();
        let message = match self.queue.receive(self.cfg.max_wait_time).await {
            Ok(Some(message)) => message,
            Ok(None) => {
                return LeaseOutcome::fail(
                    "no input available",
                    format!(
                        "no message arrived within {}s",
                        self.cfg.max_wait_time.as_secs()
                    ),
                    true,
                );
            }
            Err(e) => {
                return LeaseOutcome::fail("broker receive failed", e.to_string(), true);
            }
        };
        timings.insert("receive_ms".to_string(), receive_started.elapsed().as_millis() as u64);

        // 2. Poison check, before any execution.
        if message.delivery_count > self.cfg.max_delivery_count {
            let description = format!(
                "delivery count {} exceeds maximum {}",
                message.delivery_count, self.cfg.max_delivery_count
            );
            if let Err(e) = self
                .queue
                .dead_letter(&message, DeadLetterReason::PoisonMessage, &description)
                .await
            {
                return LeaseOutcome::fail("broker dead-letter failed", e.to_string(), true);
            }
            worker_metrics().inc_dead_lettered("PoisonMessage");
            tracing::info!(target: "pipeline", run_id, message_id = %message.message_id, "poison message routed without execution");
            timings.insert("total_ms".to_string(), total.elapsed().as_millis() as u64);
            return LeaseOutcome::Complete {
                result: json!({
                    "disposition": "dead-lettered",
                    "reason": DeadLetterReason::PoisonMessage,
                    "messageId": message.message_id,
                }),
                timings_ms: timings,
                costs: RunCosts::default(),
            };
        }

        // 3. Validate the agent snapshot attached to the lease.
        let snapshot = match serde_json::from_str::<AgentSnapshot>(agent_spec_json) {
            Ok(snapshot) => match snapshot.spec.validate() {
                Ok(()) => snapshot,
                Err(e) => {
                    return self
                        .reject(
                            &message,
                            DeadLetterReason::AgentConfigurationError,
                            "agent configuration invalid",
                            &e.to_string(),
                            timings,
                        )
                        .await;
                }
            },
            Err(e) => {
                return self
                    .reject(
                        &message,
                        DeadLetterReason::AgentConfigurationError,
                        "agent spec deserialization failed",
                        &e.to_string(),
                        timings,
                    )
                    .await;
            }
        };

        // 4. Execute in the sandbox, bounded by budget + IPC slack.
        let request = self.exec_request(&snapshot, &message);
        let execute_started = Instant::now();
        let response = tokio::select! {
            _ = cancel.cancelled() => {
                // The in-flight message goes back to the broker; the child is
                // killed by the dropped executor future.
                if let Err(e) = self.queue.abandon(&message).await {
                    tracing::warn!(target: "pipeline", run_id, error = %e, "abandon on cancel failed");
                }
                return LeaseOutcome::fail(
                    "worker cancelled",
                    "shutdown requested while the run was executing",
                    true,
                )
                .with_timings(timings);
            }
            result = self.executor.execute(&request) => result,
        };
        timings.insert("execute_ms".to_string(), execute_started.elapsed().as_millis() as u64);

        let response = match response {
            Ok(response) => response,
            Err(e) => {
                timings.insert("total_ms".to_string(), total.elapsed().as_millis() as u64);
                return self.settle_failure(&message, &e.to_string(), e.is_retryable(), timings).await;
            }
        };

        let costs = RunCosts {
            tokens_in: response.tokens_in,
            tokens_out: response.tokens_out,
            usd: response.usd_cost,
        };
        timings.insert("agent_ms".to_string(), response.duration_ms);

        if !response.success {
            let error = response
                .error
                .unwrap_or_else(|| "agent reported failure without detail".to_string());
            timings.insert("total_ms".to_string(), total.elapsed().as_millis() as u64);
            return self
                .settle_failure(&message, &error, classify_error_text(&error), timings)
                .await;
        }

        // 5. Deliver to the output sink.
        let payload = json!({
            "runId": run_id,
            "messageId": message.message_id,
            "agentId": snapshot.agent_id,
            "version": snapshot.version,
            "output": response.output,
            "tokensIn": response.tokens_in,
            "tokensOut": response.tokens_out,
            "usdCost": response.usd_cost,
        });
        let deliver_started = Instant::now();
        match self.sink.deliver(run_id, &message.message_id, &payload).await {
            Ok(_attempts) => {
                timings.insert("deliver_ms".to_string(), deliver_started.elapsed().as_millis() as u64);
            }
            Err(e) => {
                timings.insert("deliver_ms".to_string(), deliver_started.elapsed().as_millis() as u64);
                timings.insert("total_ms".to_string(), total.elapsed().as_millis() as u64);
                return self.settle_failure(&message, &e.to_string(), e.is_retryable(), timings).await;
            }
        }

        // 6. Settle the input and report success. If completion fails the
        // broker will redeliver, and the idempotency key makes the repeat
        // delivery a no-op at the sink.
        if let Err(e) = self.queue.complete(&message).await {
            tracing::warn!(target: "pipeline", run_id, message_id = %message.message_id, error = %e, "message completion failed; relying on sink idempotency for the redelivery");
        }
        timings.insert("total_ms".to_string(), total.elapsed().as_millis() as u64);
        LeaseOutcome::Complete {
            result: payload,
            timings_ms: timings,
            costs,
        }
    }

    fn exec_request(&self, snapshot: &AgentSnapshot, message: &QueueMessage) -> ExecRequest {
        let spec = &snapshot.spec;
        let budget = spec.budget.unwrap_or_default();
        ExecRequest {
            agent_id: snapshot.agent_id.clone(),
            version: snapshot.version.clone(),
            name: spec.name.clone(),
            instructions: spec.instructions.clone(),
            input: message.body.clone(),
            max_tokens: budget.max_tokens.or(Some(self.cfg.default_max_tokens)),
            max_duration_seconds: budget
                .max_duration_seconds
                .or(Some(self.cfg.default_max_duration_seconds)),
            model_profile: Some(spec.model_profile.clone()),
        }
    }

    /// Routes a failed message: abandon for redelivery when retryable and
    /// within the delivery budget, dead-letter otherwise.
    async fn settle_failure(
        &self,
        message: &QueueMessage,
        error: &str,
        retryable: bool,
        timings: BTreeMap<String, u64>,
    ) -> LeaseOutcome {
        if !retryable {
            return self
                .reject(
                    message,
                    DeadLetterReason::NonRetryableError,
                    error,
                    error,
                    timings,
                )
                .await;
        }

        // One more delivery would exceed the budget: dead-letter instead of
        // bouncing the message forever.
        if message.delivery_count >= self.cfg.max_delivery_count {
            let description = format!(
                "delivery count {} reached maximum {}; last error: {error}",
                message.delivery_count, self.cfg.max_delivery_count
            );
            if let Err(e) = self
                .queue
                .dead_letter(message, DeadLetterReason::MaxDeliveryCountExceeded, &description)
                .await
            {
                tracing::warn!(target: "pipeline", error = %e, "dead-letter failed");
            }
            worker_metrics().inc_dead_lettered("MaxDeliveryCountExceeded");
            return LeaseOutcome::fail(error, description, true).with_timings(timings);
        }

        if let Err(e) = self.queue.abandon(message).await {
            tracing::warn!(target: "pipeline", error = %e, "abandon failed");
        }
        LeaseOutcome::fail(error, format!("abandoned for redelivery: {error}"), true)
            .with_timings(timings)
    }

    async fn reject(
        &self,
        message: &QueueMessage,
        reason: DeadLetterReason,
        error: &str,
        details: &str,
        timings: BTreeMap<String, u64>,
    ) -> LeaseOutcome {
        if let Err(e) = self.queue.dead_letter(message, reason, details).await {
            tracing::warn!(target: "pipeline", error = %e, "dead-letter failed");
        }
        worker_metrics().inc_dead_lettered(&reason.to_string());
        LeaseOutcome::fail(error, details, false).with_timings(timings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::MemoryQueue;
    use async_trait::async_trait;
    use hive_agent::wire::ExecResponse;
    use hive_types::agent::{AgentSpec, ConnectorConfig, ConnectorKind};
    use hive_types::config::OutputConfig;
    use parking_lot::Mutex;

    #[derive(Debug, Default)]
    struct FakeExecutor {
        responses: Mutex<Vec<Result<ExecResponse, PipelineError>>>,
        calls: Mutex<u32>,
    }

    impl FakeExecutor {
        fn with(response: Result<ExecResponse, PipelineError>) -> Arc<Self> {
            let fake = Self::default();
            fake.responses.lock().push(response);
            Arc::new(fake)
        }

        fn calls(&self) -> u32 {
            *self.calls.lock()
        }
    }

    #[async_trait]
    impl Executor for FakeExecutor {
        async fn execute(&self, _request: &ExecRequest) -> Result<ExecResponse, PipelineError> {
            *self.calls.lock() += 1;
            self.responses.lock().pop().unwrap_or_else(|| {
                Ok(ExecResponse {
                    success: true,
                    output: Some("ok".to_string()),
                    error: None,
                    tokens_in: 10,
                    tokens_out: 5,
                    duration_ms: 3,
                    usd_cost: 0.0006,
                })
            })
        }
    }

    fn spec_json() -> String {
        let now = chrono::Utc::now();
        let spec = AgentSpec {
            id: "agent-1".into(),
            name: "triage".into(),
            description: String::new(),
            instructions: "Classify.".into(),
            model_profile: std::collections::BTreeMap::from([(
                "model".to_string(),
                json!("gpt-4o"),
            )]),
            budget: None,
            tools: vec![],
            input: ConnectorConfig { kind: ConnectorKind::ServiceBus, settings: Default::default() },
            output: ConnectorConfig { kind: ConnectorKind::Http, settings: Default::default() },
            metadata: Default::default(),
            created_at: now,
            updated_at: now,
        };
        let snapshot = AgentSnapshot {
            agent_id: spec.id.clone(),
            version: "1.0.0".to_string(),
            spec,
        };
        serde_json::to_string(&snapshot).unwrap()
    }

    fn pipeline_cfg() -> PipelineConfig {
        PipelineConfig {
            max_delivery_count: 3,
            max_wait_time: Duration::from_millis(100),
            default_max_duration_seconds: 5,
            default_max_tokens: 256,
        }
    }

    // A sink pointed at a closed port; only reached by tests that expect
    // delivery to fail or never run.
    fn dead_sink() -> Arc<HttpSink> {
        Arc::new(
            HttpSink::new(OutputConfig {
                endpoint: "http://127.0.0.1:9/sink".to_string(),
                timeout_seconds: 1,
                max_retries: 0,
                base_delay_ms: 1,
                max_retry_delay_ms: 1,
                headers: Default::default(),
            })
            .unwrap(),
        )
    }

    #[tokio::test]
    async fn empty_queue_fails_the_lease_retryable() {
        let queue = MemoryQueue::new();
        let executor = FakeExecutor::with(Ok(ExecResponse::failure("unused", 0)));
        let processor = LeaseProcessor::new(queue, executor.clone(), dead_sink(), pipeline_cfg());

        let outcome = processor
            .process("run-1", &spec_json(), &CancellationToken::new())
            .await;

        match outcome {
            LeaseOutcome::Fail { error_message, retryable, .. } => {
                assert!(error_message.contains("no input"));
                assert!(retryable);
            }
            other => panic!("expected Fail, got {other:?}"),
        }
        assert_eq!(executor.calls(), 0);
    }

    #[tokio::test]
    async fn poison_message_routes_to_dlq_without_execution() {
        let queue = MemoryQueue::new();
        // Already delivered 3 times elsewhere; this receive makes it 4 > 3.
        queue.enqueue_with_id("msg-poison", json!({"n": 1}), 3);
        let executor = Arc::new(FakeExecutor::default());
        let processor =
            LeaseProcessor::new(queue.clone(), executor.clone(), dead_sink(), pipeline_cfg());

        let outcome = processor
            .process("run-1", &spec_json(), &CancellationToken::new())
            .await;

        assert!(matches!(outcome, LeaseOutcome::Complete { .. }));
        assert_eq!(executor.calls(), 0);
        let dead = queue.dead_letters();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].reason, DeadLetterReason::PoisonMessage);
    }

    #[tokio::test]
    async fn invalid_agent_spec_dead_letters_and_fails_permanently() {
        let queue = MemoryQueue::new();
        queue.enqueue(json!({"n": 1}));
        let executor = Arc::new(FakeExecutor::default());
        let processor =
            LeaseProcessor::new(queue.clone(), executor.clone(), dead_sink(), pipeline_cfg());

        let outcome = processor
            .process("run-1", "{\"not\": \"an agent\"}", &CancellationToken::new())
            .await;

        match outcome {
            LeaseOutcome::Fail { retryable, .. } => assert!(!retryable),
            other => panic!("expected Fail, got {other:?}"),
        }
        assert_eq!(executor.calls(), 0);
        let dead = queue.dead_letters();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].reason, DeadLetterReason::AgentConfigurationError);
    }

    #[tokio::test]
    async fn budget_exhaustion_is_non_retryable_and_dead_letters() {
        let queue = MemoryQueue::new();
        queue.enqueue(json!({"n": 1}));
        let executor = FakeExecutor::with(Err(PipelineError::NonRetryable {
            reason: DeadLetterReason::NonRetryableError,
            detail: "agent execution exceeded maximum duration of 60s".to_string(),
        }));
        let processor =
            LeaseProcessor::new(queue.clone(), executor, dead_sink(), pipeline_cfg());

        let outcome = processor
            .process("run-1", &spec_json(), &CancellationToken::new())
            .await;

        match outcome {
            LeaseOutcome::Fail { error_message, retryable, .. } => {
                assert!(error_message.contains("exceeded maximum duration"));
                assert!(!retryable);
            }
            other => panic!("expected Fail, got {other:?}"),
        }
        assert_eq!(queue.dead_letters().len(), 1);
    }

    #[tokio::test]
    async fn transient_failure_abandons_for_redelivery() {
        let queue = MemoryQueue::new();
        queue.enqueue(json!({"n": 1}));
        let executor = FakeExecutor::with(Err(PipelineError::Transient(
            "connection reset by peer".to_string(),
        )));
        let processor =
            LeaseProcessor::new(queue.clone(), executor, dead_sink(), pipeline_cfg());

        let outcome = processor
            .process("run-1", &spec_json(), &CancellationToken::new())
            .await;

        match outcome {
            LeaseOutcome::Fail { retryable, .. } => assert!(retryable),
            other => panic!("expected Fail, got {other:?}"),
        }
        // Abandoned, not dead-lettered: available for redelivery.
        assert_eq!(queue.dead_letters().len(), 0);
        assert_eq!(queue.backlog(), 1);
    }

    #[tokio::test]
    async fn final_allowed_delivery_dead_letters_on_transient_failure() {
        let queue = MemoryQueue::new();
        // Third delivery is the last allowed (max_delivery_count = 3).
        queue.enqueue_with_id("msg-1", json!({"n": 1}), 2);
        let executor = FakeExecutor::with(Err(PipelineError::Transient("flaky".to_string())));
        let processor =
            LeaseProcessor::new(queue.clone(), executor, dead_sink(), pipeline_cfg());

        let outcome = processor
            .process("run-1", &spec_json(), &CancellationToken::new())
            .await;

        match outcome {
            LeaseOutcome::Fail { retryable, .. } => assert!(retryable),
            other => panic!("expected Fail, got {other:?}"),
        }
        let dead = queue.dead_letters();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].reason, DeadLetterReason::MaxDeliveryCountExceeded);
        assert_eq!(queue.backlog(), 0);
    }

    #[tokio::test]
    async fn agent_reported_unauthorized_is_permanent() {
        let queue = MemoryQueue::new();
        queue.enqueue(json!({"n": 1}));
        let executor = FakeExecutor::with(Ok(ExecResponse::failure(
            "provider returned status 401 Unauthorized: bad key",
            12,
        )));
        let processor =
            LeaseProcessor::new(queue.clone(), executor, dead_sink(), pipeline_cfg());

        let outcome = processor
            .process("run-1", &spec_json(), &CancellationToken::new())
            .await;

        match outcome {
            LeaseOutcome::Fail { retryable, .. } => assert!(!retryable),
            other => panic!("expected Fail, got {other:?}"),
        }
        assert_eq!(
            queue.dead_letters()[0].reason,
            DeadLetterReason::NonRetryableError
        );
    }

    #[tokio::test]
    async fn cancellation_abandons_the_message_and_fails_retryable() {
        let queue = MemoryQueue::new();
        queue.enqueue(json!({"n": 1}));

        #[derive(Debug)]
        struct Stalling;
        #[async_trait]
        impl Executor for Stalling {
            async fn execute(&self, _request: &ExecRequest) -> Result<ExecResponse, PipelineError> {
                tokio::time::sleep(Duration::from_secs(60)).await;
                unreachable!("cancelled before completion")
            }
        }

        let processor = LeaseProcessor::new(
            queue.clone(),
            Arc::new(Stalling),
            dead_sink(),
            pipeline_cfg(),
        );
        let cancel = CancellationToken::new();
        let cancel_soon = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel_soon.cancel();
        });

        let spec = spec_json();
        let outcome = processor.process("run-1", &spec, &cancel).await;
        match outcome {
            LeaseOutcome::Fail { error_message, retryable, .. } => {
                assert!(error_message.contains("cancelled"));
                assert!(retryable);
            }
            other => panic!("expected Fail, got {other:?}"),
        }
        assert_eq!(queue.backlog(), 1);
    }
}
