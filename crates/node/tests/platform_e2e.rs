//! End-to-end: a real control plane (REST + gRPC), a real worker runtime,
//! and the real `agent-exec` child binary (mock model provider), wired over
//! loopback TCP with an in-process broker and a local HTTP sink.

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use axum::Json as AxumJson;
use axum::Router;
use hive_node::start_control_plane;
use hive_storage::MemoryStore;
use hive_types::config::{
    AgentRuntimeConfig, ControlPlaneConfig, DispatchConfig, ListenConfig, LivenessConfig,
    NodeRuntimeConfig, OutputConfig, QueueConfig, WorkerConfig,
};
use hive_types::node::NodeCapacity;
use hive_types::run::{Run, RunStatus};
use hive_worker::connector::MemoryQueue;
use hive_worker::runtime::NodeRuntime;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

#[derive(Default)]
struct SinkRecorder {
    deliveries: Mutex<Vec<(String, serde_json::Value)>>,
}

async fn sink_handler(
    State(recorder): State<Arc<SinkRecorder>>,
    headers: HeaderMap,
    AxumJson(body): AxumJson<serde_json::Value>,
) -> StatusCode {
    let key = headers
        .get("Idempotency-Key")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();
    recorder.deliveries.lock().push((key, body));
    StatusCode::OK
}

async fn start_sink() -> (Arc<SinkRecorder>, String) {
    let recorder = Arc::new(SinkRecorder::default());
    let app = Router::new()
        .route("/results", post(sink_handler))
        .with_state(Arc::clone(&recorder));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (recorder, format!("http://{addr}/results"))
}

fn control_config() -> ControlPlaneConfig {
    ControlPlaneConfig {
        listen: ListenConfig {
            rest_addr: "127.0.0.1:0".to_string(),
            grpc_addr: "127.0.0.1:0".to_string(),
            telemetry_addr: "127.0.0.1:0".to_string(),
        },
        storage: Default::default(),
        dispatch: DispatchConfig { lease_ttl_seconds: 30, interval_ms: 100, max_retries: 3 },
        liveness: LivenessConfig::default(),
    }
}

fn worker_config(node_id: &str, rest: &str, grpc: &str, sink: &str) -> WorkerConfig {
    WorkerConfig {
        node_runtime: NodeRuntimeConfig {
            node_id: node_id.to_string(),
            control_plane_url: rest.to_string(),
            lease_service_url: Some(grpc.to_string()),
            max_concurrent_leases: 2,
            heartbeat_interval_seconds: 1,
            drain_window_seconds: 5,
            capacity: NodeCapacity { slots: 2, cpu: None, memory: None },
            metadata: BTreeMap::from([(
                "region".to_string(),
                serde_json::json!("us-east-1"),
            )]),
        },
        queue: QueueConfig { max_wait_time_seconds: 1, ..QueueConfig::default() },
        agent_runtime: AgentRuntimeConfig {
            executor_path: Some(env!("CARGO_BIN_EXE_agent-exec").to_string()),
            max_duration_seconds: 20,
            ..AgentRuntimeConfig::default()
        },
        output: OutputConfig {
            endpoint: sink.to_string(),
            timeout_seconds: 5,
            max_retries: 3,
            base_delay_ms: 50,
            max_retry_delay_ms: 500,
            headers: BTreeMap::new(),
        },
        telemetry_addr: "127.0.0.1:0".to_string(),
    }
}

async fn create_agent_and_version(http: &reqwest::Client, rest: &str) -> String {
    let agent: serde_json::Value = http
        .post(format!("{rest}/v1/agents"))
        .json(&serde_json::json!({
            "name": "invoice-triage",
            "instructions": "Classify the invoice and extract the total.",
            "model_profile": {"model": "gpt-4o"},
            "input": {"kind": "service-bus", "settings": {"queue": "agent-input"}},
            "output": {"kind": "http", "settings": {}},
        }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let agent_id = agent["id"].as_str().unwrap().to_string();

    let response = http
        .post(format!("{rest}/v1/agents/{agent_id}:version"))
        .json(&serde_json::json!({"version": "1.0.0"}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::CREATED);
    agent_id
}

async fn create_run(http: &reqwest::Client, rest: &str, agent_id: &str) -> Run {
    http.post(format!("{rest}/v1/runs"))
        .json(&serde_json::json!({"agent_id": agent_id, "version": "1.0.0"}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap()
}

async fn wait_for_terminal(http: &reqwest::Client, rest: &str, run_id: &str, within: Duration) -> Run {
    let deadline = Instant::now() + within;
    loop {
        let run: Run = http
            .get(format!("{rest}/v1/runs/{run_id}"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        if run.status.is_terminal() {
            return run;
        }
        assert!(Instant::now() < deadline, "run did not settle in time: {run:?}");
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
}

#[tokio::test]
async fn full_platform_executes_a_run_end_to_end() {
    let cancel = CancellationToken::new();
    let control = start_control_plane(
        &control_config(),
        Arc::new(MemoryStore::new()),
        cancel.clone(),
    )
    .await
    .unwrap();
    let rest = format!("http://{}", control.rest_addr);
    let grpc = format!("http://{}", control.grpc_addr);
    let (sink, sink_url) = start_sink().await;

    let http = reqwest::Client::new();
    let agent_id = create_agent_and_version(&http, &rest).await;
    let run = create_run(&http, &rest, &agent_id).await;
    assert_eq!(run.status, RunStatus::Pending);

    let queue = MemoryQueue::new();
    let message_id = queue.enqueue(serde_json::json!({"invoice": "INV-77", "total": 812.50}));

    let worker = NodeRuntime::new(
        worker_config("node-e2e", &rest, &grpc, &sink_url),
        queue,
    )
    .unwrap();
    let worker_cancel = cancel.child_token();
    let worker_task = tokio::spawn(async move { worker.run(worker_cancel).await });

    let settled = wait_for_terminal(&http, &rest, &run.id, Duration::from_secs(30)).await;
    assert_eq!(settled.status, RunStatus::Completed, "run: {settled:?}");
    assert_eq!(settled.node_id, None);
    assert!(settled.costs.tokens_in > 0);
    assert!(settled.costs.usd > 0.0);
    assert!(settled.terminal_at.is_some());

    // Exactly one effective delivery, keyed for idempotent dedup.
    let deliveries = sink.deliveries.lock().clone();
    assert_eq!(deliveries.len(), 1);
    let (key, body) = &deliveries[0];
    assert_eq!(key, &format!("{}-{}", run.id, message_id));
    assert_eq!(body["runId"].as_str().unwrap(), run.id);
    assert!(body["output"].as_str().unwrap().contains("mock"));

    // The node registered and heartbeats keep it active.
    let node: serde_json::Value = http
        .get(format!("{rest}/v1/nodes/node-e2e"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(node["status"]["state"].as_str().unwrap(), "active");

    cancel.cancel();
    let _ = tokio::time::timeout(Duration::from_secs(10), worker_task).await;
}

#[tokio::test]
async fn starved_worker_exhausts_the_retry_budget_and_fails_the_run() {
    let cancel = CancellationToken::new();
    let control = start_control_plane(
        &control_config(),
        Arc::new(MemoryStore::new()),
        cancel.clone(),
    )
    .await
    .unwrap();
    let rest = format!("http://{}", control.rest_addr);
    let grpc = format!("http://{}", control.grpc_addr);
    let (_sink, sink_url) = start_sink().await;

    let http = reqwest::Client::new();
    let agent_id = create_agent_and_version(&http, &rest).await;
    let run = create_run(&http, &rest, &agent_id).await;

    // An empty broker: every lease fails retryable with "no input", and the
    // control plane terminates the run once the budget is spent.
    let queue = MemoryQueue::new();
    let worker = NodeRuntime::new(
        worker_config("node-starved", &rest, &grpc, &sink_url),
        queue,
    )
    .unwrap();
    let worker_cancel = cancel.child_token();
    let worker_task = tokio::spawn(async move { worker.run(worker_cancel).await });

    let settled = wait_for_terminal(&http, &rest, &run.id, Duration::from_secs(30)).await;
    assert_eq!(settled.status, RunStatus::Failed, "run: {settled:?}");
    assert_eq!(settled.retry_count, 3);
    assert!(settled
        .error
        .as_ref()
        .unwrap()
        .error_message
        .contains("no input"));

    cancel.cancel();
    let _ = tokio::time::timeout(Duration::from_secs(10), worker_task).await;
}
