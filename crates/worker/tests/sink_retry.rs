//! Integration tests for the HTTP output sink against a local server:
//! transient 5xx responses are retried with an unchanged idempotency key,
//! permanent 4xx responses are not.

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use axum::Router;
use hive_types::config::OutputConfig;
use hive_worker::sink::HttpSink;
use parking_lot::Mutex;
use std::sync::Arc;

#[derive(Default)]
struct Received {
    keys: Mutex<Vec<String>>,
    fail_first: u32,
}

async fn results_handler(
    State(state): State<Arc<Received>>,
    headers: HeaderMap,
) -> StatusCode {
    let key = headers
        .get("Idempotency-Key")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();
    let mut keys = state.keys.lock();
    keys.push(key);
    if (keys.len() as u32) <= state.fail_first {
        StatusCode::INTERNAL_SERVER_ERROR
    } else {
        StatusCode::OK
    }
}

async fn serve(fail_first: u32) -> (Arc<Received>, String) {
    let state = Arc::new(Received { keys: Mutex::new(Vec::new()), fail_first });
    let app = Router::new()
        .route("/results", post(results_handler))
        .with_state(Arc::clone(&state));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (state, format!("http://{addr}/results"))
}

fn sink_cfg(endpoint: String) -> OutputConfig {
    OutputConfig {
        endpoint,
        timeout_seconds: 5,
        max_retries: 3,
        base_delay_ms: 10,
        max_retry_delay_ms: 50,
        headers: std::collections::BTreeMap::from([(
            "X-Env".to_string(),
            "test".to_string(),
        )]),
    }
}

#[tokio::test]
async fn transient_5xx_is_retried_with_the_same_idempotency_key() {
    let (state, endpoint) = serve(2).await;
    let sink = HttpSink::new(sink_cfg(endpoint)).unwrap();

    let attempts = sink
        .deliver("run-9", "msg-5", &serde_json::json!({"output": "done"}))
        .await
        .unwrap();

    assert_eq!(attempts, 3);
    let keys = state.keys.lock().clone();
    assert_eq!(keys.len(), 3);
    assert!(keys.iter().all(|k| k == "run-9-msg-5"));
}

#[tokio::test]
async fn permanent_4xx_is_not_retried() {
    async fn reject(_headers: HeaderMap) -> StatusCode {
        StatusCode::UNPROCESSABLE_ENTITY
    }
    let hits = Arc::new(Mutex::new(0u32));
    let hits_handler = Arc::clone(&hits);
    let app = Router::new().route(
        "/results",
        post(move || {
            let hits = Arc::clone(&hits_handler);
            async move {
                *hits.lock() += 1;
                reject(HeaderMap::new()).await
            }
        }),
    );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let sink = HttpSink::new(sink_cfg(format!("http://{addr}/results"))).unwrap();
    let err = sink
        .deliver("run-1", "msg-1", &serde_json::json!({}))
        .await
        .unwrap_err();

    assert!(!err.is_retryable());
    assert_eq!(*hits.lock(), 1);
}
