//! The HTTP output sink.
//!
//! Delivery is POST with a caller-configured header set plus an
//! `Idempotency-Key: {run_id}-{message_id}`, so any number of retries
//! produces at most one effective write on a sink that honors the header.
//! Connection errors, 408, 429, and 5xx are retried with exponential
//! backoff; other 4xx are permanent.

use hive_telemetry::worker_metrics;
use hive_types::config::OutputConfig;
use hive_types::error::PipelineError;
use std::time::Duration;

/// The HTTP sink results are delivered to.
#[derive(Debug)]
pub struct HttpSink {
    http: reqwest::Client,
    cfg: OutputConfig,
}

fn retryable_status(status: reqwest::StatusCode) -> bool {
    status.as_u16() == 408 || status.as_u16() == 429 || status.is_server_error()
}

impl HttpSink {
    /// Builds the sink from its configuration.
    pub fn new(cfg: OutputConfig) -> Result<Self, PipelineError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(cfg.timeout_seconds))
            .build()
            .map_err(|e| PipelineError::Config(format!("failed to build sink HTTP client: {e}")))?;
        Ok(Self { http, cfg })
    }

    fn backoff_delay(&self, attempt: u32) -> Duration {
        let exp = self.cfg.base_delay_ms.saturating_mul(1u64 << attempt.min(16));
        Duration::from_millis(exp.min(self.cfg.max_retry_delay_ms))
    }

    /// Delivers `payload` for `(run_id, message_id)`. Returns the number of
    /// requests sent on success.
    pub async fn deliver(
        &self,
        run_id: &str,
        message_id: &str,
        payload: &serde_json::Value,
    ) -> Result<u32, PipelineError> {
        let idempotency_key = format!("{run_id}-{message_id}");
        let mut last_status: Option<u16> = None;
        let mut last_error = String::new();

        for attempt in 0..=self.cfg.max_retries {
            if attempt > 0 {
                worker_metrics().inc_sink_retries();
                tokio::time::sleep(self.backoff_delay(attempt - 1)).await;
            }

            let mut request = self
                .http
                .post(&self.cfg.endpoint)
                .header("Idempotency-Key", &idempotency_key)
                .json(payload);
            for (name, value) in &self.cfg.headers {
                request = request.header(name, value);
            }

            match request.send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return Ok(attempt + 1);
                    }
                    let body = response.text().await.unwrap_or_default();
                    if !retryable_status(status) {
                        return Err(PipelineError::Sink {
                            status: Some(status.as_u16()),
                            detail: format!("sink rejected delivery: {status}: {body}"),
                        });
                    }
                    tracing::warn!(
                        target: "sink",
                        run_id,
                        attempt,
                        status = status.as_u16(),
                        "retryable sink status"
                    );
                    last_status = Some(status.as_u16());
                    last_error = body;
                }
                Err(e) => {
                    tracing::warn!(target: "sink", run_id, attempt, error = %e, "sink request failed");
                    last_status = None;
                    last_error = e.to_string();
                }
            }
        }

        Err(PipelineError::Sink {
            status: last_status,
            detail: format!(
                "delivery failed after {} attempts: {last_error}",
                self.cfg.max_retries + 1
            ),
        })
    }
}
