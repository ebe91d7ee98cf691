//! The child-process run loop: read one request line, execute under the
//! duration budget, write one response line.

use crate::chat::{ChatClient, ChatOptions};
use crate::cost::{estimate_cost, estimate_tokens};
use crate::wire::{ExecRequest, ExecResponse};
use hive_types::config::AgentRuntimeConfig;
use hive_types::error::ExecError;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

fn resolve_options(req: &ExecRequest, defaults: &AgentRuntimeConfig) -> ChatOptions {
    let profile = req.model_profile.as_ref();
    let model = profile
        .and_then(|p| p.get("model"))
        .and_then(|v| v.as_str())
        .unwrap_or(&defaults.default_model)
        .to_string();
    let temperature = profile
        .and_then(|p| p.get("temperature"))
        .and_then(|v| v.as_f64())
        .unwrap_or(defaults.default_temperature);
    let max_tokens = req
        .max_tokens
        .or_else(|| {
            profile
                .and_then(|p| p.get("max_tokens"))
                .and_then(|v| v.as_u64())
                .map(|v| v as u32)
        })
        .unwrap_or(defaults.max_tokens);
    ChatOptions { model, temperature, max_tokens }
}

fn user_input_text(input: &serde_json::Value) -> String {
    match input {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

async fn execute(
    req: &ExecRequest,
    client: &dyn ChatClient,
    defaults: &AgentRuntimeConfig,
) -> ExecResponse {
    let started = Instant::now();
    let opts = resolve_options(req, defaults);
    let max_duration = req
        .max_duration_seconds
        .unwrap_or(defaults.max_duration_seconds);
    let user_input = user_input_text(&req.input);

    // The internal budget timer; the parent keeps its own, wider deadline
    // and kills the process if this one fails to fire.
    let invocation = tokio::time::timeout(
        Duration::from_secs(max_duration),
        client.invoke(&req.instructions, &user_input, &opts),
    )
    .await;

    let elapsed_ms = started.elapsed().as_millis() as u64;
    match invocation {
        Ok(Ok(outcome)) => {
            let tokens_in = outcome
                .tokens_in
                .unwrap_or_else(|| estimate_tokens(&req.instructions) + estimate_tokens(&user_input));
            let tokens_out = outcome
                .tokens_out
                .unwrap_or_else(|| estimate_tokens(&outcome.text));
            ExecResponse {
                success: true,
                output: Some(outcome.text),
                error: None,
                tokens_in,
                tokens_out,
                duration_ms: elapsed_ms,
                usd_cost: estimate_cost(tokens_in, tokens_out),
            }
        }
        Ok(Err(e)) => ExecResponse::failure(e.to_string(), elapsed_ms),
        Err(_) => {
            ExecResponse::failure(ExecError::BudgetExceeded(max_duration).to_string(), elapsed_ms)
        }
    }
}

/// Runs the child protocol against arbitrary reader/writer pairs and returns
/// the process exit code. Exit code 0 means a response line was written and
/// its `success` field reflects the outcome; non-zero means the response may
/// be absent or truncated.
pub async fn run<R, W>(
    reader: &mut R,
    writer: &mut W,
    client: &dyn ChatClient,
    defaults: &AgentRuntimeConfig,
) -> i32
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut line = String::new();
    let response = match reader.read_line(&mut line).await {
        Ok(0) => ExecResponse::failure("deserialization failed: empty request on stdin", 0),
        Ok(_) => match serde_json::from_str::<ExecRequest>(line.trim()) {
            Ok(req) => {
                tracing::debug!(target: "agent-exec", agent_id = %req.agent_id, run_version = %req.version, "executing");
                execute(&req, client, defaults).await
            }
            Err(e) => ExecResponse::failure(
                ExecError::Deserialization(e.to_string()).to_string(),
                0,
            ),
        },
        Err(e) => ExecResponse::failure(format!("deserialization failed: stdin read error: {e}"), 0),
    };

    let encoded = match serde_json::to_string(&response) {
        Ok(s) => s,
        Err(e) => {
            tracing::error!(target: "agent-exec", error = %e, "failed to encode response");
            return 1;
        }
    };
    if writer.write_all(encoded.as_bytes()).await.is_err() {
        return 1;
    }
    if writer.write_all(b"\n").await.is_err() {
        return 1;
    }
    if writer.flush().await.is_err() {
        return 1;
    }
    0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::{ChatOutcome, MockChatClient};
    use async_trait::async_trait;
    use std::io::Cursor;

    async fn run_with(client: &dyn ChatClient, request: &str) -> (i32, ExecResponse) {
        let mut reader = tokio::io::BufReader::new(Cursor::new(request.as_bytes().to_vec()));
        let mut out: Vec<u8> = Vec::new();
        let code = run(&mut reader, &mut out, client, &AgentRuntimeConfig::default()).await;
        let line = String::from_utf8(out).unwrap();
        let response: ExecResponse = serde_json::from_str(line.trim()).unwrap();
        (code, response)
    }

    fn request_line(max_duration: Option<u64>) -> String {
        let req = ExecRequest {
            agent_id: "agent-1".into(),
            version: "1.0.0".into(),
            name: "triage".into(),
            instructions: "Classify.".into(),
            input: serde_json::json!("an invoice body"),
            max_tokens: None,
            max_duration_seconds: max_duration,
            model_profile: None,
        };
        format!("{}\n", serde_json::to_string(&req).unwrap())
    }

    #[tokio::test]
    async fn successful_execution_writes_one_response_line() {
        let (code, response) = run_with(&MockChatClient, &request_line(None)).await;
        assert_eq!(code, 0);
        assert!(response.success);
        assert!(response.output.unwrap().contains("mock"));
        assert!(response.tokens_in > 0);
        assert!(response.tokens_out > 0);
        assert!(response.usd_cost > 0.0);
    }

    #[tokio::test]
    async fn malformed_request_yields_failure_response_with_exit_zero() {
        let (code, response) = run_with(&MockChatClient, "{not json}\n").await;
        assert_eq!(code, 0);
        assert!(!response.success);
        let error = response.error.unwrap().to_lowercase();
        assert!(error.contains("deserialization"));
    }

    struct StallClient;

    #[async_trait]
    impl ChatClient for StallClient {
        async fn invoke(
            &self,
            _system: &str,
            _user: &str,
            _opts: &ChatOptions,
        ) -> Result<ChatOutcome, hive_types::error::ExecError> {
            tokio::time::sleep(Duration::from_secs(120)).await;
            Ok(ChatOutcome { text: "late".into(), tokens_in: None, tokens_out: None })
        }
    }

    #[tokio::test]
    async fn budget_exhaustion_aborts_with_the_contractual_message() {
        let mut reader =
            tokio::io::BufReader::new(Cursor::new(request_line(Some(1)).into_bytes()));
        let mut out: Vec<u8> = Vec::new();
        let code = run(&mut reader, &mut out, &StallClient, &AgentRuntimeConfig::default()).await;
        assert_eq!(code, 0);
        let response: ExecResponse =
            serde_json::from_str(String::from_utf8(out).unwrap().trim()).unwrap();
        assert!(!response.success);
        assert!(response.error.unwrap().contains("exceeded maximum duration"));
        assert!(response.duration_ms >= 1000);
    }
}
