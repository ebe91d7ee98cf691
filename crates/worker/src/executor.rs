//! The parent side of the sandboxed executor.
//!
//! One child process per run: the parent writes a single JSON request line
//! to the child's stdin and closes it, then reads a single JSON response
//! line from stdout. The child enforces the duration budget internally; the
//! parent adds an IPC slack of 5 seconds and kills the process tree if no
//! response arrived by then. Stderr is captured for diagnostics.

use async_trait::async_trait;
use hive_agent::wire::{ExecRequest, ExecResponse};
use hive_types::error::{DeadLetterReason, PipelineError};
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;

/// Slack added to the child's budget before the parent kills it.
pub const IPC_SLACK_SECONDS: u64 = 5;

/// The executor contract used by the pipeline; faked in tests.
#[async_trait]
pub trait Executor: Send + Sync + std::fmt::Debug {
    /// Executes one run and returns the child's response. `Ok` with
    /// `success == false` means the child reported a failure; `Err` means
    /// the child itself misbehaved (no response, bad exit, kill).
    async fn execute(&self, request: &ExecRequest) -> Result<ExecResponse, PipelineError>;
}

/// Spawns the `agent-exec` child binary per run.
#[derive(Debug, Clone)]
pub struct ProcessExecutor {
    program: PathBuf,
    args: Vec<String>,
    envs: Vec<(String, String)>,
}

impl ProcessExecutor {
    /// An executor running `program` with fixed leading `args`.
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self { program: program.into(), args, envs: Vec::new() }
    }

    /// Resolves the child binary — an explicit configured path, or
    /// `agent-exec` next to the current executable — and hands the model
    /// provider's endpoint and key to it via environment.
    pub fn from_config(
        executor_path: Option<&str>,
        foundry: &hive_types::config::FoundryConfig,
    ) -> Result<Self, PipelineError> {
        let program = match executor_path {
            Some(path) => PathBuf::from(path),
            None => {
                let mut path = std::env::current_exe()
                    .map_err(|e| PipelineError::Config(format!("cannot locate worker binary: {e}")))?;
                path.set_file_name("agent-exec");
                path
            }
        };
        let mut executor = Self::new(program, Vec::new());
        if let Some(endpoint) = &foundry.endpoint {
            executor
                .envs
                .push(("HIVE_CHAT_ENDPOINT".to_string(), endpoint.clone()));
        }
        if let Some(api_key) = &foundry.api_key {
            executor
                .envs
                .push(("HIVE_CHAT_API_KEY".to_string(), api_key.clone()));
        }
        Ok(executor)
    }
}

#[async_trait]
impl Executor for ProcessExecutor {
    async fn execute(&self, request: &ExecRequest) -> Result<ExecResponse, PipelineError> {
        let budget_seconds = request.max_duration_seconds.unwrap_or(60);
        let deadline = Duration::from_secs(budget_seconds + IPC_SLACK_SECONDS);

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .envs(self.envs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                PipelineError::Config(format!(
                    "failed to spawn executor '{}': {e}",
                    self.program.display()
                ))
            })?;

        // Write the request and close stdin to signal end-of-request.
        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| PipelineError::Executor("child stdin unavailable".to_string()))?;
        let line = serde_json::to_string(request)
            .map_err(|e| PipelineError::Executor(format!("failed to encode request: {e}")))?;
        stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|e| PipelineError::Executor(format!("failed to write request: {e}")))?;
        stdin
            .write_all(b"\n")
            .await
            .map_err(|e| PipelineError::Executor(format!("failed to write request: {e}")))?;
        drop(stdin);

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| PipelineError::Executor("child stdout unavailable".to_string()))?;
        let mut stderr = child
            .stderr
            .take()
            .ok_or_else(|| PipelineError::Executor("child stderr unavailable".to_string()))?;

        // Drain stderr concurrently so a chatty child cannot deadlock on a
        // full pipe.
        let stderr_task = tokio::spawn(async move {
            let mut buf = String::new();
            let _ = stderr.read_to_string(&mut buf).await;
            buf
        });

        let mut reader = BufReader::new(stdout);
        let mut response_line = String::new();
        let read = tokio::time::timeout(deadline, reader.read_line(&mut response_line)).await;

        match read {
            Err(_) => {
                // Budget exhausted including IPC slack: kill the child tree.
                let _ = child.start_kill();
                let _ = child.wait().await;
                let diagnostics = stderr_task.await.unwrap_or_default();
                tracing::warn!(
                    target: "executor",
                    agent_id = %request.agent_id,
                    budget_seconds,
                    "killed executor child after budget + slack"
                );
                Err(PipelineError::NonRetryable {
                    reason: DeadLetterReason::NonRetryableError,
                    detail: format!(
                        "agent execution exceeded maximum duration of {budget_seconds}s; child killed after {}s. stderr: {diagnostics}",
                        budget_seconds + IPC_SLACK_SECONDS
                    ),
                })
            }
            Ok(Err(e)) => {
                let _ = child.start_kill();
                let _ = child.wait().await;
                Err(PipelineError::Executor(format!("failed to read response: {e}")))
            }
            Ok(Ok(_)) => {
                let status = tokio::time::timeout(Duration::from_secs(5), child.wait())
                    .await
                    .map_err(|_| {
                        PipelineError::Executor("child did not exit after responding".to_string())
                    })?
                    .map_err(|e| PipelineError::Executor(format!("failed to reap child: {e}")))?;
                let diagnostics = stderr_task.await.unwrap_or_default();

                if !status.success() {
                    // Non-zero exit: the response may be absent or truncated.
                    return Err(PipelineError::Executor(format!(
                        "child exited with {status}; stderr: {diagnostics}"
                    )));
                }
                if response_line.trim().is_empty() {
                    return Err(PipelineError::Executor(format!(
                        "child exited cleanly without a response; stderr: {diagnostics}"
                    )));
                }
                serde_json::from_str::<ExecResponse>(response_line.trim()).map_err(|e| {
                    PipelineError::Executor(format!(
                        "deserialization of executor response failed: {e}"
                    ))
                })
            }
        }
    }
}
