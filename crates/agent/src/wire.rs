//! The executor wire format: a single JSON request line on the child's
//! stdin, a single JSON response line on its stdout.
//!
//! Field names are camelCase on the wire; exit code 0 means a response line
//! is present and its `success` field reflects the outcome.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// The request the worker writes to the child's stdin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecRequest {
    /// The agent being executed.
    pub agent_id: String,
    /// The agent version being executed.
    pub version: String,
    /// Display name, for logging only.
    pub name: String,
    /// System prompt.
    pub instructions: String,
    /// The input message body, passed through as-is.
    pub input: serde_json::Value,
    /// Completion-token ceiling, overriding the runtime default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    /// Wall-clock budget in seconds, overriding the runtime default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_duration_seconds: Option<u64>,
    /// Model options; the key `"model"` selects the model.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_profile: Option<BTreeMap<String, serde_json::Value>>,
}

/// The response the child writes to its stdout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecResponse {
    /// Whether execution succeeded.
    pub success: bool,
    /// Model output text, present on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    /// Error description, present on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Prompt tokens consumed (provider-reported or estimated).
    pub tokens_in: u64,
    /// Completion tokens produced (provider-reported or estimated).
    pub tokens_out: u64,
    /// Wall-clock execution time observed inside the child.
    pub duration_ms: u64,
    /// Estimated spend in USD.
    pub usd_cost: f64,
}

impl ExecResponse {
    /// A failure response carrying only an error and the elapsed time.
    pub fn failure(error: impl Into<String>, duration_ms: u64) -> Self {
        Self {
            success: false,
            output: None,
            error: Some(error.into()),
            tokens_in: 0,
            tokens_out: 0,
            duration_ms,
            usd_cost: 0.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_round_trips_camel_case() {
        let req = ExecRequest {
            agent_id: "agent-1".into(),
            version: "1.0.0".into(),
            name: "triage".into(),
            instructions: "Classify.".into(),
            input: serde_json::json!({"invoice": 42}),
            max_tokens: Some(256),
            max_duration_seconds: Some(30),
            model_profile: None,
        };
        let line = serde_json::to_string(&req).unwrap();
        assert!(line.contains("\"agentId\""));
        assert!(line.contains("\"maxDurationSeconds\""));
        let back: ExecRequest = serde_json::from_str(&line).unwrap();
        assert_eq!(back, req);
    }

    #[test]
    fn response_omits_absent_optionals() {
        let resp = ExecResponse::failure("boom", 12);
        let line = serde_json::to_string(&resp).unwrap();
        assert!(line.contains("\"tokensIn\""));
        assert!(line.contains("\"usdCost\""));
        assert!(!line.contains("\"output\""));
    }
}
