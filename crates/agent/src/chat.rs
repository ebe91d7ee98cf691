//! The pluggable chat-client contract and its implementations.

use async_trait::async_trait;
use hive_types::error::ExecError;
use serde::{Deserialize, Serialize};

/// Per-invocation sampling options.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatOptions {
    /// Model name to request.
    pub model: String,
    /// Sampling temperature.
    pub temperature: f64,
    /// Completion-token ceiling.
    pub max_tokens: u32,
}

/// The outcome of one chat invocation. Token counts are absent when the
/// provider does not report usage; the caller estimates them instead.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatOutcome {
    /// The model's reply text.
    pub text: String,
    /// Provider-reported prompt tokens.
    pub tokens_in: Option<u64>,
    /// Provider-reported completion tokens.
    pub tokens_out: Option<u64>,
}

/// The LLM provider contract. The concrete provider is an external
/// collaborator; the platform only depends on this interface.
#[async_trait]
pub trait ChatClient: Send + Sync {
    /// Sends one system/user exchange and returns the reply.
    async fn invoke(
        &self,
        system_prompt: &str,
        user_input: &str,
        opts: &ChatOptions,
    ) -> Result<ChatOutcome, ExecError>;
}

// --- OpenAI-compatible HTTP provider ----------------------------------------

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f64,
    max_tokens: u32,
}

#[derive(Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    content: String,
}

#[derive(Deserialize)]
struct Usage {
    #[serde(default)]
    prompt_tokens: Option<u64>,
    #[serde(default)]
    completion_tokens: Option<u64>,
}

/// A chat client for OpenAI-compatible endpoints (Azure AI Foundry, OpenAI,
/// local gateways). `endpoint` is the full URL of the chat-completions
/// resource.
pub struct FoundryChatClient {
    http: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
}

impl FoundryChatClient {
    /// Builds a client for `endpoint` with an optional API key. The key is
    /// sent both as `api-key` (Azure convention) and as a bearer token.
    pub fn new(endpoint: String, api_key: Option<String>) -> Result<Self, ExecError> {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(300))
            .build()
            .map_err(|e| ExecError::Provider(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { http, endpoint, api_key })
    }
}

#[async_trait]
impl ChatClient for FoundryChatClient {
    async fn invoke(
        &self,
        system_prompt: &str,
        user_input: &str,
        opts: &ChatOptions,
    ) -> Result<ChatOutcome, ExecError> {
        let body = ChatCompletionRequest {
            model: &opts.model,
            messages: vec![
                ChatMessage { role: "system", content: system_prompt },
                ChatMessage { role: "user", content: user_input },
            ],
            temperature: opts.temperature,
            max_tokens: opts.max_tokens,
        };

        let mut request = self.http.post(&self.endpoint).json(&body);
        if let Some(key) = &self.api_key {
            request = request.header("api-key", key).bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| ExecError::Provider(format!("request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            // The status reason ("Unauthorized", "Not Found", ...) feeds the
            // worker's retryability classification.
            return Err(ExecError::Provider(format!(
                "provider returned status {} {}: {}",
                status.as_u16(),
                status.canonical_reason().unwrap_or(""),
                text
            )));
        }

        let parsed: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|e| ExecError::Provider(format!("deserialization of provider response failed: {e}")))?;

        let text = parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| ExecError::Provider("provider returned no choices".to_string()))?;

        let (tokens_in, tokens_out) = match parsed.usage {
            Some(usage) => (usage.prompt_tokens, usage.completion_tokens),
            None => (None, None),
        };

        Ok(ChatOutcome { text, tokens_in, tokens_out })
    }
}

// --- Mock provider -----------------------------------------------------------

/// A deterministic provider used when no endpoint is configured, and by
/// tests. Echoes a summary of the input.
#[derive(Debug, Default, Clone, Copy)]
pub struct MockChatClient;

#[async_trait]
impl ChatClient for MockChatClient {
    async fn invoke(
        &self,
        _system_prompt: &str,
        user_input: &str,
        opts: &ChatOptions,
    ) -> Result<ChatOutcome, ExecError> {
        Ok(ChatOutcome {
            text: format!("[mock:{}] processed {} bytes of input", opts.model, user_input.len()),
            tokens_in: None,
            tokens_out: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_client_reports_no_usage() {
        let opts = ChatOptions { model: "test".into(), temperature: 0.0, max_tokens: 16 };
        let outcome = MockChatClient.invoke("sys", "hello", &opts).await.unwrap();
        assert!(outcome.text.contains("mock:test"));
        assert!(outcome.tokens_in.is_none());
        assert!(outcome.tokens_out.is_none());
    }
}
