#![forbid(unsafe_code)]

//! The sandbox child binary: one JSON request line on stdin, one JSON
//! response line on stdout, exit code 0 iff the response is present.

use hive_agent::chat::{ChatClient, FoundryChatClient, MockChatClient};
use hive_agent::child;
use hive_types::config::AgentRuntimeConfig;
use tokio::io::BufReader;

#[tokio::main]
async fn main() {
    // Logs go to stderr, which the parent captures as diagnostics.
    let _ = hive_telemetry::init::init_tracing();

    let endpoint = std::env::var("HIVE_CHAT_ENDPOINT").ok();
    let api_key = std::env::var("HIVE_CHAT_API_KEY").ok();
    let client: Box<dyn ChatClient> = match endpoint {
        Some(endpoint) => match FoundryChatClient::new(endpoint, api_key) {
            Ok(client) => Box::new(client),
            Err(e) => {
                tracing::error!(target: "agent-exec", error = %e, "provider setup failed; using mock");
                Box::new(MockChatClient)
            }
        },
        None => Box::new(MockChatClient),
    };

    let mut reader = BufReader::new(tokio::io::stdin());
    let mut writer = tokio::io::stdout();
    let code = child::run(
        &mut reader,
        &mut writer,
        client.as_ref(),
        &AgentRuntimeConfig::default(),
    )
    .await;
    std::process::exit(code);
}
