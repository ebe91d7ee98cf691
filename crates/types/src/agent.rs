//! Agent definitions: the named, versionable description of an LLM-driven
//! business-process task.

use crate::error::StoreError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// The closed set of connector kinds an agent may bind for input or output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConnectorKind {
    /// A message-queue broker with peek-lock receive semantics.
    ServiceBus,
    /// An HTTP endpoint (the only supported output kind today).
    Http,
    /// A Kafka topic.
    Kafka,
    /// A blob/object storage container.
    Storage,
    /// A SQL table.
    Sql,
}

impl std::fmt::Display for ConnectorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::ServiceBus => "service-bus",
            Self::Http => "http",
            Self::Kafka => "kafka",
            Self::Storage => "storage",
            Self::Sql => "sql",
        };
        f.write_str(s)
    }
}

/// Configuration for one connector binding. The settings map is free-form;
/// each connector implementation documents the keys it recognizes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectorConfig {
    /// Which connector implementation to bind.
    pub kind: ConnectorKind,
    /// Implementation-specific settings (connection string, queue name,
    /// endpoint, headers, ...).
    #[serde(default)]
    pub settings: BTreeMap<String, serde_json::Value>,
}

/// Resource limits applied to each run of the agent.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct Budget {
    /// Maximum completion tokens requested from the model.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    /// Wall-clock budget for one execution, in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_duration_seconds: Option<u64>,
    /// Spend ceiling in USD, advisory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_usd: Option<f64>,
}

/// A named definition of an LLM-driven task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentSpec {
    /// Opaque, immutable identifier.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Free-text description.
    #[serde(default)]
    pub description: String,
    /// Free text used verbatim as the model's system prompt.
    pub instructions: String,
    /// Model options. Must contain the key `"model"`.
    pub model_profile: BTreeMap<String, serde_json::Value>,
    /// Optional per-run resource limits.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub budget: Option<Budget>,
    /// Tool names available to the agent. Must be unique.
    #[serde(default)]
    pub tools: Vec<String>,
    /// Where runs draw their input from.
    pub input: ConnectorConfig,
    /// Where run output is delivered.
    pub output: ConnectorConfig,
    /// Free-form labels.
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last-update timestamp.
    pub updated_at: DateTime<Utc>,
}

impl AgentSpec {
    /// Validates the structural invariants of an agent spec, collecting every
    /// violation so API callers see them all at once.
    pub fn validate(&self) -> Result<(), StoreError> {
        let mut errors = Vec::new();
        if self.id.trim().is_empty() {
            errors.push("id must not be empty".to_string());
        }
        if self.name.trim().is_empty() {
            errors.push("name must not be empty".to_string());
        }
        if self.instructions.trim().is_empty() {
            errors.push("instructions must not be empty".to_string());
        }
        if !self.model_profile.contains_key("model") {
            errors.push("model_profile must contain the key 'model'".to_string());
        }
        let mut seen = std::collections::BTreeSet::new();
        for tool in &self.tools {
            if !seen.insert(tool.as_str()) {
                errors.push(format!("duplicate tool: {tool}"));
            }
        }
        if let Some(budget) = &self.budget {
            if let Some(secs) = budget.max_duration_seconds {
                if secs == 0 {
                    errors.push("budget.max_duration_seconds must be positive".to_string());
                }
            }
            if let Some(tokens) = budget.max_tokens {
                if tokens == 0 {
                    errors.push("budget.max_tokens must be positive".to_string());
                }
            }
            if let Some(usd) = budget.max_usd {
                if usd <= 0.0 {
                    errors.push("budget.max_usd must be positive".to_string());
                }
            }
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(StoreError::Validation(errors.join("; ")))
        }
    }

    /// Returns the model name from the profile, if it is a string.
    pub fn model(&self) -> Option<&str> {
        self.model_profile.get("model").and_then(|v| v.as_str())
    }
}

/// Generates a fresh agent identifier.
pub fn new_agent_id() -> String {
    format!("agent-{}", uuid::Uuid::new_v4())
}

/// The resolved agent snapshot the control plane attaches to a lease grant:
/// the effective spec for the run's version, already resolved through any
/// "no spec change" versions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentSnapshot {
    /// The agent being executed.
    pub agent_id: String,
    /// The run's version string.
    pub version: String,
    /// The effective spec for that version.
    pub spec: AgentSpec,
}
