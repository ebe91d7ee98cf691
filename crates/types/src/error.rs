//! Core error types for the Hive platform.

use thiserror::Error;

/// A trait for assigning a stable, machine-readable string code to an error.
pub trait ErrorCode {
    /// Returns the unique, stable string identifier for this error variant.
    fn code(&self) -> &'static str;
}

/// Errors raised by the entity store.
#[derive(Error, Debug)]
pub enum StoreError {
    /// The requested entity does not exist.
    #[error("{entity} not found: {id}")]
    NotFound {
        /// The entity kind, e.g. "agent" or "run".
        entity: &'static str,
        /// The identifier that missed.
        id: String,
    },
    /// An entity with the same identity already exists, or a terminal run was
    /// written to again.
    #[error("Conflict: {0}")]
    Conflict(String),
    /// The input failed validation before any write happened.
    #[error("Validation failed: {0}")]
    Validation(String),
    /// Encoding or decoding an entity at rest failed.
    #[error("Serialization error: {0}")]
    Serialization(String),
    /// The backing store failed; the operation is safe to retry.
    #[error("Storage backend error: {0}")]
    Backend(String),
}

impl ErrorCode for StoreError {
    fn code(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "STORE_NOT_FOUND",
            Self::Conflict(_) => "STORE_CONFLICT",
            Self::Validation(_) => "STORE_VALIDATION_FAILED",
            Self::Serialization(_) => "STORE_SERIALIZATION_ERROR",
            Self::Backend(_) => "STORE_BACKEND_ERROR",
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

/// Errors raised by the lease and lock store.
#[derive(Error, Debug)]
pub enum LeaseError {
    /// Empty key/owner or non-positive TTL.
    #[error("Invalid lease input: {0}")]
    Validation(String),
    /// The caller is not the recorded owner of the lease or lock.
    #[error("Caller '{caller}' does not own '{key}'")]
    NotOwner {
        /// The lease or lock key.
        key: String,
        /// The caller that was rejected.
        caller: String,
    },
    /// The lease backend failed; safe to retry.
    #[error("Lease backend error: {0}")]
    Backend(String),
}

impl ErrorCode for LeaseError {
    fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "LEASE_VALIDATION_FAILED",
            Self::NotOwner { .. } => "LEASE_NOT_OWNER",
            Self::Backend(_) => "LEASE_BACKEND_ERROR",
        }
    }
}

/// Errors raised by the control-plane lease service and dispatch loop.
#[derive(Error, Debug)]
pub enum ControlError {
    /// An error from the entity store.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
    /// An error from the lease store.
    #[error("Lease error: {0}")]
    Lease(#[from] LeaseError),
    /// A terminal transition was attempted by a node that does not hold the
    /// run's assignment. Rejected without side effects.
    #[error("Node '{node_id}' is not the owner of run '{run_id}'")]
    NotOwner {
        /// The run the caller tried to mutate.
        run_id: String,
        /// The rejected caller.
        node_id: String,
    },
    /// A transport-level failure on the gRPC stream or a storage write path.
    #[error("Transport error: {0}")]
    Transport(String),
}

impl ErrorCode for ControlError {
    fn code(&self) -> &'static str {
        match self {
            Self::Store(_) => "CONTROL_STORE_ERROR",
            Self::Lease(_) => "CONTROL_LEASE_ERROR",
            Self::NotOwner { .. } => "CONTROL_NOT_OWNER",
            Self::Transport(_) => "CONTROL_TRANSPORT_ERROR",
        }
    }
}

/// Errors raised inside the worker's per-lease message pipeline.
///
/// The `is_retryable` classification drives abandon-for-retry versus
/// dead-letter routing and the `retryable` flag reported to the control
/// plane.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// A transient failure: broker hiccup, HTTP 5xx/408/429, network error.
    /// The input message is abandoned so the broker redelivers it.
    #[error("Transient failure: {0}")]
    Transient(String),
    /// A permanent failure: bad input, agent misconfiguration, non-retryable
    /// HTTP status. The input message is dead-lettered.
    #[error("Non-retryable failure ({reason}): {detail}")]
    NonRetryable {
        /// The dead-letter reason recorded with the routed message.
        reason: DeadLetterReason,
        /// Human-readable description of the failure.
        detail: String,
    },
    /// The input broker failed while receiving, completing, or abandoning.
    #[error("Broker error: {0}")]
    Broker(String),
    /// The output sink rejected or could not accept the delivery.
    #[error("Output sink error (status {status:?}): {detail}")]
    Sink {
        /// The HTTP status, if one was received.
        status: Option<u16>,
        /// Description of the delivery failure.
        detail: String,
    },
    /// Spawning or talking to the sandbox child process failed.
    #[error("Executor error: {0}")]
    Executor(String),
    /// The pipeline itself is misconfigured.
    #[error("Pipeline configuration error: {0}")]
    Config(String),
}

impl PipelineError {
    /// Whether the failure should be retried by redelivery of the input
    /// message. Non-retryable failures are dead-lettered instead.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transient(_) | Self::Broker(_) => true,
            Self::Sink { status, .. } => match status {
                Some(code) => *code == 408 || *code == 429 || *code >= 500,
                None => true,
            },
            Self::NonRetryable { .. } | Self::Config(_) => false,
            Self::Executor(detail) => classify_error_text(detail),
        }
    }
}

impl ErrorCode for PipelineError {
    fn code(&self) -> &'static str {
        match self {
            Self::Transient(_) => "PIPELINE_TRANSIENT",
            Self::NonRetryable { .. } => "PIPELINE_NON_RETRYABLE",
            Self::Broker(_) => "PIPELINE_BROKER_ERROR",
            Self::Sink { .. } => "PIPELINE_SINK_ERROR",
            Self::Executor(_) => "PIPELINE_EXECUTOR_ERROR",
            Self::Config(_) => "PIPELINE_CONFIG_ERROR",
        }
    }
}

/// The reason an input message was routed to the dead-letter destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum DeadLetterReason {
    /// The message's delivery count exceeded the poison threshold before
    /// execution was attempted.
    PoisonMessage,
    /// Execution or delivery failed with a permanent error.
    NonRetryableError,
    /// One more redelivery would exceed the configured maximum.
    MaxDeliveryCountExceeded,
    /// The message body could not be decoded.
    DeserializationError,
    /// The agent spec attached to the lease is invalid.
    AgentConfigurationError,
}

impl std::fmt::Display for DeadLetterReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::PoisonMessage => "PoisonMessage",
            Self::NonRetryableError => "NonRetryableError",
            Self::MaxDeliveryCountExceeded => "MaxDeliveryCountExceeded",
            Self::DeserializationError => "DeserializationError",
            Self::AgentConfigurationError => "AgentConfigurationError",
        };
        f.write_str(s)
    }
}

/// Error text fragments that mark a failure as permanent. Matched
/// case-insensitively as substrings.
pub const NON_RETRYABLE_PATTERNS: &[&str] = &[
    "timeout",
    "exceeded maximum duration",
    "deserialization",
    "invalid format",
    "bad request",
    "unauthorized",
    "forbidden",
    "not found",
    "conflict",
];

/// Classifies free-form error text: returns `true` when the failure is
/// retryable, `false` when it matches a non-retryable pattern.
pub fn classify_error_text(text: &str) -> bool {
    let lowered = text.to_lowercase();
    !NON_RETRYABLE_PATTERNS.iter().any(|p| lowered.contains(p))
}

/// Errors produced inside the sandbox child while executing one run.
#[derive(Error, Debug)]
pub enum ExecError {
    /// The request line on stdin could not be decoded.
    #[error("Deserialization of executor request failed: {0}")]
    Deserialization(String),
    /// The agent spec embedded in the request is unusable.
    #[error("Agent configuration invalid: {0}")]
    Configuration(String),
    /// The model invocation exceeded the run's duration budget.
    #[error("Agent execution exceeded maximum duration of {0}s")]
    BudgetExceeded(u64),
    /// The chat provider returned an error.
    #[error("Model provider error: {0}")]
    Provider(String),
}

impl ErrorCode for ExecError {
    fn code(&self) -> &'static str {
        match self {
            Self::Deserialization(_) => "EXEC_DESERIALIZATION_ERROR",
            Self::Configuration(_) => "EXEC_CONFIGURATION_ERROR",
            Self::BudgetExceeded(_) => "EXEC_BUDGET_EXCEEDED",
            Self::Provider(_) => "EXEC_PROVIDER_ERROR",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_retryable_patterns_match_case_insensitively() {
        assert!(!classify_error_text("request Timeout while waiting"));
        assert!(!classify_error_text("agent execution exceeded maximum duration of 60s"));
        assert!(!classify_error_text("HTTP 401 Unauthorized"));
        assert!(classify_error_text("connection reset by peer"));
        assert!(classify_error_text("HTTP 503 service unavailable"));
    }

    #[test]
    fn sink_retryability_follows_status_class() {
        let retryable = [408u16, 429, 500, 503];
        for code in retryable {
            let err = PipelineError::Sink {
                status: Some(code),
                detail: String::new(),
            };
            assert!(err.is_retryable(), "status {code} should be retryable");
        }
        let permanent = [400u16, 401, 403, 404, 409, 422];
        for code in permanent {
            let err = PipelineError::Sink {
                status: Some(code),
                detail: String::new(),
            };
            assert!(!err.is_retryable(), "status {code} should be permanent");
        }
        // No status at all means the connection failed: retryable.
        assert!(PipelineError::Sink { status: None, detail: String::new() }.is_retryable());
    }
}
