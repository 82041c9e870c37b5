use std::time::Duration;

use relay_store::{MediationStateError, StoreError};
use thiserror::Error;

/// Agent-level failures.
///
/// Variants map onto how a caller should react:
/// - `ProtocolViolation` / `InvalidState`: caller bug, never retry
/// - `Envelope` / `Key`: undecryptable or unpackable, drop the message
/// - `Delivery` / `Transport`: one attempt failed, the dispatcher moves on
/// - `Undeliverable`: every candidate failed
/// - `ProblemReport`: answered to the peer with a problem-report
/// - `Timeout`: the peer may still answer later
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Invalid mediation state: {0}")]
    InvalidState(#[from] MediationStateError),

    #[error("Envelope error: {0}")]
    Envelope(#[from] relay_proto::ProtoError),

    #[error("Key error: {0}")]
    Key(#[from] relay_crypto::CryptoError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Delivery to {endpoint} failed: {reason}")]
    Delivery { endpoint: String, reason: String },

    #[error("Message {message_id} is undeliverable: {reason}")]
    Undeliverable { message_id: String, reason: String },

    #[error("Problem report {code}: {description}")]
    ProblemReport {
        code: String,
        description: String,
        /// Protocol the problem occurred in, when it differs from the
        /// message being handled.
        protocol: Option<String>,
    },

    #[error("Timed out after {after:?} waiting for {waiting_for}")]
    Timeout { after: Duration, waiting_for: String },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Serialisation error: {0}")]
    Serialisation(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl AgentError {
    pub fn problem(code: &str, description: impl Into<String>) -> Self {
        AgentError::ProblemReport {
            code: code.to_string(),
            description: description.into(),
            protocol: None,
        }
    }

    /// Network-level failures a caller may retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AgentError::Delivery { .. } | AgentError::Transport(_) | AgentError::Timeout { .. }
        )
    }
}

impl From<reqwest::Error> for AgentError {
    fn from(err: reqwest::Error) -> Self {
        AgentError::Transport(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for AgentError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        AgentError::Transport(err.to_string())
    }
}
