use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("Crypto error: {0}")]
    Crypto(#[from] relay_crypto::CryptoError),

    #[error("Serialisation error: {0}")]
    Serialisation(#[from] serde_json::Error),

    #[error("Base64 decode error: {0}")]
    Base64Decode(#[from] base64::DecodeError),

    #[error("Malformed envelope: {0}")]
    InvalidEnvelope(String),

    #[error("Unsupported envelope algorithm: {0}")]
    UnsupportedAlgorithm(String),

    #[error("No corresponding recipient key found")]
    NoRecipientKey,

    #[error("Invalid message type: {0}")]
    InvalidMessageType(String),

    #[error("Expected message of type {expected}, got {actual}")]
    UnexpectedMessageType { expected: String, actual: String },

    #[error("At least one recipient key is required")]
    NoRecipients,
}
