use thiserror::Error;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("AEAD encryption failed")]
    AeadEncrypt,

    #[error("AEAD decryption failed (authentication tag mismatch)")]
    AeadDecrypt,

    #[error("Key derivation failed: {0}")]
    KeyDerivation(String),

    #[error("Invalid key material: {0}")]
    InvalidKey(String),

    #[error("Unsupported key encoding: {0}")]
    UnsupportedKeyEncoding(String),

    #[error("No secret key held for {0}")]
    KeyNotFound(String),

    #[error("Signature verification failed")]
    SignatureVerification,

    #[error("Serialisation error: {0}")]
    Serialisation(#[from] serde_json::Error),

    #[error("Base58 decode error: {0}")]
    Base58Decode(#[from] bs58::decode::Error),

    #[error("Base64 decode error: {0}")]
    Base64Decode(#[from] base64::DecodeError),
}
