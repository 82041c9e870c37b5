//! Encrypted message envelope: what relays and transports see.
//!
//! Wire shape (all fields base64url):
//!
//! ```json
//! { "protected": "...", "iv": "...", "ciphertext": "...", "tag": "..." }
//! ```
//!
//! `protected` decodes to a [`ProtectedHeader`] listing, per recipient, the
//! wrapped content-encryption key. Relays can read `kid`s to route but
//! nothing else.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use serde::{Deserialize, Serialize};

use crate::error::ProtoError;

pub const ENC_XCHACHA20POLY1305: &str = "xchacha20poly1305_ietf";
pub const TYP_JWM: &str = "JWM/1.0";

/// On-wire encrypted message. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedMessage {
    /// base64url(JSON [`ProtectedHeader`]); also the AEAD associated data.
    pub protected: String,
    /// 24-byte XChaCha20 nonce.
    pub iv: String,
    pub ciphertext: String,
    /// 16-byte Poly1305 tag.
    pub tag: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PackAlg {
    Authcrypt,
    Anoncrypt,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtectedHeader {
    pub enc: String,
    pub typ: String,
    pub alg: PackAlg,
    pub recipients: Vec<RecipientEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecipientEntry {
    pub encrypted_key: String,
    pub header: RecipientHeader,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecipientHeader {
    /// Recipient verkey, base58.
    pub kid: String,
    /// Sender verkey sealed to this recipient (Authcrypt only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,
    /// Nonce for `encrypted_key` (Authcrypt only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iv: Option<String>,
}

impl EncryptedMessage {
    pub fn protected_header(&self) -> Result<ProtectedHeader, ProtoError> {
        let bytes = b64d(&self.protected)?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Recipient `kid`s in header order.
    pub fn recipient_kids(&self) -> Result<Vec<String>, ProtoError> {
        Ok(self
            .protected_header()?
            .recipients
            .into_iter()
            .map(|r| r.header.kid)
            .collect())
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, ProtoError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, ProtoError> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// True when `value` has the four envelope fields.
    pub fn looks_like(value: &serde_json::Value) -> bool {
        ["protected", "iv", "ciphertext", "tag"]
            .iter()
            .all(|k| value.get(k).map(|v| v.is_string()).unwrap_or(false))
    }
}

// ── Helpers ──────────────────────────────────────────────────────────────────

pub(crate) fn b64e(bytes: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Decode base64url, tolerating trailing `=` padding from other agents.
pub(crate) fn b64d(s: &str) -> Result<Vec<u8>, ProtoError> {
    Ok(URL_SAFE_NO_PAD.decode(s.trim_end_matches('='))?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_fields_are_optional_on_the_wire() {
        let header = RecipientHeader {
            kid: "abc".into(),
            sender: None,
            iv: None,
        };
        assert_eq!(serde_json::to_value(&header).unwrap(), serde_json::json!({"kid": "abc"}));
    }

    #[test]
    fn b64_tolerates_padding() {
        assert_eq!(b64d("aGk=").unwrap(), b"hi");
        assert_eq!(b64d(&b64e(b"hi")).unwrap(), b"hi");
    }

    #[test]
    fn looks_like_requires_all_fields() {
        let full = serde_json::json!({"protected": "a", "iv": "b", "ciphertext": "c", "tag": "d"});
        assert!(EncryptedMessage::looks_like(&full));
        assert!(!EncryptedMessage::looks_like(&serde_json::json!({"protected": "a"})));
    }
}
