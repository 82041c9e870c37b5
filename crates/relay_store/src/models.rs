//! Stored models and their SQL row forms.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use relay_crypto::PublicKey;
use relay_proto::EncryptedMessage;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::StoreError;

// ── Queue ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueuedMessageState {
    Pending,
    /// Handed to a delivery attempt, not yet acknowledged.
    Sending,
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueuedMessage {
    pub id: String,
    pub connection_id: String,
    pub recipient_dids: Vec<String>,
    pub encrypted_message: EncryptedMessage,
    pub received_at: DateTime<Utc>,
    pub state: QueuedMessageState,
}

/// Which mailbox a queue operation addresses. At least one field must be
/// set; when both are, both must match.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueScope {
    pub connection_id: Option<String>,
    pub recipient_did: Option<String>,
}

impl QueueScope {
    pub fn connection(connection_id: impl Into<String>) -> Self {
        Self {
            connection_id: Some(connection_id.into()),
            recipient_did: None,
        }
    }

    pub fn recipient(recipient_did: impl Into<String>) -> Self {
        Self {
            connection_id: None,
            recipient_did: Some(recipient_did.into()),
        }
    }

    pub fn with_recipient_did(mut self, recipient_did: Option<String>) -> Self {
        self.recipient_did = recipient_did;
        self
    }

    pub(crate) fn ensure_scoped(&self) -> Result<(), StoreError> {
        if self.connection_id.is_none() && self.recipient_did.is_none() {
            return Err(StoreError::UnscopedQueueAccess);
        }
        Ok(())
    }

    pub fn matches(&self, message: &QueuedMessage) -> bool {
        let connection_ok = self
            .connection_id
            .as_ref()
            .map(|id| *id == message.connection_id)
            .unwrap_or(true);
        let recipient_ok = self
            .recipient_did
            .as_ref()
            .map(|did| message.recipient_dids.contains(did))
            .unwrap_or(true);
        connection_ok && recipient_ok
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TakeOptions {
    pub scope: QueueScope,
    pub limit: Option<usize>,
    /// `true` deletes as part of the take (pickup 1.0); otherwise entries
    /// are marked `Sending` and stay until removed.
    pub delete_messages: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct QueuedMessageRow {
    pub id: String,
    pub connection_id: String,
    /// JSON array
    pub recipient_dids: String,
    /// JSON envelope
    pub encrypted_message: String,
    pub received_at: DateTime<Utc>,
    pub state: String,
}

impl TryFrom<QueuedMessageRow> for QueuedMessage {
    type Error = StoreError;

    fn try_from(row: QueuedMessageRow) -> Result<Self, Self::Error> {
        let state = match row.state.as_str() {
            "pending" => QueuedMessageState::Pending,
            "sending" => QueuedMessageState::Sending,
            other => {
                return Err(StoreError::Corrupt {
                    column: "queued_messages.state",
                    value: other.to_string(),
                })
            }
        };
        Ok(Self {
            id: row.id,
            connection_id: row.connection_id,
            recipient_dids: serde_json::from_str(&row.recipient_dids)?,
            encrypted_message: serde_json::from_str(&row.encrypted_message)?,
            received_at: row.received_at,
            state,
        })
    }
}

// ── Mediation ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MediationRole {
    Mediator,
    Recipient,
}

/// `Requested → Granted | Denied`; both outcomes are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MediationState {
    Requested,
    Granted,
    Denied,
}

macro_rules! string_enum {
    ($ty:ident { $($variant:ident => $s:literal),+ $(,)? }) => {
        impl $ty {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($ty::$variant => $s,)+
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $ty {
            type Err = StoreError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($s => Ok($ty::$variant),)+
                    other => Err(StoreError::Corrupt {
                        column: stringify!($ty),
                        value: other.to_string(),
                    }),
                }
            }
        }
    };
}

string_enum!(MediationRole { Mediator => "mediator", Recipient => "recipient" });
string_enum!(MediationState { Requested => "requested", Granted => "granted", Denied => "denied" });

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MediationStateError {
    #[error("Mediation record {id} is in state {actual}, expected {expected}")]
    WrongState {
        id: String,
        expected: MediationState,
        actual: MediationState,
    },

    #[error("Mediation record {id} has role {actual}, expected {expected}")]
    WrongRole {
        id: String,
        expected: MediationRole,
        actual: MediationRole,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediationRecord {
    pub id: String,
    pub connection_id: String,
    pub thread_id: String,
    pub role: MediationRole,
    pub state: MediationState,
    pub recipient_keys: Vec<PublicKey>,
    pub routing_keys: Vec<PublicKey>,
    pub endpoint: Option<String>,
    pub is_default: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl MediationRecord {
    pub fn new(role: MediationRole, connection_id: impl Into<String>, thread_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            connection_id: connection_id.into(),
            thread_id: thread_id.into(),
            role,
            state: MediationState::Requested,
            recipient_keys: Vec::new(),
            routing_keys: Vec::new(),
            endpoint: None,
            is_default: false,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn assert_state(&self, expected: MediationState) -> Result<(), MediationStateError> {
        if self.state != expected {
            return Err(MediationStateError::WrongState {
                id: self.id.clone(),
                expected,
                actual: self.state,
            });
        }
        Ok(())
    }

    pub fn assert_role(&self, expected: MediationRole) -> Result<(), MediationStateError> {
        if self.role != expected {
            return Err(MediationStateError::WrongRole {
                id: self.id.clone(),
                expected,
                actual: self.role,
            });
        }
        Ok(())
    }

    pub fn is_ready(&self) -> bool {
        self.state == MediationState::Granted
    }

    /// Returns `false` when the key was already present.
    pub fn add_recipient_key(&mut self, key: PublicKey) -> bool {
        if self.recipient_keys.contains(&key) {
            return false;
        }
        self.recipient_keys.push(key);
        true
    }

    /// Returns `false` when the key was not present.
    pub fn remove_recipient_key(&mut self, key: &PublicKey) -> bool {
        let before = self.recipient_keys.len();
        self.recipient_keys.retain(|k| k != key);
        self.recipient_keys.len() != before
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct MediationRecordRow {
    pub id: String,
    pub connection_id: String,
    pub thread_id: String,
    pub role: String,
    pub state: String,
    pub recipient_keys: String,
    pub routing_keys: String,
    pub endpoint: Option<String>,
    pub is_default: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<MediationRecordRow> for MediationRecord {
    type Error = StoreError;

    fn try_from(row: MediationRecordRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            connection_id: row.connection_id,
            thread_id: row.thread_id,
            role: row.role.parse()?,
            state: row.state.parse()?,
            recipient_keys: serde_json::from_str(&row.recipient_keys)?,
            routing_keys: serde_json::from_str(&row.routing_keys)?,
            endpoint: row.endpoint,
            is_default: row.is_default,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_crypto::KeyPair;

    #[test]
    fn denied_is_terminal_for_assertions() {
        let mut record = MediationRecord::new(MediationRole::Recipient, "conn-1", "thid-1");
        assert!(record.assert_state(MediationState::Requested).is_ok());
        record.state = MediationState::Denied;
        let err = record.assert_state(MediationState::Requested).unwrap_err();
        assert!(matches!(err, MediationStateError::WrongState { actual: MediationState::Denied, .. }));
        assert!(record.assert_role(MediationRole::Mediator).is_err());
    }

    #[test]
    fn recipient_keys_are_a_set() {
        let mut record = MediationRecord::new(MediationRole::Mediator, "conn-1", "thid-1");
        let key = KeyPair::generate().public();
        assert!(record.add_recipient_key(key));
        assert!(!record.add_recipient_key(key));
        assert!(record.remove_recipient_key(&key));
        assert!(!record.remove_recipient_key(&key));
    }

    #[test]
    fn scope_requires_both_fields_when_set() {
        let message = QueuedMessage {
            id: "m1".into(),
            connection_id: "conn-1".into(),
            recipient_dids: vec!["did:key:z1".into()],
            encrypted_message: EncryptedMessage {
                protected: "p".into(),
                iv: "i".into(),
                ciphertext: "c".into(),
                tag: "t".into(),
            },
            received_at: Utc::now(),
            state: QueuedMessageState::Pending,
        };
        assert!(QueueScope::connection("conn-1").matches(&message));
        assert!(QueueScope::recipient("did:key:z1").matches(&message));
        assert!(!QueueScope::connection("conn-1")
            .with_recipient_did(Some("did:key:z2".into()))
            .matches(&message));
        assert!(QueueScope::default().ensure_scoped().is_err());
    }
}
