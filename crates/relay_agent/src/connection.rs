//! Connection records, as far as this layer needs them.
//!
//! Establishing connections is another protocol's job; the dispatcher and
//! receiver only look records up through [`ConnectionService`].

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;
use relay_crypto::PublicKey;
use serde::{Deserialize, Serialize};

use crate::error::AgentError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Invited,
    Requested,
    Responded,
    Completed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionRecord {
    pub id: String,
    /// Our DID for this relationship.
    pub did: String,
    pub their_did: Option<String>,
    pub their_label: Option<String>,
    pub state: ConnectionState,
    /// Set until the peer's DID is known.
    pub out_of_band_id: Option<String>,
}

impl ConnectionRecord {
    pub fn new(did: impl Into<String>, their_did: Option<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            did: did.into(),
            their_did,
            their_label: None,
            state: ConnectionState::Completed,
            out_of_band_id: None,
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self.state, ConnectionState::Responded | ConnectionState::Completed)
    }

    pub fn assert_ready(&self) -> Result<(), AgentError> {
        if !self.is_ready() {
            return Err(AgentError::ProtocolViolation(format!(
                "connection {} is not ready (state {:?})",
                self.id, self.state
            )));
        }
        Ok(())
    }
}

#[async_trait]
pub trait ConnectionService: Send + Sync {
    async fn get_by_id(&self, id: &str) -> Result<ConnectionRecord, AgentError>;

    /// Connection whose envelope keys are `our_key` (and `their_key`, when
    /// the inbound envelope was authenticated).
    async fn find_by_keys(
        &self,
        our_key: &PublicKey,
        their_key: Option<&PublicKey>,
    ) -> Result<Option<ConnectionRecord>, AgentError>;
}

#[derive(Debug, Clone)]
struct StoredConnection {
    record: ConnectionRecord,
    our_keys: Vec<PublicKey>,
    their_keys: Vec<PublicKey>,
}

#[derive(Default)]
pub struct InMemoryConnectionService {
    connections: RwLock<HashMap<String, StoredConnection>>,
}

impl InMemoryConnectionService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, record: ConnectionRecord, our_keys: Vec<PublicKey>, their_keys: Vec<PublicKey>) {
        self.connections.write().insert(
            record.id.clone(),
            StoredConnection {
                record,
                our_keys,
                their_keys,
            },
        );
    }
}

#[async_trait]
impl ConnectionService for InMemoryConnectionService {
    async fn get_by_id(&self, id: &str) -> Result<ConnectionRecord, AgentError> {
        self.connections
            .read()
            .get(id)
            .map(|c| c.record.clone())
            .ok_or_else(|| AgentError::NotFound(format!("connection {id}")))
    }

    async fn find_by_keys(
        &self,
        our_key: &PublicKey,
        their_key: Option<&PublicKey>,
    ) -> Result<Option<ConnectionRecord>, AgentError> {
        let found = self.connections.read().values().find(|c| {
            c.our_keys.contains(our_key) && their_key.map(|k| c.their_keys.contains(k)).unwrap_or(true)
        })
        .map(|c| c.record.clone());
        Ok(found)
    }
}
