//! DID documents and out-of-band services, reduced to what delivery needs.
//!
//! Resolution itself is external: [`DidResolver`] is the seam, and
//! [`StaticDidResolver`] serves pre-registered documents.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;
use relay_crypto::PublicKey;
use serde::{Deserialize, Serialize};

use crate::error::AgentError;

/// Endpoint of the pseudo-service meaning "leave it in my mailbox".
pub const QUEUE_ENDPOINT: &str = "didcomm:transport/queue";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DidCommService {
    pub id: String,
    pub service_endpoint: String,
    pub recipient_keys: Vec<PublicKey>,
    #[serde(default)]
    pub routing_keys: Vec<PublicKey>,
    /// Lower sorts first.
    #[serde(default)]
    pub priority: u32,
}

impl DidCommService {
    pub fn new(id: impl Into<String>, endpoint: impl Into<String>, recipient_keys: Vec<PublicKey>) -> Self {
        Self {
            id: id.into(),
            service_endpoint: endpoint.into(),
            recipient_keys,
            routing_keys: vec![],
            priority: 0,
        }
    }

    /// `wss`, `https`, ... Lowercased, without the colon.
    pub fn scheme(&self) -> String {
        self.service_endpoint
            .split_once(':')
            .map(|(scheme, _)| scheme.to_ascii_lowercase())
            .unwrap_or_default()
    }

    pub fn is_queue(&self) -> bool {
        self.service_endpoint == QUEUE_ENDPOINT
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DidDocument {
    pub id: String,
    #[serde(default)]
    pub authentication: Vec<PublicKey>,
    #[serde(default)]
    pub services: Vec<DidCommService>,
}

impl DidDocument {
    /// Delivery services in `priority` order.
    pub fn didcomm_services(&self) -> Vec<DidCommService> {
        let mut services = self.services.clone();
        services.sort_by_key(|s| s.priority);
        services
    }

    /// Whether the document advertises anything a peer can connect to.
    pub fn has_inbound_endpoint(&self) -> bool {
        self.services.iter().any(|s| !s.is_queue())
    }
}

#[async_trait]
pub trait DidResolver: Send + Sync {
    async fn resolve(&self, did: &str) -> Result<DidDocument, AgentError>;
}

#[derive(Default)]
pub struct StaticDidResolver {
    documents: RwLock<HashMap<String, DidDocument>>,
}

impl StaticDidResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, document: DidDocument) {
        self.documents.write().insert(document.id.clone(), document);
    }
}

#[async_trait]
impl DidResolver for StaticDidResolver {
    async fn resolve(&self, did: &str) -> Result<DidDocument, AgentError> {
        // did:key documents are self-describing; no services.
        if did.starts_with("did:key:") {
            let key = PublicKey::from_did_key(did)?;
            return Ok(DidDocument {
                id: did.to_string(),
                authentication: vec![key],
                services: vec![],
            });
        }
        self.documents
            .read()
            .get(did)
            .cloned()
            .ok_or_else(|| AgentError::NotFound(format!("DID document for {did}")))
    }
}

/// A service listed in an out-of-band invitation: inline, or a DID to
/// resolve.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OutOfBandService {
    Inline(DidCommService),
    Did(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutOfBandRecord {
    pub id: String,
    pub services: Vec<OutOfBandService>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_crypto::KeyPair;

    #[test]
    fn services_sort_by_priority_and_expose_scheme() {
        let key = KeyPair::generate().public();
        let mut late = DidCommService::new("#2", "WSS://relay.example", vec![key]);
        late.priority = 5;
        let early = DidCommService::new("#1", "https://relay.example", vec![key]);
        let queue = DidCommService::new("#q", QUEUE_ENDPOINT, vec![key]);
        let doc = DidDocument {
            id: "did:example:peer".into(),
            authentication: vec![key],
            services: vec![late, early, queue],
        };
        let ordered: Vec<String> = doc.didcomm_services().iter().map(DidCommService::scheme).collect();
        assert_eq!(ordered, vec!["https", "didcomm", "wss"]);
        assert!(doc.has_inbound_endpoint());
    }

    #[tokio::test]
    async fn did_key_resolves_without_registration() {
        let key = KeyPair::generate().public();
        let resolver = StaticDidResolver::new();
        let doc = resolver.resolve(&key.to_did_key()).await.unwrap();
        assert_eq!(doc.authentication, vec![key]);
        assert!(resolver.resolve("did:example:unknown").await.is_err());
    }
}
