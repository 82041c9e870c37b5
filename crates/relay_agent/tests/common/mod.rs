//! Hand-written fakes shared by the integration suites.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use relay_agent::{
    did::{DidCommService, DidDocument, DidResolver, StaticDidResolver, QUEUE_ENDPOINT},
    receiver::MessageReceiver,
    transport::{OutboundPackage, OutboundTransport, SessionChannel},
    AgentError, ConnectionRecord, InMemoryConnectionService,
};
use relay_crypto::{InMemoryKeyStore, KeyStore, PublicKey};
use relay_proto::EncryptedMessage;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// One side of a relationship: its own key store and a single key.
pub struct Party {
    pub keys: Arc<InMemoryKeyStore>,
    pub key: PublicKey,
    pub did: String,
}

impl Party {
    pub fn new(did: &str) -> Self {
        let keys = Arc::new(InMemoryKeyStore::new());
        let key = keys.create_key();
        Self {
            keys,
            key,
            did: did.to_string(),
        }
    }

    pub fn key_store(&self) -> Arc<dyn KeyStore> {
        Arc::clone(&self.keys) as Arc<dyn KeyStore>
    }

    pub fn service(&self, id: &str, endpoint: &str, priority: u32) -> DidCommService {
        DidCommService {
            priority,
            ..DidCommService::new(id, endpoint, vec![self.key])
        }
    }

    pub fn queue_service(&self) -> DidCommService {
        self.service("#queue", QUEUE_ENDPOINT, 100)
    }

    pub fn document(&self, services: Vec<DidCommService>) -> DidDocument {
        DidDocument {
            id: self.did.clone(),
            authentication: vec![self.key],
            services,
        }
    }
}

/// `ours` → `theirs`, registered on `connections` under our key.
pub fn connect(connections: &InMemoryConnectionService, ours: &Party, theirs: &Party) -> ConnectionRecord {
    let record = ConnectionRecord::new(&ours.did, Some(theirs.did.clone()));
    connections.insert(record.clone(), vec![ours.key], vec![theirs.key]);
    record
}

/// Records every package; optionally fails every send.
pub struct RecordingTransport {
    schemes: Vec<&'static str>,
    fail: bool,
    sent: Mutex<Vec<OutboundPackage>>,
    attempts: AtomicUsize,
}

impl RecordingTransport {
    pub fn new(schemes: &[&'static str]) -> Arc<Self> {
        Arc::new(Self {
            schemes: schemes.to_vec(),
            fail: false,
            sent: Mutex::new(Vec::new()),
            attempts: AtomicUsize::new(0),
        })
    }

    pub fn failing(schemes: &[&'static str]) -> Arc<Self> {
        Arc::new(Self {
            schemes: schemes.to_vec(),
            fail: true,
            sent: Mutex::new(Vec::new()),
            attempts: AtomicUsize::new(0),
        })
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn endpoints(&self) -> Vec<String> {
        self.sent.lock().iter().map(|p| p.endpoint.clone()).collect()
    }

    pub fn payloads(&self) -> Vec<EncryptedMessage> {
        self.sent.lock().iter().map(|p| p.payload.clone()).collect()
    }
}

#[async_trait]
impl OutboundTransport for RecordingTransport {
    fn supported_schemes(&self) -> &[&'static str] {
        &self.schemes
    }

    async fn start(&self) -> Result<(), AgentError> {
        Ok(())
    }

    async fn stop(&self) -> Result<(), AgentError> {
        Ok(())
    }

    async fn send_message(&self, package: OutboundPackage) -> Result<(), AgentError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(AgentError::Delivery {
                endpoint: package.endpoint,
                reason: "connection refused".into(),
            });
        }
        self.sent.lock().push(package);
        Ok(())
    }
}

/// Hands every package straight to another agent's receiver, like an
/// HTTP POST whose handling completes before the response.
pub struct LoopbackTransport {
    target: Arc<MessageReceiver>,
    errors: Mutex<Vec<String>>,
}

impl LoopbackTransport {
    pub fn new(target: Arc<MessageReceiver>) -> Arc<Self> {
        Arc::new(Self {
            target,
            errors: Mutex::new(Vec::new()),
        })
    }

    pub fn errors(&self) -> Vec<String> {
        self.errors.lock().clone()
    }
}

#[async_trait]
impl OutboundTransport for LoopbackTransport {
    fn supported_schemes(&self) -> &[&'static str] {
        &["http", "https"]
    }

    async fn start(&self) -> Result<(), AgentError> {
        Ok(())
    }

    async fn stop(&self) -> Result<(), AgentError> {
        Ok(())
    }

    async fn send_message(&self, package: OutboundPackage) -> Result<(), AgentError> {
        if let Err(err) = self.target.receive(&package.payload, None, None).await {
            self.errors.lock().push(err.to_string());
        }
        Ok(())
    }
}

/// Session channel that keeps what it was asked to send.
#[derive(Default)]
pub struct RecordingChannel {
    sent: Mutex<Vec<EncryptedMessage>>,
    closed: AtomicUsize,
}

impl RecordingChannel {
    pub fn sent(&self) -> Vec<EncryptedMessage> {
        self.sent.lock().clone()
    }

    pub fn closes(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SessionChannel for RecordingChannel {
    async fn send(&self, envelope: &EncryptedMessage) -> Result<(), AgentError> {
        self.sent.lock().push(envelope.clone());
        Ok(())
    }

    async fn close(&self) -> Result<(), AgentError> {
        self.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Counts lookups so tests can assert the resolver was never consulted.
#[derive(Default)]
pub struct CountingResolver {
    inner: StaticDidResolver,
    calls: AtomicUsize,
}

impl CountingResolver {
    pub fn register(&self, document: DidDocument) {
        self.inner.register(document);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DidResolver for CountingResolver {
    async fn resolve(&self, did: &str) -> Result<DidDocument, AgentError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.resolve(did).await
    }
}
