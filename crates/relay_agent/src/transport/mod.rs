//! Transports and transport sessions.
//!
//! An [`OutboundTransport`] opens a connection per send (or per endpoint)
//! for a URL scheme. A [`TransportSession`] is a live bidirectional channel
//! (an accepted or dialled socket) that replies can reuse when the peer
//! asked for return routing.

pub mod http;
pub mod registry;
pub mod ws;

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use relay_proto::{EncryptedMessage, EnvelopeKeys, TransportDecorator};

use crate::error::AgentError;

pub use registry::TransportSessionRegistry;

/// One packed message on its way to an endpoint.
#[derive(Debug, Clone)]
pub struct OutboundPackage {
    pub payload: EncryptedMessage,
    pub endpoint: String,
    pub connection_id: Option<String>,
    pub response_requested: bool,
}

#[async_trait]
pub trait OutboundTransport: Send + Sync {
    /// Lowercase URL schemes, without the colon.
    fn supported_schemes(&self) -> &[&'static str];

    async fn start(&self) -> Result<(), AgentError>;

    async fn stop(&self) -> Result<(), AgentError>;

    /// One attempt. Never retried internally.
    async fn send_message(&self, package: OutboundPackage) -> Result<(), AgentError>;

    fn supports(&self, scheme: &str) -> bool {
        self.supported_schemes().iter().any(|s| s.eq_ignore_ascii_case(scheme))
    }
}

/// The wire half of a session, provided by whichever transport owns it.
#[async_trait]
pub trait SessionChannel: Send + Sync {
    async fn send(&self, envelope: &EncryptedMessage) -> Result<(), AgentError>;
    async fn close(&self) -> Result<(), AgentError>;
}

#[derive(Debug, Clone, Default)]
struct SessionState {
    keys: Option<EnvelopeKeys>,
    connection_id: Option<String>,
    /// `~transport` of the most recent inbound message.
    inbound: Option<TransportDecorator>,
}

pub struct TransportSession {
    pub id: String,
    /// "WebSocket", "Http", ... At most one live session per connection
    /// per kind.
    pub kind: String,
    /// Opened by one of our outbound transports rather than accepted from
    /// a peer. Stays open for our own sends whatever the peer asks.
    pub dialled: bool,
    state: Mutex<SessionState>,
    channel: Arc<dyn SessionChannel>,
}

impl std::fmt::Debug for TransportSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportSession")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("dialled", &self.dialled)
            .field("state", &*self.state.lock())
            .finish()
    }
}

impl TransportSession {
    /// A session accepted from a peer.
    pub fn new(kind: impl Into<String>, channel: Arc<dyn SessionChannel>) -> Arc<Self> {
        Self::build(kind.into(), false, channel)
    }

    /// A session over a socket we opened ourselves.
    pub fn dialled(kind: impl Into<String>, channel: Arc<dyn SessionChannel>) -> Arc<Self> {
        Self::build(kind.into(), true, channel)
    }

    fn build(kind: String, dialled: bool, channel: Arc<dyn SessionChannel>) -> Arc<Self> {
        Arc::new(Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            dialled,
            state: Mutex::new(SessionState::default()),
            channel,
        })
    }

    pub fn connection_id(&self) -> Option<String> {
        self.state.lock().connection_id.clone()
    }

    pub fn set_connection_id(&self, connection_id: impl Into<String>) {
        self.state.lock().connection_id = Some(connection_id.into());
    }

    /// Keys for packing replies on this session.
    pub fn keys(&self) -> Option<EnvelopeKeys> {
        self.state.lock().keys.clone()
    }

    pub fn set_keys(&self, keys: EnvelopeKeys) {
        self.state.lock().keys = Some(keys);
    }

    pub fn set_inbound_transport(&self, decorator: Option<TransportDecorator>) {
        self.state.lock().inbound = decorator;
    }

    pub fn allows_return_route(&self, thread_id: &str) -> bool {
        self.state
            .lock()
            .inbound
            .as_ref()
            .map(|t| t.allows_return_route(thread_id))
            .unwrap_or(false)
    }

    pub fn has_return_route(&self) -> bool {
        self.state
            .lock()
            .inbound
            .as_ref()
            .map(TransportDecorator::has_any_return_route)
            .unwrap_or(false)
    }

    pub async fn send(&self, envelope: &EncryptedMessage) -> Result<(), AgentError> {
        self.channel.send(envelope).await
    }

    pub async fn close(&self) -> Result<(), AgentError> {
        self.channel.close().await
    }
}
