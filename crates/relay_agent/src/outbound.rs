//! What the dispatcher is asked to send, and what it reports back.

use relay_crypto::PublicKey;
use relay_proto::AgentMessage;
use serde::{Deserialize, Serialize};

use crate::{
    connection::ConnectionRecord,
    did::{DidCommService, OutOfBandRecord},
};

/// Terminal outcome of a send; emitted exactly once per call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SendStatus {
    SentToSession,
    SentToTransport,
    QueuedForPickup,
    Undeliverable,
}

/// Scheme preference for one send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportPriority {
    /// Most preferred first.
    pub schemes: Vec<String>,
    /// Drop services whose scheme is not listed.
    pub restrictive: bool,
}

impl TransportPriority {
    pub fn new<S: Into<String>>(schemes: impl IntoIterator<Item = S>, restrictive: bool) -> Self {
        Self {
            schemes: schemes.into_iter().map(Into::into).collect(),
            restrictive,
        }
    }

    fn rank(&self, service: &DidCommService) -> Option<usize> {
        let scheme = service.scheme();
        self.schemes.iter().position(|s| s.eq_ignore_ascii_case(&scheme))
    }

    /// Filter (when restrictive) and stable-sort by scheme rank.
    pub fn apply(&self, services: Vec<DidCommService>) -> Vec<DidCommService> {
        let mut services: Vec<DidCommService> = services
            .into_iter()
            .filter(|s| !self.restrictive || self.rank(s).is_some())
            .collect();
        services.sort_by_key(|s| self.rank(s).unwrap_or(usize::MAX));
        services
    }
}

/// Explicit target, used before a connection exists.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceParams {
    pub service: DidCommService,
    pub sender_key: PublicKey,
}

#[derive(Debug, Clone)]
pub struct OutboundMessageContext {
    pub message: AgentMessage,
    pub connection: Option<ConnectionRecord>,
    pub service_params: Option<ServiceParams>,
    /// Services for a peer whose DID is not known yet.
    pub out_of_band: Option<OutOfBandRecord>,
    /// Inbound session to prefer for the reply.
    pub session_id: Option<String>,
    /// Whether the queue pseudo-service may take the message.
    pub allow_queue: bool,
}

impl OutboundMessageContext {
    pub fn new(message: AgentMessage) -> Self {
        Self {
            message,
            connection: None,
            service_params: None,
            out_of_band: None,
            session_id: None,
            allow_queue: true,
        }
    }

    pub fn for_connection(message: AgentMessage, connection: ConnectionRecord) -> Self {
        Self {
            connection: Some(connection),
            ..Self::new(message)
        }
    }

    pub fn for_service(message: AgentMessage, service_params: ServiceParams) -> Self {
        Self {
            service_params: Some(service_params),
            ..Self::new(message)
        }
    }

    pub fn with_session(mut self, session_id: Option<String>) -> Self {
        self.session_id = session_id;
        self
    }

    pub fn with_out_of_band(mut self, out_of_band: OutOfBandRecord) -> Self {
        self.out_of_band = Some(out_of_band);
        self
    }

    pub fn without_queue(mut self) -> Self {
        self.allow_queue = false;
        self
    }

    pub fn connection_id(&self) -> Option<&str> {
        self.connection.as_ref().map(|c| c.id.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_crypto::KeyPair;

    #[test]
    fn restrictive_priority_drops_unlisted_schemes() {
        let key = KeyPair::generate().public();
        let services = vec![
            DidCommService::new("#http", "http://a.example", vec![key]),
            DidCommService::new("#ws", "ws://a.example", vec![key]),
            DidCommService::new("#wss", "wss://a.example", vec![key]),
        ];

        let only_secure = TransportPriority::new(["wss"], true).apply(services.clone());
        assert_eq!(only_secure.iter().map(|s| s.id.as_str()).collect::<Vec<_>>(), vec!["#wss"]);

        let preferred = TransportPriority::new(["wss", "ws"], false).apply(services);
        assert_eq!(
            preferred.iter().map(|s| s.id.as_str()).collect::<Vec<_>>(),
            vec!["#wss", "#ws", "#http"]
        );
    }
}
