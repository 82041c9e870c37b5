//! What the receive pipeline keeps of the session a message arrived on.

mod common;

use std::sync::Arc;

use common::{Party, RecordingChannel};
use relay_agent::{transport::TransportSession, Agent, AgentConfig, AgentDeps};
use relay_crypto::{KeyStore, PublicKey};
use relay_proto::{protocols::trust_ping::TrustPing, AgentMessage, EncryptedMessage, EnvelopeCodec, EnvelopeKeys, ReturnRoute};

struct Setup {
    agent: Agent,
    ours: PublicKey,
    peer: Party,
}

impl Setup {
    fn new() -> Self {
        common::init_tracing();
        let agent = Agent::new(AgentConfig::default(), AgentDeps::in_memory()).unwrap();
        let ours = agent.key_store().create_key();
        Self {
            agent,
            ours,
            peer: Party::new("did:example:peer"),
        }
    }

    fn envelope(&self, route: Option<ReturnRoute>) -> EncryptedMessage {
        let mut message = AgentMessage::new(&TrustPing {
            response_requested: false,
            comment: None,
        })
        .unwrap();
        if let Some(route) = route {
            message.set_return_route(route);
        }
        EnvelopeCodec::new(self.peer.key_store())
            .pack(
                &message,
                &EnvelopeKeys {
                    recipient_keys: vec![self.ours],
                    routing_keys: vec![],
                    sender_key: Some(self.peer.key),
                },
            )
            .unwrap()
    }

    async fn register(&self, session: &Arc<TransportSession>) {
        self.agent.sessions().save(Arc::clone(session)).await;
    }
}

#[tokio::test]
async fn accepted_session_without_return_route_is_closed() {
    let s = Setup::new();
    let channel = Arc::new(RecordingChannel::default());
    let session = TransportSession::new("WebSocket", channel.clone());
    s.register(&session).await;

    s.agent
        .receiver()
        .receive(&s.envelope(None), Some(&session.id), None)
        .await
        .unwrap();

    assert_eq!(channel.closes(), 1);
    assert!(s.agent.sessions().find_by_id(&session.id).is_none());
    assert!(session.keys().is_none());
}

#[tokio::test]
async fn return_route_keeps_the_session_with_reply_keys() {
    let s = Setup::new();
    let channel = Arc::new(RecordingChannel::default());
    let session = TransportSession::new("WebSocket", channel.clone());
    s.register(&session).await;

    s.agent
        .receiver()
        .receive(&s.envelope(Some(ReturnRoute::All)), Some(&session.id), None)
        .await
        .unwrap();

    assert_eq!(channel.closes(), 0);
    assert!(s.agent.sessions().find_by_id(&session.id).is_some());
    let keys = session.keys().unwrap();
    assert_eq!(keys.recipient_keys, vec![s.peer.key]);
    assert_eq!(keys.sender_key, Some(s.ours));
    assert!(session.allows_return_route("any-thread"));
}

#[tokio::test]
async fn dialled_session_stays_open_but_drops_its_return_route() {
    let s = Setup::new();
    let channel = Arc::new(RecordingChannel::default());
    let session = TransportSession::dialled("WebSocket", channel.clone());
    s.register(&session).await;

    s.agent
        .receiver()
        .receive(&s.envelope(Some(ReturnRoute::All)), Some(&session.id), None)
        .await
        .unwrap();
    assert!(session.allows_return_route("any-thread"));

    s.agent
        .receiver()
        .receive(&s.envelope(None), Some(&session.id), None)
        .await
        .unwrap();

    assert_eq!(channel.closes(), 0);
    assert!(s.agent.sessions().find_by_id(&session.id).is_some());
    assert!(!session.allows_return_route("any-thread"));
}
