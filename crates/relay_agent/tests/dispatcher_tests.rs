//! Outbound delivery order: session, then services by priority, then the
//! mediator queue.

mod common;

use std::sync::Arc;

use common::{connect, CountingResolver, Party, RecordingChannel, RecordingTransport};
use relay_agent::{
    dispatcher::OutboundDispatcher,
    events::{AgentEvent, EventBus},
    transport::{TransportSession, TransportSessionRegistry},
    AgentError, ConnectionRecord, InMemoryConnectionService, OutboundMessageContext, SendStatus, TransportPriority,
};
use relay_proto::{
    protocols::trust_ping::TrustPing, AgentMessage, EnvelopeCodec, EnvelopeKeys, ReturnRoute, TransportDecorator,
};
use relay_store::{InMemoryQueueStore, MessageQueueStore, QueueScope, TakeOptions};
use tokio::sync::broadcast;

struct Harness {
    alice: Party,
    bob: Party,
    events: EventBus,
    sessions: Arc<TransportSessionRegistry>,
    resolver: Arc<CountingResolver>,
    queue: Arc<InMemoryQueueStore>,
    dispatcher: OutboundDispatcher,
    connection: ConnectionRecord,
}

impl Harness {
    /// Alice sends to Bob; Alice advertises no endpoint of her own.
    fn new(bob_services: impl FnOnce(&Party) -> Vec<relay_agent::DidCommService>) -> Self {
        common::init_tracing();
        let alice = Party::new("did:example:alice");
        let bob = Party::new("did:example:bob");
        let events = EventBus::new(64);
        let sessions = Arc::new(TransportSessionRegistry::new(events.clone()));
        let resolver = Arc::new(CountingResolver::default());
        resolver.register(alice.document(vec![]));
        resolver.register(bob.document(bob_services(&bob)));
        let queue = Arc::new(InMemoryQueueStore::new());
        let dispatcher = OutboundDispatcher::new(
            EnvelopeCodec::new(alice.key_store()),
            Arc::clone(&sessions),
            Arc::clone(&resolver) as Arc<dyn relay_agent::DidResolver>,
            Arc::clone(&queue) as Arc<dyn MessageQueueStore>,
            events.clone(),
        );
        let connections = InMemoryConnectionService::new();
        let connection = connect(&connections, &alice, &bob);
        Self {
            alice,
            bob,
            events,
            sessions,
            resolver,
            queue,
            dispatcher,
            connection,
        }
    }

    fn ping(&self) -> OutboundMessageContext {
        let message = AgentMessage::new(&TrustPing {
            response_requested: true,
            comment: None,
        })
        .unwrap();
        OutboundMessageContext::for_connection(message, self.connection.clone())
    }

    fn bob_codec(&self) -> EnvelopeCodec {
        EnvelopeCodec::new(self.bob.key_store())
    }

    /// A WebSocket session to Bob whose last inbound message carried
    /// `inbound` as its `~transport`.
    async fn session(&self, inbound: TransportDecorator) -> Arc<RecordingChannel> {
        let channel = Arc::new(RecordingChannel::default());
        let session = TransportSession::new("WebSocket", channel.clone());
        session.set_keys(EnvelopeKeys {
            recipient_keys: vec![self.bob.key],
            routing_keys: vec![],
            sender_key: Some(self.alice.key),
        });
        session.set_inbound_transport(Some(inbound));
        session.set_connection_id(self.connection.id.clone());
        self.sessions.save(session).await;
        channel
    }
}

/// Statuses of every `MessageSent` emitted so far.
fn sent_statuses(events: &mut broadcast::Receiver<AgentEvent>) -> Vec<SendStatus> {
    let mut statuses = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let AgentEvent::MessageSent { status, .. } = event {
            statuses.push(status);
        }
    }
    statuses
}

#[tokio::test]
async fn return_route_session_wins_without_resolving() {
    let h = Harness::new(|bob| vec![bob.service("#http", "http://bob.example", 0)]);
    let http = RecordingTransport::new(&["http"]);
    h.dispatcher.register_outbound_transport(http.clone());

    let channel = Arc::new(RecordingChannel::default());
    let session = TransportSession::new("WebSocket", channel.clone());
    session.set_keys(EnvelopeKeys {
        recipient_keys: vec![h.bob.key],
        routing_keys: vec![],
        sender_key: Some(h.alice.key),
    });
    session.set_inbound_transport(Some(TransportDecorator {
        return_route: Some(ReturnRoute::All),
        return_route_thread: None,
    }));
    session.set_connection_id(h.connection.id.clone());
    h.sessions.save(session).await;

    let status = h.dispatcher.send_message(h.ping(), None).await.unwrap();

    assert_eq!(status, SendStatus::SentToSession);
    assert_eq!(channel.sent().len(), 1);
    assert_eq!(h.resolver.calls(), 0);
    assert_eq!(http.attempts(), 0);
}

#[tokio::test]
async fn session_without_return_route_is_skipped() {
    let h = Harness::new(|bob| vec![bob.service("#http", "http://bob.example", 0)]);
    let http = RecordingTransport::new(&["http"]);
    h.dispatcher.register_outbound_transport(http.clone());

    let channel = Arc::new(RecordingChannel::default());
    let session = TransportSession::new("WebSocket", channel.clone());
    session.set_keys(EnvelopeKeys {
        recipient_keys: vec![h.bob.key],
        routing_keys: vec![],
        sender_key: Some(h.alice.key),
    });
    session.set_connection_id(h.connection.id.clone());
    h.sessions.save(session).await;

    let status = h.dispatcher.send_message(h.ping(), None).await.unwrap();

    assert_eq!(status, SendStatus::SentToTransport);
    assert!(channel.sent().is_empty());
    assert_eq!(http.endpoints(), vec!["http://bob.example".to_string()]);
}

#[tokio::test]
async fn services_are_tried_in_priority_order() {
    let h = Harness::new(|bob| {
        vec![
            bob.service("#http", "http://bob.example", 1),
            bob.service("#ws", "wss://bob.example", 0),
        ]
    });
    let ws = RecordingTransport::failing(&["ws", "wss"]);
    let http = RecordingTransport::new(&["http", "https"]);
    h.dispatcher.register_outbound_transport(ws.clone());
    h.dispatcher.register_outbound_transport(http.clone());

    let status = h.dispatcher.send_message(h.ping(), None).await.unwrap();

    assert_eq!(status, SendStatus::SentToTransport);
    assert_eq!(ws.attempts(), 1);
    assert_eq!(http.endpoints(), vec!["http://bob.example".to_string()]);

    // Alice has no endpoint, so Bob is asked to answer on the same channel.
    let delivered = h.bob_codec().unpack(&http.payloads()[0]).unwrap();
    assert!(delivered.plaintext.has_any_return_route());
    assert_eq!(delivered.sender_key, Some(h.alice.key));
}

#[tokio::test]
async fn restrictive_priority_never_tries_other_schemes() {
    let h = Harness::new(|bob| {
        vec![
            bob.service("#http", "http://bob.example", 0),
            bob.service("#ws", "wss://bob.example", 1),
        ]
    });
    let ws = RecordingTransport::failing(&["ws", "wss"]);
    let http = RecordingTransport::new(&["http", "https"]);
    h.dispatcher.register_outbound_transport(ws.clone());
    h.dispatcher.register_outbound_transport(http.clone());
    let mut events = h.events.subscribe();

    let err = h
        .dispatcher
        .send_message(h.ping(), Some(TransportPriority::new(["wss"], true)))
        .await
        .unwrap_err();

    assert!(matches!(err, AgentError::Undeliverable { .. }));
    assert_eq!(ws.attempts(), 1);
    assert_eq!(http.attempts(), 0);
    match events.recv().await.unwrap() {
        AgentEvent::MessageSent { status, .. } => assert_eq!(status, SendStatus::Undeliverable),
        other => panic!("unexpected event {}", other.name()),
    }
}

#[tokio::test]
async fn falls_back_to_queue_when_every_service_fails() {
    let h = Harness::new(|bob| vec![bob.service("#http", "http://bob.example", 0), bob.queue_service()]);
    let http = RecordingTransport::failing(&["http"]);
    h.dispatcher.register_outbound_transport(http.clone());

    let status = h.dispatcher.send_message(h.ping(), None).await.unwrap();

    assert_eq!(status, SendStatus::QueuedForPickup);
    assert_eq!(http.attempts(), 1);
    let queued = h
        .queue
        .take_from_queue(TakeOptions {
            scope: QueueScope::connection(&h.connection.id),
            limit: None,
            delete_messages: true,
        })
        .await
        .unwrap();
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].recipient_dids, vec![h.bob.key.to_did_key()]);
    assert!(h.bob_codec().unpack(&queued[0].encrypted_message).is_ok());
}

#[tokio::test]
async fn queue_disallowed_is_undeliverable() {
    let h = Harness::new(|bob| vec![bob.service("#http", "http://bob.example", 0), bob.queue_service()]);
    h.dispatcher
        .register_outbound_transport(RecordingTransport::failing(&["http"]));

    let err = h
        .dispatcher
        .send_message(h.ping().without_queue(), None)
        .await
        .unwrap_err();

    assert!(matches!(err, AgentError::Undeliverable { .. }));
    let count = h
        .queue
        .get_available_message_count(&QueueScope::connection(&h.connection.id))
        .await
        .unwrap();
    assert_eq!(count, 0);
}

#[tokio::test]
async fn no_transports_and_no_queue_is_a_transport_error() {
    let h = Harness::new(|bob| vec![bob.service("#http", "http://bob.example", 0)]);

    let err = h.dispatcher.send_message(h.ping(), None).await.unwrap_err();

    assert!(matches!(err, AgentError::Transport(_)));
}

#[tokio::test]
async fn message_without_connection_or_session_is_rejected() {
    let h = Harness::new(|_| vec![]);
    let message = AgentMessage::new(&TrustPing {
        response_requested: false,
        comment: None,
    })
    .unwrap();

    let err = h
        .dispatcher
        .send_message(OutboundMessageContext::new(message), None)
        .await
        .unwrap_err();

    assert!(matches!(err, AgentError::ProtocolViolation(_)));
}

#[tokio::test]
async fn thread_scoped_return_route_only_serves_its_thread() {
    let h = Harness::new(|bob| vec![bob.service("#http", "http://bob.example", 0)]);
    let http = RecordingTransport::new(&["http"]);
    h.dispatcher.register_outbound_transport(http.clone());
    let channel = h
        .session(TransportDecorator {
            return_route: Some(ReturnRoute::Thread),
            return_route_thread: Some("thread-1".into()),
        })
        .await;

    let mut on_thread = h.ping();
    on_thread.message = on_thread.message.with_thread_id("thread-1");
    let status = h.dispatcher.send_message(on_thread, None).await.unwrap();
    assert_eq!(status, SendStatus::SentToSession);
    assert_eq!(channel.sent().len(), 1);
    assert_eq!(http.attempts(), 0);

    let mut elsewhere = h.ping();
    elsewhere.message = elsewhere.message.with_thread_id("thread-2");
    let status = h.dispatcher.send_message(elsewhere, None).await.unwrap();
    assert_eq!(status, SendStatus::SentToTransport);
    assert_eq!(channel.sent().len(), 1);
    assert_eq!(http.endpoints(), vec!["http://bob.example".to_string()]);
}

#[tokio::test]
async fn every_send_emits_exactly_one_message_sent() {
    let h = Harness::new(|bob| vec![bob.service("#http", "http://bob.example", 0), bob.queue_service()]);
    let http = RecordingTransport::new(&["http"]);
    h.dispatcher.register_outbound_transport(http.clone());
    let mut events = h.events.subscribe();

    h.dispatcher.send_message(h.ping(), None).await.unwrap();
    assert_eq!(sent_statuses(&mut events), vec![SendStatus::SentToTransport]);

    h.session(TransportDecorator {
        return_route: Some(ReturnRoute::All),
        return_route_thread: None,
    })
    .await;
    h.dispatcher.send_message(h.ping(), None).await.unwrap();
    assert_eq!(sent_statuses(&mut events), vec![SendStatus::SentToSession]);
}

#[tokio::test]
async fn queued_send_emits_exactly_one_message_sent() {
    let h = Harness::new(|bob| vec![bob.service("#http", "http://bob.example", 0), bob.queue_service()]);
    h.dispatcher
        .register_outbound_transport(RecordingTransport::failing(&["http"]));
    let mut events = h.events.subscribe();

    let status = h.dispatcher.send_message(h.ping(), None).await.unwrap();

    assert_eq!(status, SendStatus::QueuedForPickup);
    assert_eq!(sent_statuses(&mut events), vec![SendStatus::QueuedForPickup]);
}
