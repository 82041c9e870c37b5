//! Two agents wired back to back: a recipient and its mediator.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{connect, LoopbackTransport, Party};
use relay_agent::{
    events::AgentEvent,
    pickup::PickupRequest,
    Agent, AgentConfig, AgentDeps, AgentError, ConnectionRecord, InMemoryConnectionService, InboundMessageContext,
    OutboundMessageContext, SendStatus, StaticDidResolver,
};
use relay_crypto::KeyStore;
use relay_proto::{
    protocols::{
        mediation::KeylistUpdateAction, pickup::PickupVersion, problem_report::codes, routing::Forward,
        trust_ping::TrustPing,
    },
    AgentMessage, EncryptedMessage, EnvelopeCodec, EnvelopeKeys,
};
use relay_store::{MediationRole, MediationState, QueueScope};

const MEDIATOR_ENDPOINT: &str = "http://mediator.example";

struct Pair {
    recipient: Agent,
    mediator: Agent,
    to_mediator: ConnectionRecord,
    to_recipient: ConnectionRecord,
}

fn pair(mediator_config: AgentConfig) -> Pair {
    common::init_tracing();
    let alice = Party::new("did:example:recipient");
    let relay = Party::new("did:example:mediator");

    let documents = [
        alice.document(vec![alice.service("#http", "http://recipient.example", 0)]),
        relay.document(vec![relay.service("#http", MEDIATOR_ENDPOINT, 0)]),
    ];
    let resolver = |docs: &[relay_agent::DidDocument]| {
        let resolver = StaticDidResolver::new();
        for doc in docs {
            resolver.register(doc.clone());
        }
        Arc::new(resolver)
    };

    let alice_connections = Arc::new(InMemoryConnectionService::new());
    let to_mediator = connect(&alice_connections, &alice, &relay);
    let relay_connections = Arc::new(InMemoryConnectionService::new());
    let to_recipient = connect(&relay_connections, &relay, &alice);

    let recipient = Agent::new(
        AgentConfig::default(),
        AgentDeps {
            key_store: alice.key_store(),
            connections: alice_connections,
            resolver: resolver(&documents),
            ..AgentDeps::in_memory()
        },
    )
    .unwrap();
    let mediator = Agent::new(
        AgentConfig {
            endpoints: vec![MEDIATOR_ENDPOINT.into()],
            ..mediator_config
        },
        AgentDeps {
            key_store: relay.key_store(),
            connections: relay_connections,
            resolver: resolver(&documents),
            ..AgentDeps::in_memory()
        },
    )
    .unwrap();

    recipient.register_outbound_transport(LoopbackTransport::new(Arc::clone(mediator.receiver())));
    mediator.register_outbound_transport(LoopbackTransport::new(Arc::clone(recipient.receiver())));

    Pair {
        recipient,
        mediator,
        to_mediator,
        to_recipient,
    }
}

/// Anoncrypt a ping to `key` and wrap it in a forward.
fn forward_to(key_store: Arc<dyn KeyStore>, key: &relay_crypto::PublicKey) -> (Forward, EncryptedMessage) {
    let inner = AgentMessage::new(&TrustPing {
        response_requested: false,
        comment: None,
    })
    .unwrap();
    let envelope = EnvelopeCodec::new(key_store)
        .pack(
            &inner,
            &EnvelopeKeys {
                recipient_keys: vec![*key],
                routing_keys: vec![],
                sender_key: None,
            },
        )
        .unwrap();
    (
        Forward {
            to: key.to_did_key(),
            msg: envelope.clone(),
        },
        envelope,
    )
}

#[tokio::test]
async fn grant_keylist_forward_and_pickup() {
    let p = pair(AgentConfig::default());
    let recipient = p.recipient.mediation_recipient();

    let record = recipient
        .request_and_await_grant(&p.to_mediator, Some(Duration::from_secs(2)))
        .await
        .unwrap();
    assert_eq!(record.state, MediationState::Granted);
    assert_eq!(record.endpoint.as_deref(), Some(MEDIATOR_ENDPOINT));
    assert_eq!(record.routing_keys, vec![p.mediator.mediator().routing_key()]);
    assert!(recipient.uses_did_key(&p.to_mediator.id));

    let new_key = p.recipient.key_store().create_key();
    let record = recipient
        .keylist_update_and_await(&record.id, &new_key, KeylistUpdateAction::Add, Some(Duration::from_secs(2)))
        .await
        .unwrap();
    assert_eq!(record.recipient_keys, vec![new_key]);
    let held = p
        .mediator
        .mediation_repository()
        .find_by_recipient_key(MediationRole::Mediator, &new_key)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(held.connection_id, p.to_recipient.id);

    let (forward, envelope) = forward_to(p.recipient.key_store().clone(), &new_key);
    let ctx = InboundMessageContext::new(AgentMessage::new(&forward).unwrap());
    let status = p.mediator.mediator().process_forward(&ctx).await.unwrap();
    assert_eq!(status, SendStatus::QueuedForPickup);
    let scope = QueueScope::connection(&p.to_recipient.id);
    assert_eq!(p.mediator.queue().get_available_message_count(&scope).await.unwrap(), 1);

    let expected = envelope.clone();
    let delivered = p.recipient.events().waiter("picked-up envelope", move |event| match event {
        AgentEvent::MessageReceived { envelope, .. } if *envelope == expected => Some(()),
        _ => None,
    });
    p.recipient
        .pickup()
        .pickup_messages(
            PickupRequest::new(&p.to_mediator.id, PickupVersion::V2).awaiting_completion(Some(Duration::from_secs(2))),
        )
        .await
        .unwrap();
    delivered.wait(Duration::from_secs(1)).await.unwrap();
    assert_eq!(p.mediator.queue().get_available_message_count(&scope).await.unwrap(), 0);
}

#[tokio::test]
async fn base58_grant_keys_are_normalised() {
    let p = pair(AgentConfig {
        use_did_key_in_protocols: false,
        ..AgentConfig::default()
    });
    let recipient = p.recipient.mediation_recipient();

    let record = recipient
        .request_and_await_grant(&p.to_mediator, Some(Duration::from_secs(2)))
        .await
        .unwrap();

    assert_eq!(record.routing_keys, vec![p.mediator.mediator().routing_key()]);
    assert!(!recipient.uses_did_key(&p.to_mediator.id));
}

#[tokio::test]
async fn grant_is_only_legal_from_requested() {
    let p = pair(AgentConfig::default());
    p.recipient
        .mediation_recipient()
        .request_and_await_grant(&p.to_mediator, Some(Duration::from_secs(2)))
        .await
        .unwrap();
    let held = p
        .mediator
        .mediation_repository()
        .find_by_connection_id(&p.to_recipient.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(held.state, MediationState::Granted);

    let err = p.mediator.mediator().create_grant(&held.id).await.unwrap_err();
    assert!(matches!(err, AgentError::InvalidState(_)));
    let err = p.mediator.mediator().create_deny(&held.id).await.unwrap_err();
    assert!(matches!(err, AgentError::InvalidState(_)));
}

#[tokio::test]
async fn manual_deny_reaches_recipient() {
    let p = pair(AgentConfig {
        auto_accept_mediation_requests: false,
        ..AgentConfig::default()
    });
    let requested = p
        .recipient
        .mediation_recipient()
        .request_mediation(&p.to_mediator)
        .await
        .unwrap();
    assert_eq!(requested.state, MediationState::Requested);

    let held = p
        .mediator
        .mediation_repository()
        .find_by_connection_id(&p.to_recipient.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(held.state, MediationState::Requested);
    let (held, deny) = p.mediator.mediator().create_deny(&held.id).await.unwrap();
    assert_eq!(held.state, MediationState::Denied);
    p.mediator
        .dispatcher()
        .send_message(OutboundMessageContext::for_connection(deny, p.to_recipient.clone()), None)
        .await
        .unwrap();

    let record = p
        .recipient
        .mediation_repository()
        .get_by_id(&requested.id)
        .await
        .unwrap();
    assert_eq!(record.state, MediationState::Denied);

    let err = p
        .recipient
        .mediation_recipient()
        .keylist_update_and_await(&record.id, &record_key(&p), KeylistUpdateAction::Add, None)
        .await
        .unwrap_err();
    assert!(matches!(err, AgentError::InvalidState(_)));
}

fn record_key(p: &Pair) -> relay_crypto::PublicKey {
    p.recipient.key_store().create_key()
}

#[tokio::test(start_paused = true)]
async fn unanswered_request_times_out() {
    let p = pair(AgentConfig {
        auto_accept_mediation_requests: false,
        ..AgentConfig::default()
    });

    let err = p
        .recipient
        .mediation_recipient()
        .request_and_await_grant(&p.to_mediator, Some(Duration::from_millis(500)))
        .await
        .unwrap_err();

    assert!(matches!(err, AgentError::Timeout { .. }));
    assert_eq!(p.recipient.events().receiver_count(), 0);
}

#[tokio::test]
async fn forward_to_unknown_key_is_not_mediated() {
    let p = pair(AgentConfig::default());
    let stranger = Party::new("did:example:stranger");
    let (forward, _) = forward_to(stranger.key_store(), &stranger.key);
    let ctx = InboundMessageContext::new(AgentMessage::new(&forward).unwrap());

    let err = p.mediator.mediator().process_forward(&ctx).await.unwrap_err();

    match err {
        AgentError::ProblemReport { code, .. } => assert_eq!(code, codes::NOT_MEDIATED),
        other => panic!("unexpected error {other}"),
    }
}

#[tokio::test]
async fn mediator_remembers_key_format_per_connection() {
    for use_did_key in [true, false] {
        let p = pair(AgentConfig {
            use_did_key_in_protocols: use_did_key,
            ..AgentConfig::default()
        });
        let recipient = p.recipient.mediation_recipient();
        let record = recipient
            .request_and_await_grant(&p.to_mediator, Some(Duration::from_secs(2)))
            .await
            .unwrap();
        assert_eq!(p.mediator.mediator().uses_did_key(&p.to_recipient.id), None);

        let key = p.recipient.key_store().create_key();
        recipient
            .keylist_update_and_await(&record.id, &key, KeylistUpdateAction::Add, Some(Duration::from_secs(2)))
            .await
            .unwrap();

        assert_eq!(p.mediator.mediator().uses_did_key(&p.to_recipient.id), Some(use_did_key));
        assert_eq!(p.mediator.mediator().uses_did_key("some-other-connection"), None);
    }
}
