//! Outbound dispatch: session, then services, then the queue.
//!
//! Every `send_message` call ends in exactly one [`AgentEvent::MessageSent`]
//! carrying the terminal [`SendStatus`]. Attempts are never retried
//! internally; each fallback step is logged at `debug`.

use std::sync::Arc;

use parking_lot::RwLock;
use relay_crypto::PublicKey;
use relay_proto::{AgentMessage, EncryptedMessage, EnvelopeCodec, EnvelopeKeys, ReturnRoute};
use relay_store::MessageQueueStore;
use tracing::{debug, error, warn};

use crate::{
    connection::ConnectionRecord,
    did::{DidCommService, DidResolver, OutOfBandRecord, OutOfBandService},
    error::AgentError,
    events::{AgentEvent, EventBus},
    outbound::{OutboundMessageContext, SendStatus, TransportPriority},
    transport::{OutboundPackage, OutboundTransport, TransportSession, TransportSessionRegistry},
};

pub struct OutboundDispatcher {
    codec: EnvelopeCodec,
    sessions: Arc<TransportSessionRegistry>,
    resolver: Arc<dyn DidResolver>,
    queue: Arc<dyn MessageQueueStore>,
    events: EventBus,
    transports: RwLock<Vec<Arc<dyn OutboundTransport>>>,
}

impl OutboundDispatcher {
    pub fn new(
        codec: EnvelopeCodec,
        sessions: Arc<TransportSessionRegistry>,
        resolver: Arc<dyn DidResolver>,
        queue: Arc<dyn MessageQueueStore>,
        events: EventBus,
    ) -> Self {
        Self {
            codec,
            sessions,
            resolver,
            queue,
            events,
            transports: RwLock::new(Vec::new()),
        }
    }

    pub fn codec(&self) -> &EnvelopeCodec {
        &self.codec
    }

    /// Transports are tried in registration order.
    pub fn register_outbound_transport(&self, transport: Arc<dyn OutboundTransport>) {
        self.transports.write().push(transport);
    }

    pub fn outbound_transports(&self) -> Vec<Arc<dyn OutboundTransport>> {
        self.transports.read().clone()
    }

    fn transport_for(&self, scheme: &str) -> Option<Arc<dyn OutboundTransport>> {
        self.transports.read().iter().find(|t| t.supports(scheme)).cloned()
    }

    pub async fn send_message(
        &self,
        ctx: OutboundMessageContext,
        priority: Option<TransportPriority>,
    ) -> Result<SendStatus, AgentError> {
        let message_id = ctx.message.id.clone();
        let connection_id = ctx.connection_id().map(String::from);

        let result = self.try_send(ctx, priority.as_ref()).await;
        let status = match &result {
            Ok(status) => *status,
            Err(err) => {
                error!(message_id = %message_id, connection_id = ?connection_id, error = %err, "message undeliverable");
                SendStatus::Undeliverable
            }
        };
        self.events.emit(AgentEvent::MessageSent {
            message_id,
            connection_id,
            status,
        });
        result
    }

    async fn try_send(
        &self,
        ctx: OutboundMessageContext,
        priority: Option<&TransportPriority>,
    ) -> Result<SendStatus, AgentError> {
        let message_id = ctx.message.id.clone();

        if let Some(params) = &ctx.service_params {
            let keys = EnvelopeKeys {
                recipient_keys: params.service.recipient_keys.clone(),
                routing_keys: params.service.routing_keys.clone(),
                sender_key: Some(params.sender_key),
            };
            return match self
                .send_to_service(&ctx.message, &params.service, &keys, ctx.connection_id())
                .await
            {
                Ok(()) => Ok(SendStatus::SentToTransport),
                Err(err) => Err(AgentError::Undeliverable {
                    message_id,
                    reason: format!("{}: {err}", params.service.service_endpoint),
                }),
            };
        }

        if let Some(session) = self.usable_session(&ctx) {
            match self.send_via_session(&ctx.message, &session).await {
                Ok(()) => {
                    debug!(message_id = %message_id, session_id = %session.id, "sent on session");
                    return Ok(SendStatus::SentToSession);
                }
                Err(err) => {
                    warn!(message_id = %message_id, session_id = %session.id, error = %err, "session send failed; trying services")
                }
            }
        }

        let connection = ctx.connection.as_ref().ok_or_else(|| {
            AgentError::ProtocolViolation(format!(
                "message {message_id} has no connection, service or usable session"
            ))
        })?;

        let our_doc = self.resolver.resolve(&connection.did).await?;
        let sender_key = *our_doc.authentication.first().ok_or_else(|| {
            AgentError::ProtocolViolation(format!("DID document {} has no authentication keys", our_doc.id))
        })?;

        let (services, queue_service) = self.resolve_services(connection, ctx.out_of_band.as_ref()).await?;
        if self.transports.read().is_empty() && queue_service.is_none() {
            return Err(AgentError::Transport("no outbound transports registered".into()));
        }
        let services = match priority {
            Some(priority) => priority.apply(services),
            None => services,
        };

        let mut message = ctx.message.clone();
        if !our_doc.has_inbound_endpoint() && !message.has_any_return_route() {
            message.set_return_route(ReturnRoute::All);
        }

        let mut failures = Vec::new();
        for service in &services {
            let keys = EnvelopeKeys {
                recipient_keys: service.recipient_keys.clone(),
                routing_keys: service.routing_keys.clone(),
                sender_key: Some(sender_key),
            };
            match self.send_to_service(&message, service, &keys, Some(&connection.id)).await {
                Ok(()) => return Ok(SendStatus::SentToTransport),
                Err(err) => {
                    debug!(message_id = %message_id, endpoint = %service.service_endpoint, error = %err, "service attempt failed");
                    failures.push(format!("{}: {err}", service.service_endpoint));
                }
            }
        }

        if let Some(queue_service) = queue_service.filter(|_| ctx.allow_queue) {
            let keys = EnvelopeKeys {
                recipient_keys: queue_service.recipient_keys.clone(),
                routing_keys: queue_service.routing_keys.clone(),
                sender_key: Some(sender_key),
            };
            let envelope = self.codec.pack(&message, &keys)?;
            let recipient_dids: Vec<String> =
                queue_service.recipient_keys.iter().map(PublicKey::to_did_key).collect();
            self.enqueue(&connection.id, &recipient_dids, &envelope).await?;
            debug!(message_id = %message_id, connection_id = %connection.id, "queued for pickup");
            return Ok(SendStatus::QueuedForPickup);
        }

        Err(AgentError::Undeliverable {
            message_id,
            reason: if failures.is_empty() {
                "no service with a supported transport".into()
            } else {
                failures.join("; ")
            },
        })
    }

    /// Deliver an already packed envelope to `connection`; used for
    /// mediator direct delivery.
    pub async fn send_package(
        &self,
        connection: &ConnectionRecord,
        envelope: EncryptedMessage,
        recipient_key: Option<&PublicKey>,
    ) -> Result<SendStatus, AgentError> {
        if let Some(session) = self
            .sessions
            .find_by_connection_id(&connection.id)
            .filter(|s| s.has_return_route())
        {
            match session.send(&envelope).await {
                Ok(()) => return Ok(SendStatus::SentToSession),
                Err(err) => {
                    warn!(connection_id = %connection.id, session_id = %session.id, error = %err, "session send failed")
                }
            }
        }

        let (services, queue_service) = self.resolve_services(connection, None).await?;
        let mut failures = Vec::new();
        for service in &services {
            let Some(transport) = self.transport_for(&service.scheme()) else {
                continue;
            };
            let package = OutboundPackage {
                payload: envelope.clone(),
                endpoint: service.service_endpoint.clone(),
                connection_id: Some(connection.id.clone()),
                response_requested: false,
            };
            match transport.send_message(package).await {
                Ok(()) => return Ok(SendStatus::SentToTransport),
                Err(err) => failures.push(format!("{}: {err}", service.service_endpoint)),
            }
        }

        if queue_service.is_some() {
            let recipient_dids: Vec<String> = recipient_key.map(|k| vec![k.to_did_key()]).unwrap_or_default();
            self.enqueue(&connection.id, &recipient_dids, &envelope).await?;
            return Ok(SendStatus::QueuedForPickup);
        }

        Err(AgentError::Undeliverable {
            message_id: "<packed>".into(),
            reason: if failures.is_empty() {
                format!("no reachable service for connection {}", connection.id)
            } else {
                failures.join("; ")
            },
        })
    }

    async fn enqueue(
        &self,
        connection_id: &str,
        recipient_dids: &[String],
        envelope: &EncryptedMessage,
    ) -> Result<String, AgentError> {
        let message_id = self.queue.add_message(connection_id, recipient_dids, envelope).await?;
        self.events.emit(AgentEvent::MessageQueued {
            connection_id: connection_id.to_string(),
            message_id: message_id.clone(),
        });
        Ok(message_id)
    }

    /// The named session, or the connection's newest one, when the last
    /// inbound message on it allows a reply on this thread.
    fn usable_session(&self, ctx: &OutboundMessageContext) -> Option<Arc<TransportSession>> {
        let session = ctx
            .session_id
            .as_deref()
            .and_then(|id| self.sessions.find_by_id(id))
            .or_else(|| {
                ctx.connection
                    .as_ref()
                    .and_then(|c| self.sessions.find_by_connection_id(&c.id))
            })?;
        if session.keys().is_some() && session.allows_return_route(ctx.message.thread_id()) {
            Some(session)
        } else {
            debug!(session_id = %session.id, "session has no return route for this thread");
            None
        }
    }

    async fn send_via_session(&self, message: &AgentMessage, session: &TransportSession) -> Result<(), AgentError> {
        let keys = session
            .keys()
            .ok_or_else(|| AgentError::Transport(format!("session {} has no keys", session.id)))?;
        let envelope = self.codec.pack(message, &keys)?;
        session.send(&envelope).await
    }

    async fn send_to_service(
        &self,
        message: &AgentMessage,
        service: &DidCommService,
        keys: &EnvelopeKeys,
        connection_id: Option<&str>,
    ) -> Result<(), AgentError> {
        let scheme = service.scheme();
        let transport = self
            .transport_for(&scheme)
            .ok_or_else(|| AgentError::Transport(format!("no outbound transport for scheme {scheme:?}")))?;
        let payload = self.codec.pack(message, keys)?;
        debug!(endpoint = %service.service_endpoint, "sending to service");
        transport
            .send_message(OutboundPackage {
                payload,
                endpoint: service.service_endpoint.clone(),
                connection_id: connection_id.map(String::from),
                response_requested: message.has_any_return_route(),
            })
            .await
    }

    /// Delivery services for the peer, with the queue pseudo-service split
    /// out.
    async fn resolve_services(
        &self,
        connection: &ConnectionRecord,
        out_of_band: Option<&OutOfBandRecord>,
    ) -> Result<(Vec<DidCommService>, Option<DidCommService>), AgentError> {
        let mut all = Vec::new();
        if let Some(their_did) = &connection.their_did {
            all = self.resolver.resolve(their_did).await?.didcomm_services();
        } else if let Some(out_of_band) = out_of_band {
            for service in &out_of_band.services {
                match service {
                    OutOfBandService::Inline(service) => all.push(service.clone()),
                    OutOfBandService::Did(did) => all.extend(self.resolver.resolve(did).await?.didcomm_services()),
                }
            }
        } else {
            return Err(AgentError::ProtocolViolation(format!(
                "connection {} has neither a peer DID nor out-of-band services",
                connection.id
            )));
        }

        let (queue, services): (Vec<_>, Vec<_>) = all.into_iter().partition(DidCommService::is_queue);
        Ok((services, queue.into_iter().next()))
    }
}
