//! Caller-facing pickup operations.

use std::sync::Arc;
use std::time::Duration;

use relay_proto::{
    protocols::pickup::{v1, v2, v3, PickupVersion},
    AgentMessage, Attachment, EncryptedMessage, ReturnRoute,
};
use relay_store::{MessageQueueStore, QueueScope, QueuedMessage, TakeOptions};
use tracing::{debug, warn};

use super::session::{MessagePickupSession, PickupRole, PickupSessionService};
use crate::{
    config::AgentConfig,
    connection::{ConnectionRecord, ConnectionService},
    dispatcher::OutboundDispatcher,
    error::AgentError,
    events::{AgentEvent, EventBus},
    outbound::{OutboundMessageContext, SendStatus, TransportPriority},
    transport::TransportSessionRegistry,
};

/// One recipient-side pickup round.
#[derive(Debug, Clone)]
pub struct PickupRequest {
    pub connection_id: String,
    pub protocol: PickupVersion,
    /// Recipient key (2.0) or DID (3.0) to scope the mailbox to.
    pub recipient: Option<String>,
    /// 1.0 batch size; defaults to the configured maximum.
    pub batch_size: Option<usize>,
    /// Wait for [`AgentEvent::MessagePickupCompleted`].
    pub await_completion: bool,
    pub timeout: Option<Duration>,
    pub transport_priority: Option<TransportPriority>,
}

impl PickupRequest {
    pub fn new(connection_id: impl Into<String>, protocol: PickupVersion) -> Self {
        Self {
            connection_id: connection_id.into(),
            protocol,
            recipient: None,
            batch_size: None,
            await_completion: false,
            timeout: None,
            transport_priority: None,
        }
    }

    pub fn awaiting_completion(mut self, timeout: Option<Duration>) -> Self {
        self.await_completion = true;
        self.timeout = timeout;
        self
    }
}

pub struct MessagePickupApi {
    queue: Arc<dyn MessageQueueStore>,
    sessions: Arc<TransportSessionRegistry>,
    live: Arc<PickupSessionService>,
    dispatcher: Arc<OutboundDispatcher>,
    connections: Arc<dyn ConnectionService>,
    events: EventBus,
    config: Arc<AgentConfig>,
}

impl MessagePickupApi {
    pub fn new(
        queue: Arc<dyn MessageQueueStore>,
        sessions: Arc<TransportSessionRegistry>,
        live: Arc<PickupSessionService>,
        dispatcher: Arc<OutboundDispatcher>,
        connections: Arc<dyn ConnectionService>,
        events: EventBus,
        config: Arc<AgentConfig>,
    ) -> Self {
        Self {
            queue,
            sessions,
            live,
            dispatcher,
            connections,
            events,
            config,
        }
    }

    pub(crate) fn dispatcher(&self) -> &Arc<OutboundDispatcher> {
        &self.dispatcher
    }

    pub(crate) fn connections(&self) -> &Arc<dyn ConnectionService> {
        &self.connections
    }

    pub(crate) fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// Enqueue for a recipient and, when it has a live session, push
    /// right away. A failed push leaves the message queued.
    pub async fn queue_message(
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

        if let Some(live) = self.get_live_mode_session(connection_id, PickupRole::MessageHolder) {
            if let Err(err) = self.deliver_messages_from_queue(&live, None).await {
                warn!(connection_id, error = %err, "live delivery failed; message stays queued");
            }
        }
        Ok(message_id)
    }

    pub fn get_live_mode_session(&self, connection_id: &str, role: PickupRole) -> Option<MessagePickupSession> {
        self.live.get_live_session(connection_id, Some(role))
    }

    /// Push `messages` over the live session. Delivered entries stay
    /// queued until the recipient acknowledges them.
    pub async fn deliver_messages(
        &self,
        live: &MessagePickupSession,
        messages: &[QueuedMessage],
    ) -> Result<SendStatus, AgentError> {
        let connection = self.connections.get_by_id(&live.connection_id).await?;
        let attachments = messages
            .iter()
            .map(|m| Attachment::for_envelope(&m.id, m.received_at, &m.encrypted_message))
            .collect::<Result<Vec<_>, _>>()?;

        let message = match live.protocol_version {
            PickupVersion::V2 => AgentMessage::new(&v2::MessageDelivery {
                recipient_key: None,
                attachments,
            })?,
            PickupVersion::V3 => addressed(
                AgentMessage::new(&v3::MessageDelivery {
                    recipient_did: None,
                    attachments,
                })?,
                &connection,
            )?,
            PickupVersion::V1 => {
                return Err(AgentError::ProtocolViolation(
                    "messagepickup/1.0 has no live delivery".into(),
                ))
            }
        };
        debug!(connection_id = %connection.id, count = messages.len(), "live delivery");
        let ctx = OutboundMessageContext::for_connection(message, connection)
            .with_session(Some(live.transport_session_id.clone()))
            .without_queue();
        self.dispatcher.send_message(ctx, None).await
    }

    /// Take up to the holder maximum and push it. Returns how many were
    /// sent.
    pub async fn deliver_messages_from_queue(
        &self,
        live: &MessagePickupSession,
        recipient_did: Option<String>,
    ) -> Result<usize, AgentError> {
        let scope = match live.protocol_version {
            PickupVersion::V3 => {
                let did = match recipient_did {
                    Some(did) => did,
                    None => self
                        .connections
                        .get_by_id(&live.connection_id)
                        .await?
                        .their_did
                        .ok_or_else(|| {
                            AgentError::ProtocolViolation(format!(
                                "connection {} has no peer DID to scope 3.0 delivery",
                                live.connection_id
                            ))
                        })?,
                };
                QueueScope::connection(&live.connection_id).with_recipient_did(Some(did))
            }
            _ => QueueScope::connection(&live.connection_id).with_recipient_did(recipient_did),
        };
        let messages = self
            .queue
            .take_from_queue(TakeOptions {
                scope,
                limit: Some(self.config.maximum_message_pickup),
                delete_messages: false,
            })
            .await?;
        if messages.is_empty() {
            return Ok(0);
        }
        self.deliver_messages(live, &messages).await?;
        Ok(messages.len())
    }

    /// Start a pickup round with the mediator on `request.connection_id`.
    pub async fn pickup_messages(&self, request: PickupRequest) -> Result<(), AgentError> {
        let connection = self.connections.get_by_id(&request.connection_id).await?;
        connection.assert_ready()?;

        let message = match request.protocol {
            PickupVersion::V1 => AgentMessage::new(&v1::BatchPickup {
                batch_size: request.batch_size.unwrap_or(self.config.maximum_message_pickup),
            })?,
            PickupVersion::V2 => AgentMessage::new(&v2::StatusRequest {
                recipient_key: request.recipient.clone(),
            })?,
            PickupVersion::V3 => addressed(
                AgentMessage::new(&v3::StatusRequest {
                    recipient_did: request.recipient.clone(),
                })?,
                &connection,
            )?,
        };

        let waiter = request.await_completion.then(|| {
            let connection_id = connection.id.clone();
            self.events.waiter(format!("pickup completion on {connection_id}"), move |event| match event {
                AgentEvent::MessagePickupCompleted { connection_id: done, .. } if *done == connection_id => Some(()),
                _ => None,
            })
        });

        let ctx = OutboundMessageContext::for_connection(message, connection).without_queue();
        self.dispatcher.send_message(ctx, request.transport_priority).await?;

        if let Some(waiter) = waiter {
            waiter
                .wait(request.timeout.unwrap_or_else(|| self.config.pickup_timeout()))
                .await?;
        }
        Ok(())
    }

    /// Ask the mediator to start or stop pushing. Sent over a WebSocket,
    /// which is mandatory when enabling.
    pub async fn set_live_delivery_mode(
        &self,
        connection_id: &str,
        protocol: PickupVersion,
        live_delivery: bool,
    ) -> Result<SendStatus, AgentError> {
        let connection = self.connections.get_by_id(connection_id).await?;
        connection.assert_ready()?;

        let mut message = match protocol {
            PickupVersion::V2 => AgentMessage::new(&v2::LiveDeliveryChange { live_delivery })?,
            PickupVersion::V3 => addressed(AgentMessage::new(&v3::LiveDeliveryChange { live_delivery })?, &connection)?,
            PickupVersion::V1 => {
                return Err(AgentError::ProtocolViolation(
                    "messagepickup/1.0 has no live delivery".into(),
                ))
            }
        };
        message.set_return_route(ReturnRoute::All);

        let priority = TransportPriority::new(["wss", "ws"], live_delivery);
        let ctx = OutboundMessageContext::for_connection(message, connection).without_queue();
        let status = self.dispatcher.send_message(ctx, Some(priority)).await?;

        if !live_delivery {
            self.live.remove_live_session(connection_id);
        } else if let Some(session) = self.sessions.find_by_connection_id(connection_id) {
            self.live
                .save_live_session(connection_id, &session.id, protocol, PickupRole::Recipient);
        }
        Ok(status)
    }
}

/// Set 3.0 addressing: from us to the peer.
pub(crate) fn addressed(mut message: AgentMessage, connection: &ConnectionRecord) -> Result<AgentMessage, AgentError> {
    let their_did = connection.their_did.clone().ok_or_else(|| {
        AgentError::ProtocolViolation(format!("connection {} has no peer DID for 3.0 addressing", connection.id))
    })?;
    message.from = Some(connection.did.clone());
    message.to = Some(vec![their_did]);
    Ok(message)
}
