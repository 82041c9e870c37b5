//! messagepickup/2.0: status, delivery-request, messages-received and
//! live-delivery-change. Delivered messages stay queued until the
//! recipient lists them in `messages-received`.

use std::sync::Arc;

use async_trait::async_trait;
use relay_crypto::PublicKey;
use relay_proto::{
    protocols::{
        pickup::{
            v2::{DeliveryRequest, LiveDeliveryChange, MessageDelivery, MessagesReceived, Status, StatusRequest},
            PickupVersion,
        },
        problem_report::codes,
    },
    Attachment, MessageBody,
};
use relay_store::{MessageQueueStore, QueueScope, TakeOptions};
use tracing::{debug, warn};

use super::session::{PickupRole, PickupSessionService};
use crate::{
    config::AgentConfig,
    error::AgentError,
    events::{AgentEvent, EventBus, InboundEnvelope},
    handler::MessageHandler,
    inbound::InboundMessageContext,
    outbound::OutboundMessageContext,
};

pub struct PickupV2 {
    queue: Arc<dyn MessageQueueStore>,
    live: Arc<PickupSessionService>,
    events: EventBus,
    config: Arc<AgentConfig>,
}

impl PickupV2 {
    pub fn new(
        queue: Arc<dyn MessageQueueStore>,
        live: Arc<PickupSessionService>,
        events: EventBus,
        config: Arc<AgentConfig>,
    ) -> Self {
        Self {
            queue,
            live,
            events,
            config,
        }
    }

    /// The connection's mailbox, optionally narrowed to one recipient key.
    fn scope(connection_id: &str, recipient_key: Option<&str>) -> Result<QueueScope, AgentError> {
        let recipient_did = recipient_key
            .map(|k| PublicKey::parse(k).map(|k| k.to_did_key()))
            .transpose()?;
        Ok(QueueScope::connection(connection_id).with_recipient_did(recipient_did))
    }

    // ── Message holder ───────────────────────────────────────────────────────

    pub async fn process_status_request(&self, ctx: &InboundMessageContext) -> Result<OutboundMessageContext, AgentError> {
        let connection = ctx.assert_ready_connection()?;
        let request: StatusRequest = ctx.message.body()?;
        let scope = Self::scope(&connection.id, request.recipient_key.as_deref())?;
        let message_count = self.queue.get_available_message_count(&scope).await?;
        let live = self
            .live
            .get_live_session(&connection.id, Some(PickupRole::MessageHolder))
            .is_some();

        ctx.reply(&Status {
            message_count,
            recipient_key: request.recipient_key,
            live_delivery: Some(live),
        })
    }

    /// Up to `min(limit, maximum)` messages as attachments, not deleted.
    /// An empty mailbox is answered with a zero status.
    pub async fn process_delivery_request(
        &self,
        ctx: &InboundMessageContext,
    ) -> Result<OutboundMessageContext, AgentError> {
        let connection = ctx.assert_ready_connection()?;
        let request: DeliveryRequest = ctx.message.body()?;
        let scope = Self::scope(&connection.id, request.recipient_key.as_deref())?;
        let limit = request.limit.min(self.config.maximum_message_pickup);

        let messages = self
            .queue
            .take_from_queue(TakeOptions {
                scope,
                limit: Some(limit),
                delete_messages: false,
            })
            .await?;
        debug!(connection_id = %connection.id, count = messages.len(), limit, "delivery");

        if messages.is_empty() {
            return ctx.reply(&Status {
                message_count: 0,
                recipient_key: request.recipient_key,
                live_delivery: None,
            });
        }
        let attachments = messages
            .iter()
            .map(|m| Attachment::for_envelope(&m.id, m.received_at, &m.encrypted_message))
            .collect::<Result<Vec<_>, _>>()?;
        ctx.reply(&MessageDelivery {
            recipient_key: request.recipient_key,
            attachments,
        })
    }

    pub async fn process_messages_received(
        &self,
        ctx: &InboundMessageContext,
    ) -> Result<OutboundMessageContext, AgentError> {
        let connection = ctx.assert_ready_connection()?;
        let received: MessagesReceived = ctx.message.body()?;
        let scope = QueueScope::connection(&connection.id);
        self.queue.remove_messages(&scope, &received.message_id_list).await?;
        let message_count = self.queue.get_available_message_count(&scope).await?;

        ctx.reply(&Status {
            message_count,
            recipient_key: None,
            live_delivery: None,
        })
    }

    /// Needs the inbound transport session: live delivery pushes over it.
    pub async fn process_live_delivery_change(
        &self,
        ctx: &InboundMessageContext,
    ) -> Result<OutboundMessageContext, AgentError> {
        let connection = ctx.assert_ready_connection()?;
        let change: LiveDeliveryChange = ctx.message.body()?;
        let Some(session_id) = ctx.session_id.as_deref() else {
            return Err(AgentError::problem(
                codes::INVALID_STATE,
                "Live delivery requires a persistent transport session",
            ));
        };

        if change.live_delivery {
            self.live
                .save_live_session(&connection.id, session_id, PickupVersion::V2, PickupRole::MessageHolder);
        } else {
            self.live.remove_live_session(&connection.id);
        }
        let message_count = self
            .queue
            .get_available_message_count(&QueueScope::connection(&connection.id))
            .await?;
        ctx.reply(&Status {
            message_count,
            recipient_key: None,
            live_delivery: Some(change.live_delivery),
        })
    }

    // ── Recipient ────────────────────────────────────────────────────────────

    /// Zero ends the round; otherwise request `min(count, maximum)`.
    pub async fn process_status(&self, ctx: &InboundMessageContext) -> Result<Option<OutboundMessageContext>, AgentError> {
        let connection = ctx.assert_ready_connection()?;
        let status: Status = ctx.message.body()?;
        if status.message_count == 0 {
            self.events.emit(AgentEvent::MessagePickupCompleted {
                connection_id: connection.id.clone(),
                thread_id: Some(ctx.message.thread_id().to_string()),
            });
            return Ok(None);
        }
        let reply = ctx.reply(&DeliveryRequest {
            limit: status.message_count.min(self.config.maximum_message_pickup),
            recipient_key: status.recipient_key,
        })?;
        Ok(Some(reply.without_queue()))
    }

    pub async fn process_delivery(&self, ctx: &InboundMessageContext) -> Result<OutboundMessageContext, AgentError> {
        let connection = ctx.assert_ready_connection()?;
        let delivery: MessageDelivery = ctx.message.body()?;
        if delivery.attachments.is_empty() {
            return Err(AgentError::problem(
                codes::ERROR_PROCESSING_ATTACHMENTS,
                "Delivery contains no attachments",
            ));
        }

        let message_id_list = unpack_attachments(&self.events, &delivery.attachments).await;
        debug!(connection_id = %connection.id, count = message_id_list.len(), "delivery received");
        Ok(ctx.reply(&MessagesReceived { message_id_list })?.without_queue())
    }
}

/// Hand each attached envelope to the receive pipeline. Returns the ids to
/// acknowledge: every envelope the pipeline accepted plus every attachment
/// that holds no envelope at all. An envelope the pipeline refused stays
/// unacknowledged so the holder offers it again.
pub(crate) async fn unpack_attachments(events: &EventBus, attachments: &[Attachment]) -> Vec<String> {
    let mut acknowledged = Vec::with_capacity(attachments.len());
    for attachment in attachments {
        let Some(envelope) = attachment.envelope() else {
            warn!(attachment_id = %attachment.id, "attachment carries no envelope");
            acknowledged.push(attachment.id.clone());
            continue;
        };
        let inbound = InboundEnvelope {
            envelope,
            session_id: None,
            connection_id: None,
        };
        match events.deliver_inbound(inbound).await {
            Ok(()) => acknowledged.push(attachment.id.clone()),
            Err(err) => warn!(attachment_id = %attachment.id, error = %err, "delivered message not accepted"),
        }
    }
    acknowledged
}

#[async_trait]
impl MessageHandler for PickupV2 {
    fn supported(&self) -> Vec<&'static str> {
        vec![
            StatusRequest::MESSAGE_TYPE,
            DeliveryRequest::MESSAGE_TYPE,
            MessagesReceived::MESSAGE_TYPE,
            LiveDeliveryChange::MESSAGE_TYPE,
            Status::MESSAGE_TYPE,
            MessageDelivery::MESSAGE_TYPE,
        ]
    }

    async fn handle(&self, ctx: &InboundMessageContext) -> Result<Option<OutboundMessageContext>, AgentError> {
        let message = &ctx.message;
        let reply = if message.is::<StatusRequest>() {
            self.process_status_request(ctx).await?
        } else if message.is::<DeliveryRequest>() {
            self.process_delivery_request(ctx).await?
        } else if message.is::<MessagesReceived>() {
            self.process_messages_received(ctx).await?
        } else if message.is::<LiveDeliveryChange>() {
            self.process_live_delivery_change(ctx).await?
        } else if message.is::<Status>() {
            return self.process_status(ctx).await;
        } else {
            self.process_delivery(ctx).await?
        };
        Ok(Some(reply))
    }
}
