//! messagepickup/3.0: the 2.0 exchange, addressed by DID. Every message
//! must carry `from` and `to`; replies swap them.
//!
//! A holder only serves the DID bound to the inbound connection, and only
//! from that connection's mailbox.

use std::sync::Arc;

use async_trait::async_trait;
use relay_proto::{
    protocols::{
        pickup::{
            v3::{DeliveryRequest, LiveDeliveryChange, MessageDelivery, MessagesReceived, Status, StatusRequest},
            PickupVersion,
        },
        problem_report::codes,
    },
    Attachment, MessageBody,
};
use relay_store::{MessageQueueStore, QueueScope, TakeOptions};
use tracing::debug;

use super::{
    session::{PickupRole, PickupSessionService},
    v2::unpack_attachments,
};
use crate::{
    config::AgentConfig,
    connection::ConnectionRecord,
    error::AgentError,
    events::{AgentEvent, EventBus},
    handler::MessageHandler,
    inbound::InboundMessageContext,
    outbound::OutboundMessageContext,
};

/// Sender and first recipient DID of an inbound 3.0 message.
struct Addressing {
    from: String,
    to: String,
}

fn addressing(ctx: &InboundMessageContext) -> Result<Addressing, AgentError> {
    let from = ctx.message.from.clone().filter(|f| !f.is_empty());
    let to = ctx.message.to.as_ref().and_then(|to| to.first()).cloned();
    match (from, to) {
        (Some(from), Some(to)) => Ok(Addressing { from, to }),
        _ => Err(AgentError::problem(
            codes::MISSING_ADDRESSING,
            format!("{} requires both from and to", ctx.message.message_type),
        )),
    }
}

/// Mailbox a holder may open for this message: the connection's own queue,
/// narrowed to `recipient_did` (or the sender). `from` must be the DID the
/// connection was established with.
fn holder_scope<'a>(
    ctx: &'a InboundMessageContext,
    addressing: &Addressing,
    recipient_did: Option<&str>,
) -> Result<(&'a ConnectionRecord, QueueScope), AgentError> {
    let connection = ctx.assert_ready_connection()?;
    if connection.their_did.as_deref() != Some(addressing.from.as_str()) {
        return Err(AgentError::problem(
            codes::UNAUTHORIZED_SENDER,
            format!("{} is not the peer of connection {}", addressing.from, connection.id),
        ));
    }
    let did = recipient_did.unwrap_or(&addressing.from).to_string();
    Ok((connection, QueueScope::connection(&connection.id).with_recipient_did(Some(did))))
}

/// Reply on the inbound thread with `from`/`to` swapped.
fn reply<B: MessageBody>(
    ctx: &InboundMessageContext,
    addressing: &Addressing,
    body: &B,
) -> Result<OutboundMessageContext, AgentError> {
    let mut reply = ctx.reply(body)?;
    reply.message.from = Some(addressing.to.clone());
    reply.message.to = Some(vec![addressing.from.clone()]);
    Ok(reply)
}

pub struct PickupV3 {
    queue: Arc<dyn MessageQueueStore>,
    live: Arc<PickupSessionService>,
    events: EventBus,
    config: Arc<AgentConfig>,
}

impl PickupV3 {
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

    // ── Message holder ───────────────────────────────────────────────────────

    pub async fn process_status_request(&self, ctx: &InboundMessageContext) -> Result<OutboundMessageContext, AgentError> {
        let addressing = addressing(ctx)?;
        let request: StatusRequest = ctx.message.body()?;
        let (connection, scope) = holder_scope(ctx, &addressing, request.recipient_did.as_deref())?;
        let message_count = self.queue.get_available_message_count(&scope).await?;
        let live = self
            .live
            .get_live_session(&connection.id, Some(PickupRole::MessageHolder))
            .is_some();

        reply(
            ctx,
            &addressing,
            &Status {
                message_count,
                recipient_did: request.recipient_did,
                live_delivery: Some(live),
            },
        )
    }

    pub async fn process_delivery_request(
        &self,
        ctx: &InboundMessageContext,
    ) -> Result<OutboundMessageContext, AgentError> {
        let addressing = addressing(ctx)?;
        let request: DeliveryRequest = ctx.message.body()?;
        let (_, scope) = holder_scope(ctx, &addressing, request.recipient_did.as_deref())?;
        let limit = request.limit.min(self.config.maximum_message_pickup);

        let messages = self
            .queue
            .take_from_queue(TakeOptions {
                scope,
                limit: Some(limit),
                delete_messages: false,
            })
            .await?;
        debug!(from = %addressing.from, count = messages.len(), limit, "3.0 delivery");

        if messages.is_empty() {
            return reply(
                ctx,
                &addressing,
                &Status {
                    message_count: 0,
                    recipient_did: request.recipient_did,
                    live_delivery: None,
                },
            );
        }
        let attachments = messages
            .iter()
            .map(|m| Attachment::for_envelope(&m.id, m.received_at, &m.encrypted_message))
            .collect::<Result<Vec<_>, _>>()?;
        reply(
            ctx,
            &addressing,
            &MessageDelivery {
                recipient_did: request.recipient_did,
                attachments,
            },
        )
    }

    pub async fn process_messages_received(
        &self,
        ctx: &InboundMessageContext,
    ) -> Result<OutboundMessageContext, AgentError> {
        let addressing = addressing(ctx)?;
        let received: MessagesReceived = ctx.message.body()?;
        let (_, scope) = holder_scope(ctx, &addressing, None)?;
        self.queue.remove_messages(&scope, &received.message_id_list).await?;
        let message_count = self.queue.get_available_message_count(&scope).await?;

        reply(
            ctx,
            &addressing,
            &Status {
                message_count,
                recipient_did: None,
                live_delivery: None,
            },
        )
    }

    pub async fn process_live_delivery_change(
        &self,
        ctx: &InboundMessageContext,
    ) -> Result<OutboundMessageContext, AgentError> {
        let addressing = addressing(ctx)?;
        let (connection, scope) = holder_scope(ctx, &addressing, None)?;
        let change: LiveDeliveryChange = ctx.message.body()?;
        let Some(session_id) = ctx.session_id.as_deref() else {
            return Err(AgentError::problem(
                codes::INVALID_STATE,
                "Live delivery requires a persistent transport session",
            ));
        };

        if change.live_delivery {
            self.live
                .save_live_session(&connection.id, session_id, PickupVersion::V3, PickupRole::MessageHolder);
        } else {
            self.live.remove_live_session(&connection.id);
        }
        let message_count = self.queue.get_available_message_count(&scope).await?;
        reply(
            ctx,
            &addressing,
            &Status {
                message_count,
                recipient_did: None,
                live_delivery: Some(change.live_delivery),
            },
        )
    }

    // ── Recipient ────────────────────────────────────────────────────────────

    pub async fn process_status(&self, ctx: &InboundMessageContext) -> Result<Option<OutboundMessageContext>, AgentError> {
        let addressing = addressing(ctx)?;
        let connection = ctx.assert_ready_connection()?;
        let status: Status = ctx.message.body()?;
        if status.message_count == 0 {
            self.events.emit(AgentEvent::MessagePickupCompleted {
                connection_id: connection.id.clone(),
                thread_id: Some(ctx.message.thread_id().to_string()),
            });
            return Ok(None);
        }
        let request = reply(
            ctx,
            &addressing,
            &DeliveryRequest {
                limit: status.message_count.min(self.config.maximum_message_pickup),
                recipient_did: status.recipient_did,
            },
        )?;
        Ok(Some(request.without_queue()))
    }

    pub async fn process_delivery(&self, ctx: &InboundMessageContext) -> Result<OutboundMessageContext, AgentError> {
        let addressing = addressing(ctx)?;
        let delivery: MessageDelivery = ctx.message.body()?;
        if delivery.attachments.is_empty() {
            return Err(AgentError::problem(
                codes::ERROR_PROCESSING_ATTACHMENTS,
                "Delivery contains no attachments",
            ));
        }
        let message_id_list = unpack_attachments(&self.events, &delivery.attachments).await;
        Ok(reply(ctx, &addressing, &MessagesReceived { message_id_list })?.without_queue())
    }
}

#[async_trait]
impl MessageHandler for PickupV3 {
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
