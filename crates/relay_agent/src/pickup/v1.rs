//! messagepickup/1.0: batch and delete.

use std::sync::Arc;

use async_trait::async_trait;
use relay_proto::{
    protocols::pickup::v1::{Batch, BatchMessage, BatchPickup},
    AgentMessage, MessageBody,
};
use relay_store::{MessageQueueStore, QueueScope, TakeOptions};
use tracing::debug;

use crate::{
    config::AgentConfig,
    error::AgentError,
    events::{AgentEvent, EventBus, InboundEnvelope},
    handler::MessageHandler,
    inbound::InboundMessageContext,
    outbound::OutboundMessageContext,
};

pub struct PickupV1 {
    queue: Arc<dyn MessageQueueStore>,
    events: EventBus,
    config: Arc<AgentConfig>,
}

impl PickupV1 {
    pub fn new(queue: Arc<dyn MessageQueueStore>, events: EventBus, config: Arc<AgentConfig>) -> Self {
        Self { queue, events, config }
    }

    /// Holder: hand out up to `min(batch_size, maximum)` messages, deleting
    /// them as part of the same take.
    pub async fn process_batch_pickup(&self, ctx: &InboundMessageContext) -> Result<OutboundMessageContext, AgentError> {
        let connection = ctx.assert_ready_connection()?;
        let request: BatchPickup = ctx.message.body()?;
        let limit = request.batch_size.min(self.config.maximum_message_pickup);

        let taken = self
            .queue
            .take_from_queue(TakeOptions {
                scope: QueueScope::connection(&connection.id),
                limit: Some(limit),
                delete_messages: true,
            })
            .await?;
        debug!(connection_id = %connection.id, count = taken.len(), limit, "batch");

        ctx.reply(&Batch {
            messages: taken
                .into_iter()
                .map(|m| BatchMessage {
                    id: m.id,
                    message: m.encrypted_message,
                })
                .collect(),
        })
    }

    /// Recipient: feed each message to the receiver. An empty batch ends
    /// the round; otherwise ask for the next one.
    pub async fn process_batch(&self, ctx: &InboundMessageContext) -> Result<Option<OutboundMessageContext>, AgentError> {
        let connection = ctx.assert_ready_connection()?;
        let batch: Batch = ctx.message.body()?;

        if batch.messages.is_empty() {
            self.events.emit(AgentEvent::MessagePickupCompleted {
                connection_id: connection.id.clone(),
                thread_id: Some(ctx.message.thread_id().to_string()),
            });
            return Ok(None);
        }

        for entry in batch.messages {
            // 1.0 batches are already deleted by the holder.
            self.events
                .deliver_inbound(InboundEnvelope {
                    envelope: entry.message,
                    session_id: None,
                    connection_id: None,
                })
                .await?;
        }
        let next = AgentMessage::new(&BatchPickup {
            batch_size: self.config.maximum_message_pickup,
        })?;
        Ok(Some(OutboundMessageContext::for_connection(next, connection.clone()).without_queue()))
    }
}

#[async_trait]
impl MessageHandler for PickupV1 {
    fn supported(&self) -> Vec<&'static str> {
        vec![BatchPickup::MESSAGE_TYPE, Batch::MESSAGE_TYPE]
    }

    async fn handle(&self, ctx: &InboundMessageContext) -> Result<Option<OutboundMessageContext>, AgentError> {
        if ctx.message.is::<BatchPickup>() {
            return Ok(Some(self.process_batch_pickup(ctx).await?));
        }
        self.process_batch(ctx).await
    }
}
