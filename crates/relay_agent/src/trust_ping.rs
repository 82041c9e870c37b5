use async_trait::async_trait;
use relay_proto::{
    protocols::trust_ping::{TrustPing, TrustPingResponse},
    MessageBody,
};
use tracing::debug;

use crate::{
    error::AgentError, handler::MessageHandler, inbound::InboundMessageContext, outbound::OutboundMessageContext,
};

/// Answers `ping` with `ping_response` when asked to.
#[derive(Default)]
pub struct TrustPingHandler;

#[async_trait]
impl MessageHandler for TrustPingHandler {
    fn supported(&self) -> Vec<&'static str> {
        vec![TrustPing::MESSAGE_TYPE, TrustPingResponse::MESSAGE_TYPE]
    }

    async fn handle(&self, ctx: &InboundMessageContext) -> Result<Option<OutboundMessageContext>, AgentError> {
        if ctx.message.is::<TrustPingResponse>() {
            debug!(thread_id = %ctx.message.thread_id(), "ping response received");
            return Ok(None);
        }
        let ping: TrustPing = ctx.message.body()?;
        if !ping.response_requested {
            return Ok(None);
        }
        Ok(Some(ctx.reply(&TrustPingResponse::default())?))
    }
}
