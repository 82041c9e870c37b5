use std::sync::Arc;

use async_trait::async_trait;
use relay_proto::{
    protocols::{
        mediation::{KeylistUpdate, KeylistUpdateResponse, MediationDeny, MediationGrant, MediationRequest},
        routing::Forward,
    },
    MessageBody,
};

use super::{MediationRecipientService, MediatorService};
use crate::{
    error::AgentError, handler::MessageHandler, inbound::InboundMessageContext, outbound::OutboundMessageContext,
};

pub struct MediationRecipientHandler {
    service: Arc<MediationRecipientService>,
}

impl MediationRecipientHandler {
    pub fn new(service: Arc<MediationRecipientService>) -> Self {
        Self { service }
    }
}

#[async_trait]
impl MessageHandler for MediationRecipientHandler {
    fn supported(&self) -> Vec<&'static str> {
        vec![
            MediationGrant::MESSAGE_TYPE,
            MediationDeny::MESSAGE_TYPE,
            KeylistUpdateResponse::MESSAGE_TYPE,
        ]
    }

    async fn handle(&self, ctx: &InboundMessageContext) -> Result<Option<OutboundMessageContext>, AgentError> {
        let message = &ctx.message;
        if message.is::<MediationGrant>() {
            self.service.process_grant(ctx).await?;
        } else if message.is::<MediationDeny>() {
            self.service.process_deny(ctx).await?;
        } else if message.is::<KeylistUpdateResponse>() {
            self.service.process_keylist_update_results(ctx).await?;
        }
        Ok(None)
    }
}

pub struct MediatorHandler {
    service: Arc<MediatorService>,
}

impl MediatorHandler {
    pub fn new(service: Arc<MediatorService>) -> Self {
        Self { service }
    }
}

#[async_trait]
impl MessageHandler for MediatorHandler {
    fn supported(&self) -> Vec<&'static str> {
        vec![MediationRequest::MESSAGE_TYPE, KeylistUpdate::MESSAGE_TYPE, Forward::MESSAGE_TYPE]
    }

    async fn handle(&self, ctx: &InboundMessageContext) -> Result<Option<OutboundMessageContext>, AgentError> {
        let message = &ctx.message;
        if message.is::<MediationRequest>() {
            let (_record, grant) = self.service.process_mediation_request(ctx).await?;
            return Ok(grant);
        }
        if message.is::<KeylistUpdate>() {
            return Ok(Some(self.service.process_keylist_update_request(ctx).await?));
        }
        if message.is::<Forward>() {
            self.service.process_forward(ctx).await?;
        }
        Ok(None)
    }
}
