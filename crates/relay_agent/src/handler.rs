//! Message handlers and the dispatch table keyed by
//! (protocol, major version, message name).

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use relay_proto::{MessageKey, MessageType};

use crate::{error::AgentError, inbound::InboundMessageContext, outbound::OutboundMessageContext};

#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Full type URIs this handler answers.
    fn supported(&self) -> Vec<&'static str>;

    /// An `Ok(Some(..))` response goes out through the dispatcher.
    async fn handle(&self, ctx: &InboundMessageContext) -> Result<Option<OutboundMessageContext>, AgentError>;
}

#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<MessageKey, Arc<dyn MessageHandler>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Later registrations win for overlapping types.
    pub fn register(&self, handler: Arc<dyn MessageHandler>) -> Result<(), AgentError> {
        let keys = handler
            .supported()
            .into_iter()
            .map(|uri| MessageType::parse(uri).map(|t| t.key()))
            .collect::<Result<Vec<_>, _>>()?;
        let mut handlers = self.handlers.write();
        for key in keys {
            handlers.insert(key, Arc::clone(&handler));
        }
        Ok(())
    }

    pub fn find(&self, message_type: &MessageType) -> Option<Arc<dyn MessageHandler>> {
        self.handlers.read().get(&message_type.key()).cloned()
    }

    pub fn supported_keys(&self) -> Vec<MessageKey> {
        self.handlers.read().keys().cloned().collect()
    }
}
