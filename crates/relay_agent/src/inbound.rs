use chrono::{DateTime, Utc};
use relay_crypto::PublicKey;
use relay_proto::{AgentMessage, MessageBody};

use crate::{connection::ConnectionRecord, error::AgentError, outbound::OutboundMessageContext};

/// A decrypted inbound message plus where it came from.
#[derive(Debug, Clone)]
pub struct InboundMessageContext {
    pub message: AgentMessage,
    pub sender_key: Option<PublicKey>,
    pub recipient_key: Option<PublicKey>,
    pub connection: Option<ConnectionRecord>,
    /// Transport session it arrived on, if any.
    pub session_id: Option<String>,
    pub received_at: DateTime<Utc>,
}

impl InboundMessageContext {
    pub fn new(message: AgentMessage) -> Self {
        Self {
            message,
            sender_key: None,
            recipient_key: None,
            connection: None,
            session_id: None,
            received_at: Utc::now(),
        }
    }

    pub fn with_connection(mut self, connection: ConnectionRecord) -> Self {
        self.connection = Some(connection);
        self
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn assert_ready_connection(&self) -> Result<&ConnectionRecord, AgentError> {
        let connection = self.connection.as_ref().ok_or_else(|| {
            AgentError::ProtocolViolation(format!(
                "no connection for inbound message {} ({})",
                self.message.id, self.message.message_type
            ))
        })?;
        connection.assert_ready()?;
        Ok(connection)
    }

    /// Reply on this message's thread, preferring the inbound session.
    pub fn reply<B: MessageBody>(&self, body: &B) -> Result<OutboundMessageContext, AgentError> {
        let message = AgentMessage::new(body)?.reply_to(&self.message);
        Ok(self.reply_with(message))
    }

    pub fn reply_with(&self, message: AgentMessage) -> OutboundMessageContext {
        OutboundMessageContext {
            connection: self.connection.clone(),
            session_id: self.session_id.clone(),
            ..OutboundMessageContext::new(message)
        }
    }
}
