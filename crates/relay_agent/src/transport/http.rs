//! HTTP(S) outbound transport: one POST per message.

use async_trait::async_trait;
use relay_proto::EncryptedMessage;
use tracing::{debug, warn};

use super::{OutboundPackage, OutboundTransport};
use crate::{
    error::AgentError,
    events::{EventBus, InboundEnvelope},
};

pub const DIDCOMM_CONTENT_TYPE: &str = "application/didcomm-envelope-enc";

pub struct HttpOutboundTransport {
    client: reqwest::Client,
    events: EventBus,
}

impl HttpOutboundTransport {
    pub fn new(events: EventBus) -> Result<Self, AgentError> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("relay-agent/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client, events })
    }
}

#[async_trait]
impl OutboundTransport for HttpOutboundTransport {
    fn supported_schemes(&self) -> &[&'static str] {
        &["http", "https"]
    }

    async fn start(&self) -> Result<(), AgentError> {
        Ok(())
    }

    async fn stop(&self) -> Result<(), AgentError> {
        Ok(())
    }

    async fn send_message(&self, package: OutboundPackage) -> Result<(), AgentError> {
        let body = package.payload.to_bytes()?;
        debug!(endpoint = %package.endpoint, bytes = body.len(), "http send");

        let res = self
            .client
            .post(&package.endpoint)
            .header(reqwest::header::CONTENT_TYPE, DIDCOMM_CONTENT_TYPE)
            .body(body)
            .send()
            .await
            .map_err(|e| AgentError::Delivery {
                endpoint: package.endpoint.clone(),
                reason: e.to_string(),
            })?;

        if !res.status().is_success() {
            return Err(AgentError::Delivery {
                endpoint: package.endpoint,
                reason: format!("status {}", res.status()),
            });
        }

        // A return-routed reply rides on the response body.
        let bytes = res.bytes().await?;
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(());
        }
        match EncryptedMessage::from_slice(&bytes) {
            Ok(envelope) => {
                self.events
                    .deliver_inbound(InboundEnvelope {
                        envelope,
                        session_id: None,
                        connection_id: package.connection_id,
                    })
                    .await?
            }
            Err(err) => {
                warn!(endpoint = %package.endpoint, error = %err, "ignoring non-envelope response body")
            }
        }
        Ok(())
    }
}
