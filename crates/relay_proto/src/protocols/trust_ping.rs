use serde::{Deserialize, Serialize};

use crate::message::MessageBody;

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrustPing {
    #[serde(default = "default_true")]
    pub response_requested: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

impl MessageBody for TrustPing {
    const MESSAGE_TYPE: &'static str = "https://didcomm.org/trust_ping/1.0/ping";
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrustPingResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

impl MessageBody for TrustPingResponse {
    const MESSAGE_TYPE: &'static str = "https://didcomm.org/trust_ping/1.0/ping_response";
}
