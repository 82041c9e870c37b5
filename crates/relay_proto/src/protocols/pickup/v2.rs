use serde::{Deserialize, Serialize};

use crate::message::{Attachment, MessageBody};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatusRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient_key: Option<String>,
}

impl MessageBody for StatusRequest {
    const MESSAGE_TYPE: &'static str = "https://didcomm.org/messagepickup/2.0/status-request";
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Status {
    pub message_count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub live_delivery: Option<bool>,
}

impl MessageBody for Status {
    const MESSAGE_TYPE: &'static str = "https://didcomm.org/messagepickup/2.0/status";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryRequest {
    pub limit: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient_key: Option<String>,
}

impl MessageBody for DeliveryRequest {
    const MESSAGE_TYPE: &'static str = "https://didcomm.org/messagepickup/2.0/delivery-request";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageDelivery {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient_key: Option<String>,
    #[serde(rename = "~attach", default)]
    pub attachments: Vec<Attachment>,
}

impl MessageBody for MessageDelivery {
    const MESSAGE_TYPE: &'static str = "https://didcomm.org/messagepickup/2.0/delivery";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessagesReceived {
    pub message_id_list: Vec<String>,
}

impl MessageBody for MessagesReceived {
    const MESSAGE_TYPE: &'static str = "https://didcomm.org/messagepickup/2.0/messages-received";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiveDeliveryChange {
    pub live_delivery: bool,
}

impl MessageBody for LiveDeliveryChange {
    const MESSAGE_TYPE: &'static str = "https://didcomm.org/messagepickup/2.0/live-delivery-change";
}
