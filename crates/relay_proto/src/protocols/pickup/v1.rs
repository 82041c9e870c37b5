use serde::{Deserialize, Serialize};

use crate::{envelope::EncryptedMessage, message::MessageBody};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchPickup {
    pub batch_size: usize,
}

impl MessageBody for BatchPickup {
    const MESSAGE_TYPE: &'static str = "https://didcomm.org/messagepickup/1.0/batch-pickup";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchMessage {
    pub id: String,
    pub message: EncryptedMessage,
}

/// Empty `messages` ends the pickup cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Batch {
    #[serde(rename = "messages~attach", default)]
    pub messages: Vec<BatchMessage>,
}

impl MessageBody for Batch {
    const MESSAGE_TYPE: &'static str = "https://didcomm.org/messagepickup/1.0/batch";
}
