//! coordinate-mediation/1.0

use serde::{Deserialize, Serialize};

use crate::message::MessageBody;

pub const PROTOCOL: &str = "coordinate-mediation";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MediationRequest {}

impl MessageBody for MediationRequest {
    const MESSAGE_TYPE: &'static str = "https://didcomm.org/coordinate-mediation/1.0/mediate-request";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediationGrant {
    pub endpoint: String,
    /// Either raw base58 verkeys or did:key, depending on the mediator.
    pub routing_keys: Vec<String>,
}

impl MessageBody for MediationGrant {
    const MESSAGE_TYPE: &'static str = "https://didcomm.org/coordinate-mediation/1.0/mediate-grant";
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MediationDeny {}

impl MessageBody for MediationDeny {
    const MESSAGE_TYPE: &'static str = "https://didcomm.org/coordinate-mediation/1.0/mediate-deny";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeylistUpdateAction {
    Add,
    Remove,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeylistUpdateResult {
    ClientError,
    ServerError,
    NoChange,
    Success,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeylistUpdateItem {
    pub recipient_key: String,
    pub action: KeylistUpdateAction,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeylistUpdate {
    pub updates: Vec<KeylistUpdateItem>,
}

impl MessageBody for KeylistUpdate {
    const MESSAGE_TYPE: &'static str = "https://didcomm.org/coordinate-mediation/1.0/keylist-update";
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeylistUpdated {
    pub recipient_key: String,
    pub action: KeylistUpdateAction,
    pub result: KeylistUpdateResult,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeylistUpdateResponse {
    pub updated: Vec<KeylistUpdated>,
}

impl MessageBody for KeylistUpdateResponse {
    const MESSAGE_TYPE: &'static str =
        "https://didcomm.org/coordinate-mediation/1.0/keylist-update-response";
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::AgentMessage;

    #[test]
    fn keylist_update_wire_shape() {
        let msg = AgentMessage::new(&KeylistUpdate {
            updates: vec![KeylistUpdateItem {
                recipient_key: "8HH5gYEeNc3z7PYXmd54d4x6qAfCNrqQqEB3nS7Zfu7K".into(),
                action: KeylistUpdateAction::Add,
            }],
        })
        .unwrap();
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["updates"][0]["action"], "add");

        let result = serde_json::to_value(KeylistUpdateResult::NoChange).unwrap();
        assert_eq!(result, "no_change");
    }
}
