//! Plaintext agent messages (inside the encrypted envelope).
//!
//! Every message has `@id` and `@type`, optional decorators (`~thread`,
//! `~transport`), optional `from`/`to` addressing, and a protocol-specific
//! body. Typed bodies implement [`MessageBody`] and are flattened into the
//! same JSON object.

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{envelope::EncryptedMessage, error::ProtoError, message_type::MessageType};

/// A typed protocol message body.
pub trait MessageBody: Serialize + DeserializeOwned {
    const MESSAGE_TYPE: &'static str;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentMessage {
    #[serde(rename = "@id")]
    pub id: String,

    #[serde(rename = "@type")]
    pub message_type: String,

    #[serde(rename = "~thread", default, skip_serializing_if = "Option::is_none")]
    pub thread: Option<ThreadDecorator>,

    #[serde(rename = "~transport", default, skip_serializing_if = "Option::is_none")]
    pub transport: Option<TransportDecorator>,

    /// Sender DID; required by messagepickup/3.0.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,

    /// Recipient DIDs; required by messagepickup/3.0.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<Vec<String>>,

    #[serde(flatten)]
    pub body: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadDecorator {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pthid: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReturnRoute {
    None,
    All,
    Thread,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportDecorator {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub return_route: Option<ReturnRoute>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub return_route_thread: Option<String>,
}

impl TransportDecorator {
    /// Whether a reply on thread `thread_id` may use the inbound session.
    pub fn allows_return_route(&self, thread_id: &str) -> bool {
        match self.return_route {
            Some(ReturnRoute::All) => true,
            Some(ReturnRoute::Thread) => self.return_route_thread.as_deref() == Some(thread_id),
            _ => false,
        }
    }

    pub fn has_any_return_route(&self) -> bool {
        matches!(self.return_route, Some(ReturnRoute::All) | Some(ReturnRoute::Thread))
    }
}

impl AgentMessage {
    /// Build a message with a fresh `@id` around a typed body.
    pub fn new<B: MessageBody>(body: &B) -> Result<Self, ProtoError> {
        let body = match serde_json::to_value(body)? {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                return Err(ProtoError::InvalidEnvelope(format!(
                    "message body must be a JSON object, got {other}"
                )))
            }
        };
        Ok(Self {
            id: uuid::Uuid::new_v4().to_string(),
            message_type: B::MESSAGE_TYPE.to_string(),
            thread: None,
            transport: None,
            from: None,
            to: None,
            body,
        })
    }

    pub fn parsed_type(&self) -> Result<MessageType, ProtoError> {
        MessageType::parse(&self.message_type)
    }

    /// True when this message's type matches `B`, ignoring minor version.
    pub fn is<B: MessageBody>(&self) -> bool {
        match (self.parsed_type(), MessageType::parse(B::MESSAGE_TYPE)) {
            (Ok(ours), Ok(theirs)) => ours.key() == theirs.key(),
            _ => false,
        }
    }

    /// Decode the typed body, checking the message type first.
    pub fn body<B: MessageBody>(&self) -> Result<B, ProtoError> {
        if !self.is::<B>() {
            return Err(ProtoError::UnexpectedMessageType {
                expected: B::MESSAGE_TYPE.to_string(),
                actual: self.message_type.clone(),
            });
        }
        Ok(serde_json::from_value(Value::Object(self.body.clone()))?)
    }

    /// `~thread.thid`, falling back to `@id` for thread-starting messages.
    pub fn thread_id(&self) -> &str {
        self.thread
            .as_ref()
            .and_then(|t| t.thid.as_deref())
            .unwrap_or(&self.id)
    }

    pub fn parent_thread_id(&self) -> Option<&str> {
        self.thread.as_ref().and_then(|t| t.pthid.as_deref())
    }

    pub fn with_thread_id(mut self, thid: impl Into<String>) -> Self {
        self.thread.get_or_insert_with(ThreadDecorator::default).thid = Some(thid.into());
        self
    }

    pub fn with_parent_thread_id(mut self, pthid: impl Into<String>) -> Self {
        self.thread.get_or_insert_with(ThreadDecorator::default).pthid = Some(pthid.into());
        self
    }

    /// Continue the thread of `other`.
    pub fn reply_to(self, other: &AgentMessage) -> Self {
        let thid = other.thread_id().to_string();
        self.with_thread_id(thid)
    }

    pub fn set_return_route(&mut self, route: ReturnRoute) {
        let thid = self.thread_id().to_string();
        let transport = self.transport.get_or_insert_with(TransportDecorator::default);
        transport.return_route = Some(route);
        transport.return_route_thread = (route == ReturnRoute::Thread).then_some(thid);
    }

    pub fn has_any_return_route(&self) -> bool {
        self.transport
            .as_ref()
            .map(TransportDecorator::has_any_return_route)
            .unwrap_or(false)
    }

    pub fn to_json(&self) -> Result<Vec<u8>, ProtoError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self, ProtoError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

// ── Attachments ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    #[serde(rename = "@id")]
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lastmod_time: Option<DateTime<Utc>>,
    pub data: AttachmentData,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AttachmentData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub json: Option<Value>,
}

impl Attachment {
    /// Wrap one queued envelope for a pickup delivery.
    pub fn for_envelope(
        id: impl Into<String>,
        received_at: DateTime<Utc>,
        envelope: &EncryptedMessage,
    ) -> Result<Self, ProtoError> {
        Ok(Self {
            id: id.into(),
            lastmod_time: Some(received_at),
            data: AttachmentData {
                json: Some(serde_json::to_value(envelope)?),
            },
        })
    }

    /// The envelope carried in `data.json`, if there is one.
    pub fn envelope(&self) -> Option<EncryptedMessage> {
        self.data
            .json
            .as_ref()
            .filter(|v| EncryptedMessage::looks_like(v))
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Ping {
        #[serde(default)]
        comment: Option<String>,
    }

    impl MessageBody for Ping {
        const MESSAGE_TYPE: &'static str = "https://didcomm.org/trust_ping/1.0/ping";
    }

    #[test]
    fn body_is_flattened_next_to_decorators() {
        let msg = AgentMessage::new(&Ping { comment: Some("hi".into()) })
            .unwrap()
            .with_thread_id("t-1");
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["comment"], "hi");
        assert_eq!(json["~thread"]["thid"], "t-1");
        assert_eq!(json["@type"], Ping::MESSAGE_TYPE);

        let back: AgentMessage = serde_json::from_value(json).unwrap();
        assert_eq!(back, msg);
        assert_eq!(back.body::<Ping>().unwrap().comment.as_deref(), Some("hi"));
    }

    #[test]
    fn thread_id_defaults_to_message_id() {
        let msg = AgentMessage::new(&Ping { comment: None }).unwrap();
        assert_eq!(msg.thread_id(), msg.id);
    }

    #[test]
    fn return_route_thread_is_scoped() {
        let mut msg = AgentMessage::new(&Ping { comment: None }).unwrap().with_thread_id("t-9");
        msg.set_return_route(ReturnRoute::Thread);
        let transport = msg.transport.clone().unwrap();
        assert!(transport.allows_return_route("t-9"));
        assert!(!transport.allows_return_route("t-10"));

        msg.set_return_route(ReturnRoute::All);
        assert!(msg.transport.unwrap().allows_return_route("anything"));
    }

    #[test]
    fn minor_version_does_not_matter() {
        let mut msg = AgentMessage::new(&Ping { comment: None }).unwrap();
        msg.message_type = "https://didcomm.org/trust_ping/1.3/ping".into();
        assert!(msg.is::<Ping>());
        msg.message_type = "https://didcomm.org/trust_ping/2.0/ping".into();
        assert!(msg.body::<Ping>().is_err());
    }
}
