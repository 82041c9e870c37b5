//! Message type URIs: `<doc-uri>/<protocol>/<major>.<minor>/<name>`.

use std::fmt;

use crate::error::ProtoError;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MessageType {
    pub doc_uri: String,
    pub protocol_name: String,
    pub major: u32,
    pub minor: u32,
    pub message_name: String,
}

/// Dispatch key: protocol, major version and message name. Minor versions
/// and the doc URI are ignored so that older prefixes keep working.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MessageKey {
    pub protocol_name: String,
    pub major: u32,
    pub message_name: String,
}

impl MessageType {
    pub fn parse(uri: &str) -> Result<Self, ProtoError> {
        let invalid = || ProtoError::InvalidMessageType(uri.to_string());

        let mut parts = uri.rsplitn(4, '/');
        let message_name = parts.next().filter(|s| !s.is_empty()).ok_or_else(invalid)?;
        let version = parts.next().ok_or_else(invalid)?;
        let protocol_name = parts.next().filter(|s| !s.is_empty()).ok_or_else(invalid)?;
        let doc_uri = parts.next().ok_or_else(invalid)?;

        let (major, minor) = version.split_once('.').ok_or_else(invalid)?;
        Ok(Self {
            doc_uri: doc_uri.to_string(),
            protocol_name: protocol_name.to_string(),
            major: major.parse().map_err(|_| invalid())?,
            minor: minor.parse().map_err(|_| invalid())?,
            message_name: message_name.to_string(),
        })
    }

    /// `<doc-uri>/<protocol>/<major>.<minor>`
    pub fn protocol_uri(&self) -> String {
        format!("{}/{}/{}.{}", self.doc_uri, self.protocol_name, self.major, self.minor)
    }

    pub fn key(&self) -> MessageKey {
        MessageKey {
            protocol_name: self.protocol_name.clone(),
            major: self.major,
            message_name: self.message_name.clone(),
        }
    }

    /// Same protocol family and major version.
    pub fn same_protocol(&self, other: &MessageType) -> bool {
        self.protocol_name == other.protocol_name && self.major == other.major
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.protocol_uri(), self.message_name)
    }
}

impl MessageKey {
    pub fn new(protocol_name: &str, major: u32, message_name: &str) -> Self {
        Self {
            protocol_name: protocol_name.to_string(),
            major,
            message_name: message_name.to_string(),
        }
    }
}

impl fmt::Display for MessageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.protocol_name, self.major, self.message_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_https_and_legacy_prefixes() {
        let t = MessageType::parse("https://didcomm.org/messagepickup/2.0/delivery-request").unwrap();
        assert_eq!(t.doc_uri, "https://didcomm.org");
        assert_eq!(t.protocol_name, "messagepickup");
        assert_eq!((t.major, t.minor), (2, 0));
        assert_eq!(t.message_name, "delivery-request");

        let legacy =
            MessageType::parse("did:sov:BzCbsNYhMrjHiqZDTUASHg;spec/messagepickup/2.1/delivery-request").unwrap();
        assert_eq!(legacy.key(), t.key());
    }

    #[test]
    fn rejects_garbage() {
        assert!(MessageType::parse("forward").is_err());
        assert!(MessageType::parse("https://didcomm.org/routing/one/forward").is_err());
    }
}
