//! notification/1.0 problem-report

use serde::{Deserialize, Serialize};

use crate::message::MessageBody;

pub const PROTOCOL: &str = "notification";

/// Codes this layer emits.
pub mod codes {
    pub const MESSAGE_PARSE_FAILURE: &str = "message-parse-failure";
    pub const UNSUPPORTED_MESSAGE_TYPE: &str = "unsupported-message-type";
    pub const INVALID_STATE: &str = "request-not-accepted";
    pub const ERROR_PROCESSING_ATTACHMENTS: &str = "error-processing-attachments";
    pub const MISSING_ADDRESSING: &str = "missing-from-or-to";
    pub const NOT_MEDIATED: &str = "recipient-key-not-mediated";
    pub const UNAUTHORIZED_SENDER: &str = "unauthorized-sender";
    pub const INTERNAL: &str = "internal-error";
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProblemDescription {
    pub code: String,
    /// English text.
    pub en: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProblemReport {
    pub description: ProblemDescription,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub problem_items: Option<Vec<serde_json::Value>>,
}

impl ProblemReport {
    pub fn new(code: impl Into<String>, en: impl Into<String>) -> Self {
        Self {
            description: ProblemDescription {
                code: code.into(),
                en: en.into(),
            },
            problem_items: None,
        }
    }
}

impl MessageBody for ProblemReport {
    const MESSAGE_TYPE: &'static str = "https://didcomm.org/notification/1.0/problem-report";
}
