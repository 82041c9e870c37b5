use serde::{Deserialize, Serialize};

use crate::{envelope::EncryptedMessage, message::MessageBody};

pub const PROTOCOL: &str = "routing";

/// One relay hop: deliver `msg` to whoever holds `to`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Forward {
    /// Next recipient verkey (base58 or did:key).
    pub to: String,
    pub msg: EncryptedMessage,
}

impl MessageBody for Forward {
    const MESSAGE_TYPE: &'static str = "https://didcomm.org/routing/1.0/forward";
}
