//! messagepickup 1.0 / 2.0 / 3.0
//!
//! The three versions are wire-incompatible and live in separate modules.
//! 1.0 is batch-and-delete; 2.0 and 3.0 deliver as attachments and wait for
//! an explicit `messages-received` before deleting. 3.0 addresses the queue
//! by DID through the message-level `from`/`to` fields.

pub mod v1;
pub mod v2;
pub mod v3;

pub const PROTOCOL: &str = "messagepickup";

/// Wire-level pickup protocol version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum PickupVersion {
    V1,
    V2,
    V3,
}

impl PickupVersion {
    pub fn major(self) -> u32 {
        match self {
            PickupVersion::V1 => 1,
            PickupVersion::V2 => 2,
            PickupVersion::V3 => 3,
        }
    }
}

impl std::fmt::Display for PickupVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "messagepickup/{}.0", self.major())
    }
}
