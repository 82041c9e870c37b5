//! coordinate-mediation: both roles.
//!
//! A record moves `Requested → Granted | Denied` and never leaves a
//! terminal state. Keylist updates are only legal on `Granted` records.

pub mod handlers;
pub mod mediator;
pub mod recipient;

use relay_crypto::PublicKey;
use serde::{Deserialize, Serialize};

pub use handlers::{MediationRecipientHandler, MediatorHandler};
pub use mediator::MediatorService;
pub use recipient::MediationRecipientService;

/// Where peers should send messages for one of our keys.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Routing {
    pub endpoints: Vec<String>,
    pub recipient_key: PublicKey,
    /// Outermost hop last.
    pub routing_keys: Vec<PublicKey>,
    pub mediator_id: Option<String>,
}

/// Key encoding for mediation message bodies.
pub(crate) fn encode_key(key: &PublicKey, did_key: bool) -> String {
    if did_key {
        key.to_did_key()
    } else {
        key.to_base58()
    }
}
