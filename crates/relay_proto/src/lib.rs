//! relay_proto: wire types, envelope codec and protocol messages
//!
//! # Modules
//! - `envelope`: encrypted wire envelope (what relays see)
//! - `message`: plaintext agent message, decorators, attachments
//! - `message_type`: type URI parsing and dispatch keys
//! - `codec`: pack/unpack, including forward wrapping per relay hop
//! - `protocols`: typed bodies for routing, mediation, pickup, ping,
//!   problem reports

pub mod codec;
pub mod envelope;
pub mod error;
pub mod message;
pub mod message_type;
pub mod protocols;

pub use codec::{DecryptedMessage, EnvelopeCodec, EnvelopeKeys};
pub use envelope::{EncryptedMessage, PackAlg};
pub use error::ProtoError;
pub use message::{AgentMessage, Attachment, MessageBody, ReturnRoute, ThreadDecorator, TransportDecorator};
pub use message_type::{MessageKey, MessageType};
