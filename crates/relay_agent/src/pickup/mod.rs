//! Message pickup: a recipient retrieving what its mediator queued.
//!
//! Three wire-incompatible versions are handled:
//! - 1.0 batch: the holder deletes on delivery
//! - 2.0 status/delivery: entries stay queued until acknowledged
//! - 3.0: 2.0 addressed by DID
//!
//! [`strategy::initiate_message_pickup`] drives the recipient side by
//! polling or by holding a live session open with
//! [`backoff::ReconnectBackoffManager`].

pub mod api;
pub mod backoff;
pub mod session;
pub mod strategy;
pub mod v1;
pub mod v2;
pub mod v3;

pub use api::{MessagePickupApi, PickupRequest};
pub use backoff::{Backoff, BackoffPolicy, ReconnectAction, ReconnectBackoffManager};
pub use session::{MessagePickupSession, PickupRole, PickupSessionService};
pub use strategy::initiate_message_pickup;
pub use v1::PickupV1;
pub use v2::PickupV2;
pub use v3::PickupV3;
