//! relay_agent: outbound dispatch, mediation and message pickup
//!
//! An [`Agent`] wires the services together:
//! - [`dispatcher::OutboundDispatcher`] picks a session, a transport or the
//!   mediator queue for each outbound message
//! - [`receiver::MessageReceiver`] decrypts inbound envelopes and routes
//!   them to the registered [`handler::MessageHandler`]s
//! - [`mediation`] runs coordinate-mediation in both roles
//! - [`pickup`] runs the three message pickup versions and live delivery
//!
//! Services talk through the [`events::EventBus`]; background loops all
//! stop on one [`shutdown::Shutdown`] signal.

pub mod agent;
pub mod config;
pub mod connection;
pub mod did;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod handler;
pub mod inbound;
pub mod mediation;
pub mod outbound;
pub mod paths;
pub mod pickup;
pub mod problem_report;
pub mod receiver;
pub mod shutdown;
pub mod transport;
pub mod trust_ping;

pub use agent::{Agent, AgentDeps};
pub use config::{AgentConfig, Concurrency, ForwardingStrategy, PickupStrategy};
pub use connection::{ConnectionRecord, ConnectionService, ConnectionState, InMemoryConnectionService};
pub use did::{DidCommService, DidDocument, DidResolver, StaticDidResolver};
pub use dispatcher::OutboundDispatcher;
pub use error::AgentError;
pub use events::{AgentEvent, EventBus};
pub use inbound::InboundMessageContext;
pub use outbound::{OutboundMessageContext, SendStatus, TransportPriority};
pub use shutdown::Shutdown;
