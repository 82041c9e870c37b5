//! relay_store: message queue and mediation record storage
//!
//! Two backends implement the same traits:
//! - in-memory (`InMemoryQueueStore`, `InMemoryMediationRepository`)
//! - SQLite (`SqliteStore`), with migrations in `migrations/` run on open
//!
//! Envelopes are stored as received; they are already end-to-end
//! encrypted, so the store adds no encryption of its own.

pub mod db;
pub mod error;
pub mod mediation;
pub mod models;
pub mod queue;

pub use db::SqliteStore;
pub use error::StoreError;
pub use mediation::{InMemoryMediationRepository, MediationRepository};
pub use models::{
    MediationRecord, MediationRole, MediationState, MediationStateError, QueueScope, QueuedMessage,
    QueuedMessageState, TakeOptions,
};
pub use queue::{InMemoryQueueStore, MessageQueueStore};
