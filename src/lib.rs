//! Event-sourced entities with per-entity actors, a pluggable journal, and
//! periodic snapshots.

mod actor;
pub use actor::EntityHandle;
mod command;
mod config;
mod entity;
pub use entity::{
    Behavior, CommandHandler, Effect, EntityContext, EventHandler, EventSourcedEntity,
    apply_event, decide, replay,
};
mod error;
mod event;
mod journal;
pub mod shopping_cart;
mod snapshot;
mod storage;
mod store;

pub use command::{CommandContext, CommandEnvelope};
pub use config::{DEFAULT_SNAPSHOT_EVERY, EntityConfig};
pub use error::{
    ActivationError, CommandError, ConfigError, DispatchError, JournalError, StateError,
};
pub use event::{EventMetadata, PersistedEvent, decode_event, encode_event, stream_uuid};
pub use journal::{FileJournal, InMemoryJournal, Journal};
pub use snapshot::{FileSnapshotStore, InMemorySnapshotStore, Snapshot, SnapshotStore};
pub use storage::StorageLayout;
pub use store::{EntityStore, EntityStoreBuilder, Registration};
