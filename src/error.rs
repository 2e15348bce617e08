//! Crate-level error types.

use std::path::PathBuf;

/// Error returned when a command sent to an entity does not produce a reply.
///
/// Generic over `R`, the entity's rejection type.
#[derive(Debug, thiserror::Error)]
pub enum CommandError<R: std::error::Error + Send + Sync + 'static> {
    /// The command handler failed the command.
    ///
    /// Nothing was persisted and the entity's state is unchanged. The
    /// rejection's `Display` is the reason reported to the caller.
    #[error(transparent)]
    Rejected(R),

    /// The emitted event could not be persisted.
    ///
    /// The entity's state is unchanged.
    #[error("failed to persist event: {0}")]
    Journal(#[from] JournalError),

    /// The emitted event could not be encoded for the journal.
    #[error("failed to encode event: {0}")]
    Encode(#[source] serde_json::Error),

    /// The entity's actor has passivated or exited.
    #[error("entity is no longer active")]
    EntityGone,
}

impl<R: std::error::Error + Send + Sync + 'static> CommandError<R> {
    /// The rejection, if the command failed validation.
    pub fn rejection(&self) -> Option<&R> {
        match self {
            Self::Rejected(r) => Some(r),
            _ => None,
        }
    }
}

/// Error returned when reading the current state of an entity fails.
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    /// The entity's actor has passivated or exited.
    #[error("entity is no longer active")]
    EntityGone,
}

/// Error returned when an entity cannot be activated.
#[derive(Debug, thiserror::Error)]
pub enum ActivationError {
    /// The entity type was never registered with the store.
    #[error("entity type '{0}' is not registered")]
    NotRegistered(&'static str),

    /// Reading the event log failed.
    #[error("failed to read event log: {0}")]
    Journal(#[from] JournalError),

    /// A stored event could not be decoded into the entity's event type.
    ///
    /// Replay must fold every event, so recovery stops here.
    #[error("failed to decode event {sequence_nr} ('{event_type}'): {source}")]
    Decode {
        sequence_nr: u64,
        event_type: String,
        #[source]
        source: serde_json::Error,
    },

    /// The event log skips or repeats a sequence number.
    #[error("event log out of sequence: expected {expected}, found {found}")]
    SequenceGap { expected: u64, found: u64 },

    /// The actor thread or its timer runtime could not be started.
    #[error("failed to start entity actor: {0}")]
    Spawn(#[source] std::io::Error),

    /// The actor thread exited before recovery finished.
    #[error("entity actor exited during recovery")]
    ActorGone,
}

/// Error returned by a [`Journal`](crate::Journal) backend.
#[derive(Debug, thiserror::Error)]
pub enum JournalError {
    /// Disk I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// An append did not continue the log at the next sequence number.
    ///
    /// Another writer appended to the same stream first.
    #[error("sequence conflict: expected {expected}, got {actual}")]
    Conflict { expected: u64, actual: u64 },

    /// A stored line could not be (de)serialized.
    #[error("malformed journal entry: {0}")]
    Codec(#[from] serde_json::Error),
}

/// Error returned when an entity registration is invalid.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("persistence id must not be empty")]
    EmptyPersistenceId,

    /// Only the JSON codec is available, so it cannot be switched off.
    #[error("service '{0}' disables JSON serialization but no other codec is available")]
    JsonFallbackDisabled(String),

    /// A schema descriptor was not found in any include directory.
    #[error("descriptor '{file}' not found in include dirs {include_dirs:?}")]
    DescriptorNotFound {
        file: PathBuf,
        include_dirs: Vec<PathBuf>,
    },

    #[error("service '{0}' is registered twice")]
    DuplicateService(String),

    #[error("entity type '{0}' is registered twice")]
    DuplicateEntityType(&'static str),

    #[error("invalid configuration: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Error returned by [`EntityStore::dispatch`](crate::EntityStore::dispatch).
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("no entity registered for service '{0}'")]
    UnknownService(String),

    /// The command payload does not match any command of the entity.
    #[error("malformed command: {0}")]
    MalformedCommand(#[source] serde_json::Error),

    /// The command handler failed the command; carries the reason.
    #[error("{0}")]
    Rejected(String),

    #[error(transparent)]
    Activation(#[from] ActivationError),

    /// Infrastructure failure while executing the command.
    #[error("command execution failed: {0}")]
    Execution(String),

    #[error("failed to encode reply: {0}")]
    ReplyEncoding(#[source] serde_json::Error),
}

impl<R: std::error::Error + Send + Sync + 'static> From<CommandError<R>> for DispatchError {
    fn from(err: CommandError<R>) -> Self {
        match err {
            CommandError::Rejected(reason) => Self::Rejected(reason.to_string()),
            other => Self::Execution(other.to_string()),
        }
    }
}
