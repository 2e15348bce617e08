//! Actor loop that owns one live entity and processes its commands.
//!
//! Each active entity runs on its own OS thread and handles messages from an
//! `mpsc` channel one at a time, so commands against the same entity never
//! interleave. The thread recovers the entity (snapshot, then event tail)
//! before accepting messages and exits on passivation, idle timeout, or when
//! every handle is dropped.
//!
//! Public API: [`EntityHandle`]. Actors are started by
//! [`EntityStore::get`](crate::EntityStore::get).

use std::fmt;
use std::io;
use std::num::NonZeroU64;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};

use crate::command::CommandContext;
use crate::entity::{Effect, EntityContext, EventSourcedEntity, apply_event, decide};
use crate::error::{ActivationError, CommandError, StateError};
use crate::event::{decode_event, encode_event};
use crate::journal::Journal;
use crate::snapshot::{Snapshot, SnapshotStore};

/// Bounded mailbox size per entity.
const MAILBOX_CAPACITY: usize = 32;

/// Everything an actor needs besides its entity ID.
///
/// Internal to the crate; built by the store from the builder settings and
/// the entity's registration.
#[derive(Clone)]
pub(crate) struct ActorConfig {
    pub journal: Arc<dyn Journal>,
    pub snapshots: Arc<dyn SnapshotStore>,
    pub persistence_id: Arc<str>,
    pub snapshot_every: Option<NonZeroU64>,
    /// How long the actor waits for a message before passivating.
    pub idle_timeout: Duration,
}

type CommandResult<E> = Result<
    <E as EventSourcedEntity>::Reply,
    CommandError<<E as EventSourcedEntity>::Rejection>,
>;

/// Messages sent from [`EntityHandle`] to the actor loop.
pub(crate) enum ActorMessage<E: EventSourcedEntity> {
    Execute {
        cmd: E::Command,
        ctx: CommandContext,
        reply: oneshot::Sender<CommandResult<E>>,
    },
    GetState {
        reply: oneshot::Sender<E::State>,
    },
    GetSequenceNr {
        reply: oneshot::Sender<u64>,
    },
    /// Stop the actor. `done` fires once the mailbox is closed.
    Passivate { done: oneshot::Sender<()> },
}

/// A recovered entity: its state and the number of the last folded event.
struct EntityActor<E: EventSourcedEntity> {
    entity_id: String,
    state: E::State,
    sequence_nr: u64,
    config: ActorConfig,
}

impl<E: EventSourcedEntity> EntityActor<E> {
    /// Rebuild the entity from its latest snapshot and the events after it.
    fn recover(entity_id: String, config: ActorConfig) -> Result<Self, ActivationError> {
        let mut snapshot = load_snapshot::<E>(&entity_id, &config);
        if let Some(snap) = &snapshot {
            let highest = config
                .journal
                .highest_sequence_nr(&config.persistence_id, &entity_id)?;
            // Resuming past the journal's end would make every append conflict.
            if snap.sequence_nr > highest {
                tracing::warn!(
                    entity_id = %entity_id,
                    snapshot_sequence_nr = snap.sequence_nr,
                    journal_sequence_nr = highest,
                    "snapshot is ahead of journal; replaying from start"
                );
                snapshot = None;
            }
        }
        let (mut state, mut sequence_nr) = match snapshot {
            Some(snapshot) => (snapshot.state, snapshot.sequence_nr),
            None => (E::initial_state(&entity_id), 0),
        };
        let from_snapshot = sequence_nr;

        let records = config
            .journal
            .read(&config.persistence_id, &entity_id, sequence_nr)?;
        for record in &records {
            let expected = sequence_nr + 1;
            if record.sequence_nr != expected {
                return Err(ActivationError::SequenceGap {
                    expected,
                    found: record.sequence_nr,
                });
            }
            let event = decode_event::<E>(record).map_err(|source| ActivationError::Decode {
                sequence_nr: record.sequence_nr,
                event_type: record.event_type.clone(),
                source,
            })?;
            state = apply_event::<E>(state, &event);
            sequence_nr = record.sequence_nr;
        }

        tracing::info!(
            entity_type = E::ENTITY_TYPE,
            entity_id = %entity_id,
            from_snapshot,
            replayed = records.len(),
            sequence_nr,
            "entity activated"
        );

        Ok(Self {
            entity_id,
            state,
            sequence_nr,
            config,
        })
    }

    /// Decide, persist, fold, reply.
    ///
    /// The state only changes after the journal accepted the event.
    fn execute(&mut self, cmd: E::Command, meta: &CommandContext) -> CommandResult<E> {
        let ctx = EntityContext {
            entity_id: &self.entity_id,
            sequence_nr: self.sequence_nr,
            command: meta,
        };

        match decide::<E>(&ctx, &self.state, cmd) {
            Effect::Reply(reply) => Ok(reply),
            Effect::Fail(rejection) => {
                tracing::debug!(reason = %rejection, "command rejected");
                Err(CommandError::Rejected(rejection))
            }
            Effect::Emit { event, reply } => {
                let next = self.sequence_nr + 1;
                let record = encode_event::<E>(&event, meta, &self.entity_id, next)
                    .map_err(CommandError::Encode)?;
                self.config
                    .journal
                    .append(&self.config.persistence_id, &self.entity_id, &record)?;

                self.state = apply_event::<E>(self.state.clone(), &event);
                self.sequence_nr = next;
                tracing::info!(
                    sequence_nr = next,
                    event_type = %record.event_type,
                    "event appended"
                );

                self.maybe_snapshot();
                Ok(reply)
            }
        }
    }

    fn maybe_snapshot(&self) {
        let Some(every) = self.config.snapshot_every else {
            return;
        };
        if self.sequence_nr % every.get() != 0 {
            return;
        }

        let snapshot = Snapshot {
            state: &self.state,
            sequence_nr: self.sequence_nr,
        };
        let saved = snapshot.to_json().map_err(io::Error::from).and_then(|json| {
            self.config
                .snapshots
                .save(&self.config.persistence_id, &self.entity_id, &json)
        });
        match saved {
            Ok(()) => tracing::debug!(sequence_nr = self.sequence_nr, "snapshot saved"),
            // The journal still holds everything; recovery just replays more.
            Err(e) => tracing::warn!(
                sequence_nr = self.sequence_nr,
                error = %e,
                "failed to save snapshot"
            ),
        }
    }
}

/// Latest usable snapshot; anything unreadable counts as a miss.
fn load_snapshot<E: EventSourcedEntity>(
    entity_id: &str,
    config: &ActorConfig,
) -> Option<Snapshot<E::State>> {
    let stored = match config.snapshots.load(&config.persistence_id, entity_id) {
        Ok(stored) => stored?,
        Err(e) => {
            tracing::warn!(entity_id, error = %e, "failed to load snapshot; replaying from start");
            return None;
        }
    };
    match stored.into_typed::<E::State>() {
        Ok(snapshot) => Some(snapshot),
        Err(e) => {
            tracing::warn!(
                entity_id,
                error = %e,
                "snapshot does not match entity state; replaying from start"
            );
            None
        }
    }
}

/// Runs the entity actor loop on its dedicated thread.
///
/// Reports the outcome of recovery on `ready` before handling any message.
fn run_actor<E: EventSourcedEntity>(
    entity_id: String,
    config: ActorConfig,
    mut rx: mpsc::Receiver<ActorMessage<E>>,
    ready: oneshot::Sender<Result<(), ActivationError>>,
) {
    // A private current-thread runtime drives the idle timer; the caller's
    // runtime may be current-thread and would not drive timers from here.
    let rt = match tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            let _ = ready.send(Err(ActivationError::Spawn(e)));
            return;
        }
    };

    let mut actor = match EntityActor::<E>::recover(entity_id, config) {
        Ok(actor) => actor,
        Err(e) => {
            tracing::warn!(entity_type = E::ENTITY_TYPE, error = %e, "activation failed");
            let _ = ready.send(Err(e));
            return;
        }
    };
    if ready.send(Ok(())).is_err() {
        // Nobody is waiting for this activation any more.
        return;
    }

    let idle_timeout = actor.config.idle_timeout;
    let done = loop {
        // The timeout future must be created inside `block_on` so its timer
        // registers with the local runtime.
        let msg = rt.block_on(async { tokio::time::timeout(idle_timeout, rx.recv()).await });

        match msg {
            Ok(Some(ActorMessage::Execute { cmd, ctx, reply })) => {
                let _span = tracing::info_span!(
                    "command",
                    entity_type = E::ENTITY_TYPE,
                    entity_id = %actor.entity_id,
                )
                .entered();
                let result = actor.execute(cmd, &ctx);
                // A dropped receiver means the caller stopped waiting.
                let _ = reply.send(result);
            }
            Ok(Some(ActorMessage::GetState { reply })) => {
                let _ = reply.send(actor.state.clone());
            }
            Ok(Some(ActorMessage::GetSequenceNr { reply })) => {
                let _ = reply.send(actor.sequence_nr);
            }
            Ok(Some(ActorMessage::Passivate { done })) => break Some(done),
            // All handles dropped.
            Ok(None) => break None,
            Err(_elapsed) => {
                tracing::info!(
                    entity_type = E::ENTITY_TYPE,
                    entity_id = %actor.entity_id,
                    "entity idle"
                );
                break None;
            }
        }
    };

    // Close the mailbox before acknowledging so `is_alive` is already false
    // when `passivate` returns. Queued messages are dropped with it.
    drop(rx);
    tracing::info!(
        entity_type = E::ENTITY_TYPE,
        entity_id = %actor.entity_id,
        sequence_nr = actor.sequence_nr,
        "entity passivated"
    );
    if let Some(done) = done {
        let _ = done.send(());
    }
}

/// Start an actor for `entity_id` and wait until it has recovered.
///
/// # Errors
///
/// Returns [`ActivationError`] if the thread cannot start or recovery fails.
pub(crate) async fn spawn_entity<E: EventSourcedEntity>(
    entity_id: String,
    config: ActorConfig,
) -> Result<EntityHandle<E>, ActivationError> {
    let (tx, rx) = mpsc::channel::<ActorMessage<E>>(MAILBOX_CAPACITY);
    let (ready_tx, ready_rx) = oneshot::channel();
    let id: Arc<str> = Arc::from(entity_id.as_str());

    std::thread::Builder::new()
        .name(format!("{}-actor", E::ENTITY_TYPE))
        .spawn(move || run_actor::<E>(entity_id, config, rx, ready_tx))
        .map_err(ActivationError::Spawn)?;

    ready_rx.await.map_err(|_| ActivationError::ActorGone)??;

    Ok(EntityHandle {
        sender: tx,
        entity_id: id,
    })
}

/// Async handle to an active entity.
///
/// Cheap to clone and `Send + Sync`. Every clone talks to the same actor, so
/// commands from all clones are applied one after another.
pub struct EntityHandle<E: EventSourcedEntity> {
    sender: mpsc::Sender<ActorMessage<E>>,
    entity_id: Arc<str>,
}

impl<E: EventSourcedEntity> Clone for EntityHandle<E> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
            entity_id: Arc::clone(&self.entity_id),
        }
    }
}

impl<E: EventSourcedEntity> fmt::Debug for EntityHandle<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityHandle")
            .field("entity_type", &E::ENTITY_TYPE)
            .field("entity_id", &self.entity_id)
            .field("alive", &self.is_alive())
            .finish()
    }
}

impl<E: EventSourcedEntity> EntityHandle<E> {
    pub fn entity_id(&self) -> &str {
        &self.entity_id
    }

    /// Send a command to the entity and wait for its reply.
    ///
    /// # Errors
    ///
    /// * [`CommandError::Rejected`] -- the entity failed the command.
    /// * [`CommandError::Journal`] / [`CommandError::Encode`] -- the emitted
    ///   event could not be persisted; state is unchanged.
    /// * [`CommandError::EntityGone`] -- the entity has passivated.
    pub async fn send(&self, cmd: E::Command, ctx: CommandContext) -> CommandResult<E> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(ActorMessage::Execute { cmd, ctx, reply: tx })
            .await
            .map_err(|_| CommandError::EntityGone)?;
        rx.await.map_err(|_| CommandError::EntityGone)?
    }

    /// A copy of the entity's current state.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::EntityGone`] if the entity has passivated.
    pub async fn state(&self) -> Result<E::State, StateError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(ActorMessage::GetState { reply: tx })
            .await
            .map_err(|_| StateError::EntityGone)?;
        rx.await.map_err(|_| StateError::EntityGone)
    }

    /// Sequence number of the last event folded into the state; `0` for a
    /// fresh entity.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::EntityGone`] if the entity has passivated.
    pub async fn sequence_nr(&self) -> Result<u64, StateError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(ActorMessage::GetSequenceNr { reply: tx })
            .await
            .map_err(|_| StateError::EntityGone)?;
        rx.await.map_err(|_| StateError::EntityGone)
    }

    /// Stop the actor after the messages already queued ahead of this one.
    ///
    /// In-memory state is dropped; the next
    /// [`EntityStore::get`](crate::EntityStore::get) recovers it from the
    /// journal. A no-op on an entity that is already gone.
    pub async fn passivate(&self) {
        let (tx, rx) = oneshot::channel();
        if self
            .sender
            .send(ActorMessage::Passivate { done: tx })
            .await
            .is_ok()
        {
            let _ = rx.await;
        }
    }

    /// Whether the actor behind this handle is still running.
    ///
    /// The store uses this to evict stale handles and re-activate on the
    /// next `get`.
    pub fn is_alive(&self) -> bool {
        !self.sender.is_closed()
    }
}
