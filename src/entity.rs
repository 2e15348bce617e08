//! The event-sourced entity contract: initial state, per-state behavior,
//! command effects, and the fold that derives state from events.

use std::fmt;

use serde::{Serialize, de::DeserializeOwned};

use crate::command::CommandContext;

/// An independently addressable unit whose state is derived solely from its
/// event history.
///
/// The implementing type is a marker; the entity's data lives in
/// [`State`](EventSourcedEntity::State). State is never mutated directly:
/// command handlers decide, event handlers fold.
///
/// # Contract
///
/// - [`initial_state`](EventSourcedEntity::initial_state) must be pure and
///   deterministic. It is called once per activation when no snapshot exists.
/// - [`behavior`](EventSourcedEntity::behavior) must be pure. The runtime
///   calls it afresh before every command and before every event
///   application, so an entity may switch handler sets based on its state.
/// - Event handlers must be total and deterministic: replaying the same
///   events from the initial state always yields the same state.
pub trait EventSourcedEntity: Sized + Send + Sync + 'static {
    /// Identifies this entity type in logs and event metadata (e.g. `"cart"`).
    const ENTITY_TYPE: &'static str;

    /// The state folded from events.
    type State: Clone + Serialize + DeserializeOwned + Send + Sync + 'static;

    /// Requests this entity accepts. Commands are never persisted.
    type Command: Send + 'static;

    /// Durable facts this entity emits and folds.
    ///
    /// Must use adjacently tagged serde (`#[serde(tag = "type", content = "data")]`).
    type Event: Serialize + DeserializeOwned + Clone + Send + Sync + 'static;

    /// Value returned to the caller of a successful command.
    type Reply: Send + 'static;

    /// Validation failure returned to the caller of a rejected command.
    type Rejection: std::error::Error + Send + Sync + 'static;

    /// State of an entity with no history.
    fn initial_state(entity_id: &str) -> Self::State;

    /// Handler set applicable to `state`.
    fn behavior(state: &Self::State) -> Behavior<Self>;
}

/// Decides the effect of one command against the current state.
pub type CommandHandler<E> = fn(
    &EntityContext<'_>,
    &<E as EventSourcedEntity>::State,
    <E as EventSourcedEntity>::Command,
) -> Effect<E>;

/// Folds one event into the state.
pub type EventHandler<E> =
    fn(<E as EventSourcedEntity>::State, &<E as EventSourcedEntity>::Event) -> <E as EventSourcedEntity>::State;

/// A set of handlers selected by [`EventSourcedEntity::behavior`].
pub struct Behavior<E: EventSourcedEntity> {
    /// Label used in logs (e.g. `"open"`, `"checked-out"`).
    pub name: &'static str,
    /// Handles every command while this behavior is active.
    pub command_handler: CommandHandler<E>,
    /// Folds every event while this behavior is active.
    pub event_handler: EventHandler<E>,
}

impl<E: EventSourcedEntity> Behavior<E> {
    pub fn new(
        name: &'static str,
        command_handler: CommandHandler<E>,
        event_handler: EventHandler<E>,
    ) -> Self {
        Self {
            name,
            command_handler,
            event_handler,
        }
    }
}

// Manual impls: fn pointers are `Copy` whatever `E` is.
impl<E: EventSourcedEntity> Clone for Behavior<E> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<E: EventSourcedEntity> Copy for Behavior<E> {}

impl<E: EventSourcedEntity> fmt::Debug for Behavior<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Behavior")
            .field("entity_type", &E::ENTITY_TYPE)
            .field("name", &self.name)
            .finish()
    }
}

/// Outcome of a command handler.
///
/// Exactly one outcome per invocation, and at most one event: the shape of
/// the type rules out emitting twice or emitting and failing together.
pub enum Effect<E: EventSourcedEntity> {
    /// Reply without changing state.
    Reply(E::Reply),
    /// Persist `event`, fold it into state, then reply.
    Emit { event: E::Event, reply: E::Reply },
    /// Reject the command. Nothing is persisted and state is unchanged.
    Fail(E::Rejection),
}

impl<E: EventSourcedEntity> Effect<E> {
    pub fn reply(reply: E::Reply) -> Self {
        Self::Reply(reply)
    }

    pub fn emit(event: E::Event, reply: E::Reply) -> Self {
        Self::Emit { event, reply }
    }

    pub fn fail(rejection: E::Rejection) -> Self {
        Self::Fail(rejection)
    }

    /// The event this effect would persist, if any.
    pub fn event(&self) -> Option<&E::Event> {
        match self {
            Self::Emit { event, .. } => Some(event),
            Self::Reply(_) | Self::Fail(_) => None,
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Fail(_))
    }
}

impl<E> fmt::Debug for Effect<E>
where
    E: EventSourcedEntity,
    E::Event: fmt::Debug,
    E::Reply: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Reply(reply) => f.debug_tuple("Reply").field(reply).finish(),
            Self::Emit { event, reply } => f
                .debug_struct("Emit")
                .field("event", event)
                .field("reply", reply)
                .finish(),
            Self::Fail(rejection) => f.debug_tuple("Fail").field(&rejection.to_string()).finish(),
        }
    }
}

/// Read-only environment handed to command handlers.
#[derive(Debug, Clone, Copy)]
pub struct EntityContext<'a> {
    /// Identifier of the entity instance handling the command.
    pub entity_id: &'a str,
    /// Sequence number of the last event folded into the current state.
    pub sequence_nr: u64,
    /// Caller-supplied metadata.
    pub command: &'a CommandContext,
}

/// Fold one event into `state` using the behavior selected for `state`.
pub fn apply_event<E: EventSourcedEntity>(state: E::State, event: &E::Event) -> E::State {
    let behavior = E::behavior(&state);
    (behavior.event_handler)(state, event)
}

/// Run one command through the behavior selected for `state`.
pub fn decide<E: EventSourcedEntity>(
    ctx: &EntityContext<'_>,
    state: &E::State,
    command: E::Command,
) -> Effect<E> {
    let behavior = E::behavior(state);
    tracing::trace!(
        entity_type = E::ENTITY_TYPE,
        behavior = behavior.name,
        "dispatching command"
    );
    (behavior.command_handler)(ctx, state, command)
}

/// Rebuild state from scratch: `initial_state(entity_id)` folded over `events`.
///
/// # Examples
///
/// ```
/// use entityfold::replay;
/// use entityfold::shopping_cart::{CartEvent, ShoppingCart};
///
/// let events = vec![
///     CartEvent::ItemAdded { product_id: "p1".into(), name: "Widget".into(), quantity: 3 },
///     CartEvent::ItemAdded { product_id: "p1".into(), name: "Widget".into(), quantity: 2 },
/// ];
/// let cart = replay::<ShoppingCart>("cart-1", &events);
/// assert_eq!(cart.items[0].quantity, 5);
/// ```
pub fn replay<'a, E: EventSourcedEntity>(
    entity_id: &str,
    events: impl IntoIterator<Item = &'a E::Event>,
) -> E::State {
    events
        .into_iter()
        .fold(E::initial_state(entity_id), |state, event| {
            apply_event::<E>(state, event)
        })
}
