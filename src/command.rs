//! Caller metadata and the name-addressed command envelope.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Who sent a command and on behalf of which request.
///
/// Kept apart from the entity's `Command` type so handlers never have to
/// thread audit data through their own enums. Every field is copied onto the
/// [`EventMetadata`](crate::EventMetadata) of the event the command emits.
///
/// ```
/// use entityfold::CommandContext;
///
/// let ctx = CommandContext::default()
///     .with_actor("storefront")
///     .with_correlation_id("checkout-7f3a");
/// assert_eq!(ctx.correlation_id.as_deref(), Some("checkout-7f3a"));
/// assert!(ctx.metadata.is_none());
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CommandContext {
    /// Identity of whoever issued the command (e.g. a user ID).
    pub actor: Option<String>,
    /// Correlation ID for tracing a request across entities.
    pub correlation_id: Option<String>,
    /// Arbitrary metadata forwarded to the persisted event.
    pub metadata: Option<Value>,
}

impl CommandContext {
    pub fn with_actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = Some(actor.into());
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// Attach free-form JSON, stored as the event's `extra` metadata.
    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// A command addressed by service name rather than by Rust type.
///
/// The `command` payload is the adjacently tagged JSON form of the target
/// entity's command enum, so its `"type"` field names the command handler:
///
/// ```json
/// {"type": "AddItem", "data": {"productId": "p1", "name": "Widget", "quantity": 3}}
/// ```
///
/// Routed by [`EntityStore::dispatch`](crate::EntityStore::dispatch).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandEnvelope {
    /// Fully qualified service name the entity was registered under.
    pub service_name: String,
    /// Target entity instance.
    pub entity_id: String,
    /// JSON-serialized command.
    pub command: Value,
    /// Caller metadata forwarded to the command handler.
    #[serde(default)]
    pub context: CommandContext,
}

impl CommandEnvelope {
    pub fn new(
        service_name: impl Into<String>,
        entity_id: impl Into<String>,
        command: Value,
    ) -> Self {
        Self {
            service_name: service_name.into(),
            entity_id: entity_id.into(),
            command,
            context: CommandContext::default(),
        }
    }

    pub fn with_context(mut self, context: CommandContext) -> Self {
        self.context = context;
        self
    }

    /// The command name carried in the payload's `"type"` tag, if present.
    pub fn command_name(&self) -> Option<&str> {
        self.command.get("type").and_then(Value::as_str)
    }
}
