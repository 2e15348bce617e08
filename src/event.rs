//! Persisted event form and the codec between it and an entity's typed
//! events.
//!
//! Domain events use adjacently tagged serde
//! (`#[serde(tag = "type", content = "data")]`). The `"type"` tag becomes
//! [`PersistedEvent::event_type`] and the `"data"` part becomes
//! [`PersistedEvent::payload`], so the journal can be inspected without
//! knowing the Rust types.

use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::command::CommandContext;
use crate::entity::EventSourcedEntity;

/// Fixed namespace UUID for deterministic stream ID derivation.
const STREAM_NAMESPACE: Uuid = Uuid::from_bytes([
    0x3c, 0x8d, 0x51, 0xe2, 0x0a, 0x7f, 0x4b, 0x96, 0x8e, 0x2d, 0xc4, 0x61, 0x19, 0xb7, 0x5a, 0xf0,
]);

/// Derive a deterministic stream UUID from a persistence ID and entity ID.
///
/// Entity IDs are opaque strings chosen by callers; the file backends use
/// this UUID instead of the raw ID as a directory name.
///
/// # Examples
///
/// ```
/// use entityfold::stream_uuid;
/// let id = stream_uuid("shopping-cart", "cart-1");
/// assert_eq!(id, stream_uuid("shopping-cart", "cart-1"));
/// ```
pub fn stream_uuid(persistence_id: &str, entity_id: &str) -> Uuid {
    let name = format!("{persistence_id}/{entity_id}");
    Uuid::new_v5(&STREAM_NAMESPACE, name.as_bytes())
}

/// Infrastructure metadata stamped on every persisted event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventMetadata {
    /// Randomly generated event ID.
    pub event_id: Uuid,
    /// Entity type name (e.g. `"shopping-cart"`).
    pub entity_type: String,
    /// Entity instance identifier.
    pub entity_id: String,
    /// Actor identity from the command context, if provided.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor: Option<String>,
    /// Correlation ID from the command context, if provided.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    /// Extra metadata from the command context, if provided.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra: Option<Value>,
    /// Wall-clock time the event was encoded, in milliseconds since the epoch.
    pub recorded_at: u64,
}

/// One entry of an entity's event log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedEvent {
    /// Position within the entity's log, starting at 1.
    pub sequence_nr: u64,
    /// Event type tag (e.g. `"ItemAdded"`).
    pub event_type: String,
    /// The `"data"` part of the tagged event; `null` for unit variants.
    pub payload: Value,
    pub metadata: EventMetadata,
}

/// Encode a domain event into a [`PersistedEvent`] at `sequence_nr`.
///
/// # Errors
///
/// Returns `serde_json::Error` if the event cannot be serialized or does not
/// serialize to an adjacently tagged object with a string `"type"` field.
pub fn encode_event<E: EventSourcedEntity>(
    event: &E::Event,
    ctx: &CommandContext,
    entity_id: &str,
    sequence_nr: u64,
) -> serde_json::Result<PersistedEvent> {
    let value = serde_json::to_value(event)?;
    let Value::Object(mut obj) = value else {
        return Err(serde::ser::Error::custom(format!(
            "{} event must serialize to a tagged JSON object",
            E::ENTITY_TYPE
        )));
    };

    let event_type = match obj.remove("type") {
        Some(Value::String(tag)) => tag,
        _ => {
            return Err(serde::ser::Error::custom(format!(
                "{} event is missing a string 'type' tag",
                E::ENTITY_TYPE
            )));
        }
    };

    // Absent for unit variants.
    let payload = obj.remove("data").unwrap_or(Value::Null);

    Ok(PersistedEvent {
        sequence_nr,
        event_type,
        payload,
        metadata: EventMetadata {
            event_id: Uuid::new_v4(),
            entity_type: E::ENTITY_TYPE.to_owned(),
            entity_id: entity_id.to_owned(),
            actor: ctx.actor.clone(),
            correlation_id: ctx.correlation_id.clone(),
            extra: ctx.metadata.clone(),
            recorded_at: now_millis(),
        },
    })
}

/// Decode a [`PersistedEvent`] back into the entity's event type.
///
/// # Errors
///
/// Returns `serde_json::Error` if the event type is unknown to `E` or the
/// payload does not match the variant's shape.
pub fn decode_event<E: EventSourcedEntity>(record: &PersistedEvent) -> serde_json::Result<E::Event> {
    let tagged = if record.payload.is_null() {
        serde_json::json!({ "type": record.event_type })
    } else {
        serde_json::json!({
            "type": record.event_type,
            "data": record.payload,
        })
    };
    serde_json::from_value(tagged)
}

fn now_millis() -> u64 {
    // A clock before the epoch only affects the informational timestamp.
    SystemTime::UNIX_EPOCH
        .elapsed()
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
