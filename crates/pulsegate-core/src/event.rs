//! Inbound wire events.
//!
//! Defines the JSON message shape the server pushes over the channel and
//! the decoded [`InboundEvent`] handed to subscribers. The `type` field
//! dispatches to an [`EventKind`]; unknown type strings decode to
//! [`EventKind::Unknown`] and are ignored downstream (forward
//! compatibility -- a newer server must not break an older client).

use std::time::{SystemTime, UNIX_EPOCH};

use serde::Deserialize;

use crate::error::ChannelError;

/// Well-known event type strings on the wire.
const TYPE_NOTIFICATION_CREATED: &str = "notification.created";
const TYPE_NOTIFICATION_READ: &str = "notification.read";

/// Returns the current wall-clock time as epoch milliseconds.
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// Kind of an inbound event.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// A notification was created for the current user.
    NotificationCreated,
    /// An existing notification was marked read (possibly on another device).
    NotificationRead,
    /// An event type this client does not understand. Carried, not dispatched
    /// as an error -- consumers skip it.
    Unknown(String),
}

impl EventKind {
    /// Parses a wire `type` string into an [`EventKind`].
    #[must_use]
    pub fn from_wire(s: &str) -> Self {
        match s {
            TYPE_NOTIFICATION_CREATED => Self::NotificationCreated,
            TYPE_NOTIFICATION_READ => Self::NotificationRead,
            other => Self::Unknown(other.to_string()),
        }
    }

    /// Returns whether this kind is understood by this client version.
    #[must_use]
    pub fn is_known(&self) -> bool {
        !matches!(self, Self::Unknown(_))
    }
}

/// Raw wire shape of an inbound message.
#[derive(Debug, Deserialize)]
struct WireEvent {
    /// Server-assigned event id.
    id: String,
    /// Event type tag.
    #[serde(rename = "type")]
    kind: String,
    /// Opaque payload; interpretation depends on the kind.
    #[serde(default)]
    payload: serde_json::Value,
}

/// A decoded inbound event.
///
/// Immutable once received. Ordering is receipt order within a single
/// connection instance; no ordering is guaranteed across reconnects.
#[derive(Debug, Clone)]
pub struct InboundEvent {
    /// Server-assigned event id.
    pub id: String,
    /// Decoded event kind.
    pub kind: EventKind,
    /// Opaque payload for the consumer.
    pub payload: serde_json::Value,
    /// Local receipt timestamp (epoch millis).
    pub received_at: i64,
}

impl InboundEvent {
    /// Decodes a raw text frame into an [`InboundEvent`], stamping the
    /// receipt time.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::Decode`] if the frame is not valid JSON or is
    /// missing required fields. The read loop logs and skips such frames.
    pub fn decode(frame: &str) -> Result<Self, ChannelError> {
        let wire: WireEvent = serde_json::from_str(frame)
            .map_err(|e| ChannelError::Decode(format!("malformed event frame: {e}")))?;
        Ok(Self {
            id: wire.id,
            kind: EventKind::from_wire(&wire.kind),
            payload: wire.payload,
            received_at: now_millis(),
        })
    }
}
