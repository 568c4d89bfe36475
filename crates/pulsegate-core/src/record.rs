//! Notification records.
//!
//! [`NotificationRecord`] is the consumer-facing projection of a delivered
//! notification: keyed by id, ordered for display by `created_at`
//! (most-recent-first), with a local `read` flag.

use serde::{Deserialize, Serialize};

use crate::error::ChannelError;
use crate::event::InboundEvent;

/// A single notification as held by the consumer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationRecord {
    /// Unique notification id (server-assigned).
    pub id: String,
    /// Short title for display.
    pub title: String,
    /// Body text.
    pub body: String,
    /// Creation time on the server (epoch millis). Display order is by this
    /// field, not receipt order, since reconnects may redeliver backlog out
    /// of real-time order.
    pub created_at: i64,
    /// Whether the user has read this notification.
    #[serde(default)]
    pub read: bool,
}

/// Payload shape of a `notification.created` event.
#[derive(Debug, Deserialize)]
struct CreatedPayload {
    #[serde(default)]
    title: String,
    #[serde(default)]
    body: String,
    #[serde(default)]
    created_at: Option<i64>,
    #[serde(default)]
    read: bool,
}

impl NotificationRecord {
    /// Builds a record from a `notification.created` event payload.
    ///
    /// Missing `title`/`body` default to empty strings; a missing
    /// `created_at` falls back to the event's receipt time so ordering
    /// stays total.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::Decode`] if the payload is not an object.
    pub fn from_created(event: &InboundEvent) -> Result<Self, ChannelError> {
        let payload: CreatedPayload = serde_json::from_value(event.payload.clone())
            .map_err(|e| ChannelError::Decode(format!("created payload: {e}")))?;
        Ok(Self {
            id: event.id.clone(),
            title: payload.title,
            body: payload.body,
            created_at: payload.created_at.unwrap_or(event.received_at),
            read: payload.read,
        })
    }
}
