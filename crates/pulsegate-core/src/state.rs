//! Channel lifecycle vocabulary.
//!
//! [`ChannelState`] is the observable state of the notification channel's
//! connection state machine; exactly one instance exists per active session
//! and it never outlives that session. [`LifecycleSignal`] is the coarse
//! broadcast consumers use to react to connectivity milestones (most
//! importantly [`LifecycleSignal::Reconnected`], the cue for backlog
//! reconciliation).

use serde::{Deserialize, Serialize};

/// Connection state of the notification channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelState {
    /// No transport held. Initial state, and the forced state whenever the
    /// auth gate deactivates.
    Disconnected,
    /// A dial is in flight (first attempt for this activation, or a manual
    /// retry from `Failed`).
    Connecting,
    /// Transport open; events are being dispatched in receipt order.
    Connected,
    /// The transport was lost and a backoff/redial cycle is running.
    Reconnecting,
    /// The retry budget is exhausted. Parked until a manual retry trigger
    /// or a session boundary.
    Failed,
}

impl ChannelState {
    /// Returns whether the channel currently holds an open transport.
    #[must_use]
    pub fn is_connected(self) -> bool {
        matches!(self, Self::Connected)
    }

    /// Returns whether the channel is between dial attempts.
    #[must_use]
    pub fn is_retrying(self) -> bool {
        matches!(self, Self::Connecting | Self::Reconnecting)
    }
}

impl std::fmt::Display for ChannelState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Disconnected => "Disconnected",
            Self::Connecting => "Connecting",
            Self::Connected => "Connected",
            Self::Reconnecting => "Reconnecting",
            Self::Failed => "Failed",
        };
        f.write_str(s)
    }
}

/// Coarse connectivity milestones broadcast to consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleSignal {
    /// A connection was re-established after a drop. Events may have been
    /// missed; consumers should reconcile against the history API.
    Reconnected,
    /// The retry budget was exhausted; only a manual retry or a new session
    /// will restart the channel.
    Failed {
        /// Reconnect attempts made before giving up.
        attempts: u32,
    },
}
