//! Error types for the notification channel.
//!
//! Provides [`ChannelError`] for channel lifecycle and dispatch operations,
//! plus a convenience [`ChannelResult`] alias. Transport-level failures are
//! recovered locally by the channel state machine; only
//! [`ChannelError::RetryBudgetExhausted`] is surfaced to the embedding UI
//! (as the `Failed` state with a manual-retry affordance).

use thiserror::Error;

/// Result alias for channel operations.
pub type ChannelResult<T> = Result<T, ChannelError>;

/// Errors that can occur in the notification channel.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// A configuration value is missing or invalid.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The websocket handshake was rejected or failed at the network level.
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    /// The connection dropped mid-session.
    #[error("unexpected drop: {0}")]
    UnexpectedDrop(String),

    /// The bounded reconnect budget was consumed without a successful dial.
    #[error("retry budget exhausted after {attempts} attempts")]
    RetryBudgetExhausted {
        /// Number of reconnect attempts made before giving up.
        attempts: u32,
    },

    /// An operation was invoked in a state that does not permit it.
    #[error("invalid state: expected {expected}, actual {actual}")]
    InvalidState {
        /// The state the operation requires.
        expected: String,
        /// The state the channel was actually in.
        actual: String,
    },

    /// An inbound frame could not be decoded into an event.
    #[error("decode error: {0}")]
    Decode(String),

    /// Backlog reconciliation against the history API failed.
    #[error("backlog reconciliation failed: {0}")]
    Backlog(String),
}
