//! # Pulsegate Client
//!
//! Authenticated realtime notification channel. Holds a single persistent
//! websocket connection while -- and only while -- a user session is valid,
//! fans inbound events out to subscribers, and guarantees that the channel
//! and any cached notification state are torn down synchronously on a
//! session boundary so a subsequent session never observes stale data.
//!
//! # Architecture
//!
//! - [`channel::NotificationChannel`] owns the connection task, its state
//!   machine, and the reconnect policy.
//! - [`bus::EventBus`] dispatches decoded events to subscribers, guarded by
//!   a per-activation generation token so stale deliveries are dropped.
//! - [`guard::SessionBoundaryGuard`] watches the session store and performs
//!   the ordered teardown (disconnect, clear cache, then re-activate).
//! - [`center::NotificationCenter`] is the built-in consumer: the
//!   id -> read/unread record map with a derived unread count.
//! - [`probe`] is a one-shot transport viability diagnostic, independent of
//!   the steady-state channel.
//!
//! # Delivery Guarantees
//!
//! The websocket transport is non-replayable. Delivery is **at-most-once**
//! per connection instance; events missed while disconnected are not
//! replayed. The channel emits [`pulsegate_core::LifecycleSignal::Reconnected`]
//! after a successful redial so consumers can reconcile through a history
//! API (see [`center::BacklogSource`]).

#![deny(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]

/// Reconnect backoff policy
pub mod backoff;

/// Event fan-out bus and subscriptions
pub mod bus;

/// Built-in notification consumer
pub mod center;

/// The channel state machine
pub mod channel;

/// Channel configuration
pub mod config;

/// Session boundary teardown coordination
pub mod guard;

/// One-shot transport viability probe
pub mod probe;

pub use backoff::ReconnectPolicy;
pub use bus::{EventBus, EventFilter, Subscription};
pub use center::{BacklogSource, NotificationCenter};
pub use channel::NotificationChannel;
pub use config::{ChannelConfig, CredentialPlacement, ReconnectConfig};
pub use guard::{ActivationGate, SessionBoundaryGuard};
pub use probe::probe;
