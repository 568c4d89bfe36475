//! # Pulsegate Core
//!
//! Data model and observable-session layer for the pulsegate realtime
//! notification channel. This crate carries no transport I/O: it defines
//! what a [`session::Session`] is, how inbound wire events are decoded,
//! and the channel lifecycle vocabulary shared with `pulsegate-client`.

#![deny(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]

/// Channel error taxonomy
pub mod error;

/// Inbound wire events
pub mod event;

/// Notification records
pub mod record;

/// Session model, store trait, and auth gate
pub mod session;

/// Channel lifecycle vocabulary
pub mod state;

pub use error::{ChannelError, ChannelResult};
pub use event::{EventKind, InboundEvent};
pub use record::NotificationRecord;
pub use session::{AuthGate, InMemorySessionStore, Session, SessionStore};
pub use state::{ChannelState, LifecycleSignal};
