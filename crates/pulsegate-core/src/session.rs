//! Session model, store trait, and auth gate.
//!
//! A [`Session`] is an authenticated user context with a bounded lifetime,
//! owned by an external auth store. The channel only *observes* it: the
//! [`SessionStore`] trait exposes the current session and a
//! `tokio::sync::watch` subscription for change signals, and callers re-read
//! `current()` on every activation decision rather than caching a copy.

use tokio::sync::watch;
use tracing::debug;

/// An authenticated user context.
///
/// Created on successful authentication, destroyed on logout or token
/// expiry. The token is opaque to this crate and is only ever attached to
/// the channel handshake.
#[derive(Clone, PartialEq, Eq)]
pub struct Session {
    /// Opaque identity token presented during the channel handshake.
    pub token: String,
    /// Identifier of the authenticated user.
    pub user_id: String,
}

impl Session {
    /// Creates a new session.
    #[must_use]
    pub fn new(token: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            user_id: user_id.into(),
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Token deliberately omitted.
        f.debug_struct("Session")
            .field("user_id", &self.user_id)
            .finish_non_exhaustive()
    }
}

/// Read-only view over an external session store.
///
/// Implementations must guarantee that `watch()` receivers observe a change
/// whenever the value returned by `current()` changes. Note that
/// `tokio::sync::watch` conflates rapid successive updates; consumers must
/// therefore key their reactions to the *identity* of the current session
/// rather than to individual transitions.
pub trait SessionStore: Send + Sync {
    /// Returns the current session, if one is active.
    fn current(&self) -> Option<Session>;

    /// Returns a watch receiver signalled on session changes.
    fn watch(&self) -> watch::Receiver<Option<Session>>;
}

/// Pure activation predicate over session state.
///
/// No side effects, no caching -- recomputed on every session change. Used
/// both to gate UI rendering and as the activation signal the channel
/// consumes to decide whether to hold a connection open.
#[derive(Debug, Clone, Copy)]
pub struct AuthGate;

impl AuthGate {
    /// Returns whether dependents should be active for this session state.
    #[must_use]
    pub fn is_active(session: Option<&Session>) -> bool {
        session.is_some()
    }
}

/// In-memory [`SessionStore`] backed by a watch channel.
///
/// Suitable for embedders that manage authentication elsewhere and push
/// session changes in, and for tests.
#[derive(Debug)]
pub struct InMemorySessionStore {
    tx: watch::Sender<Option<Session>>,
}

impl InMemorySessionStore {
    /// Creates an empty store (no active session).
    #[must_use]
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx }
    }

    /// Installs a new active session, replacing any existing one.
    pub fn login(&self, session: Session) {
        debug!(user_id = %session.user_id, "session installed");
        self.tx.send_replace(Some(session));
    }

    /// Clears the active session.
    pub fn logout(&self) {
        debug!("session cleared");
        self.tx.send_replace(None);
    }
}

impl Default for InMemorySessionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionStore for InMemorySessionStore {
    fn current(&self) -> Option<Session> {
        self.tx.borrow().clone()
    }

    fn watch(&self) -> watch::Receiver<Option<Session>> {
        self.tx.subscribe()
    }
}
