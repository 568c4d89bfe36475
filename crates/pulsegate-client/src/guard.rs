//! Session boundary teardown coordination.
//!
//! [`SessionBoundaryGuard`] observes session changes and enforces the
//! ordered teardown that keeps one user's notifications out of the next
//! user's view: (1) force the channel to `Disconnected` and await transport
//! close, (2) clear the notification center, (3) only then activate a
//! channel for the new session. The whole sequence runs under an
//! [`ActivationGate`] so no activation can interleave with a teardown.
//!
//! Any change of session identity is treated as a boundary -- logout,
//! expiry, or a direct user-A-to-user-B replacement (the `watch` primitive
//! conflates rapid transitions, so an intermediate `None` may never be
//! observed).

use std::sync::Arc;

use tokio::sync::{Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use pulsegate_core::{Session, SessionStore};

use crate::center::NotificationCenter;
use crate::channel::NotificationChannel;

/// Async mutex held across the teardown window.
///
/// Embedders that drive [`NotificationChannel::activate`] directly should
/// lock the gate first so their activation cannot race a boundary teardown.
#[derive(Clone, Debug, Default)]
pub struct ActivationGate {
    inner: Arc<Mutex<()>>,
}

impl ActivationGate {
    /// Creates a new gate.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquires the gate.
    pub async fn lock(&self) -> MutexGuard<'_, ()> {
        self.inner.lock().await
    }
}

/// Watches the session store and performs ordered teardown on boundaries.
pub struct SessionBoundaryGuard {
    gate: ActivationGate,
    watcher: JoinHandle<()>,
}

impl SessionBoundaryGuard {
    /// Spawns the guard over a session store, channel, and center.
    ///
    /// If a session is already active when the guard starts, the channel is
    /// activated for it.
    #[must_use]
    pub fn spawn(
        store: Arc<dyn SessionStore>,
        channel: Arc<NotificationChannel>,
        center: Arc<NotificationCenter>,
    ) -> Self {
        let gate = ActivationGate::new();
        let task_gate = gate.clone();

        let watcher = tokio::spawn(async move {
            let mut rx = store.watch();
            let mut last: Option<Session> = rx.borrow_and_update().clone();

            if last.is_some() {
                let _permit = task_gate.lock().await;
                channel.activate().await;
            }

            loop {
                if rx.changed().await.is_err() {
                    debug!("session store dropped; guard exiting");
                    break;
                }
                let current: Option<Session> = rx.borrow_and_update().clone();
                if current == last {
                    continue;
                }

                let _permit = task_gate.lock().await;
                info!(
                    had_session = last.is_some(),
                    has_session = current.is_some(),
                    "session boundary observed; tearing down"
                );

                // Ordering is the whole point: close (and confirm) first,
                // clear cached state second, activate the new session last.
                channel.deactivate().await;
                center.clear();
                if current.is_some() {
                    channel.activate().await;
                }

                last = current;
            }
        });

        Self { gate, watcher }
    }

    /// Returns the activation gate shared with this guard.
    #[must_use]
    pub fn gate(&self) -> ActivationGate {
        self.gate.clone()
    }
}

impl Drop for SessionBoundaryGuard {
    fn drop(&mut self) {
        self.watcher.abort();
    }
}

impl std::fmt::Debug for SessionBoundaryGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionBoundaryGuard")
            .field("watcher_finished", &self.watcher.is_finished())
            .finish_non_exhaustive()
    }
}
