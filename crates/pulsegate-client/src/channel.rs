//! The notification channel state machine.
//!
//! [`NotificationChannel`] owns the single persistent websocket connection
//! for the active session: its lifecycle state machine
//! (`Disconnected | Connecting | Connected | Reconnecting | Failed`), the
//! reconnect policy, and the event-dispatch bus. All transport I/O runs in
//! one spawned connection task per activation; the task is the only writer
//! of channel state, except for the final `Disconnected` written by
//! [`NotificationChannel::deactivate`] after the task has been joined.
//!
//! Race safety rests on the bus generation token: `deactivate` advances the
//! generation *before* signalling shutdown, so an event already read from
//! the socket -- or a backoff timer already fired -- can never reach
//! subscribers once a session boundary has been observed.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{broadcast, watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use tungstenite::client::IntoClientRequest;
use tungstenite::http::{HeaderName, HeaderValue};

use pulsegate_core::{
    AuthGate, ChannelError, ChannelResult, ChannelState, EventKind, InboundEvent, LifecycleSignal,
    Session, SessionStore,
};

use crate::backoff::ReconnectPolicy;
use crate::bus::{EventBus, EventFilter, Handler, Subscription};
use crate::config::{ChannelConfig, CredentialPlacement};

/// How long `deactivate` waits for the connection task before aborting it.
const TEARDOWN_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Capacity of the lifecycle broadcast channel.
const LIFECYCLE_CAPACITY: usize = 16;

/// State shared between the channel handle and its connection task.
struct ChannelShared {
    /// Channel configuration.
    config: ChannelConfig,
    /// The observed session store. Re-read on every dial decision.
    store: Arc<dyn SessionStore>,
    /// Event fan-out bus; also owns the generation token.
    bus: Arc<EventBus>,
    /// Published channel state.
    state_tx: watch::Sender<ChannelState>,
    /// Lifecycle milestone broadcast.
    lifecycle_tx: broadcast::Sender<LifecycleSignal>,
    /// Manual retry trigger for the `Failed` state.
    retry: Notify,
}

impl ChannelShared {
    /// Publishes a state transition, unless `generation` has been
    /// invalidated by a session boundary.
    fn set_state(&self, generation: u64, state: ChannelState) {
        if self.bus.current_generation() != generation {
            return;
        }
        self.state_tx.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                debug!(from = %current, to = %state, "channel state transition");
                *current = state;
                true
            }
        });
    }
}

/// A running connection task for one activation.
struct ActiveConnection {
    /// Session the connection was opened for. Full identity, not just the
    /// user: a rotated token means the credential in use is stale.
    session: Session,
    /// Generation captured at activation.
    generation: u64,
    /// Shutdown signal for the task.
    shutdown_tx: watch::Sender<bool>,
    /// Handle to the spawned task.
    handle: JoinHandle<()>,
}

/// The session-bound notification channel.
///
/// Exactly one connection task runs per activation; activations are driven
/// by [`SessionBoundaryGuard`](crate::guard::SessionBoundaryGuard) (or
/// directly by an embedder) and are restartable indefinitely across session
/// lifetimes -- each activation starts fresh under a new generation, with no
/// state carried over.
pub struct NotificationChannel {
    shared: Arc<ChannelShared>,
    /// Currently running connection, if any. The async mutex serializes
    /// activate/deactivate so no two tasks can hold a transport at once.
    running: Mutex<Option<ActiveConnection>>,
}

impl NotificationChannel {
    /// Creates a channel over the given session store.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::Configuration`] if the config is invalid.
    pub fn new(config: ChannelConfig, store: Arc<dyn SessionStore>) -> ChannelResult<Self> {
        config.validate()?;
        let (state_tx, _state_rx) = watch::channel(ChannelState::Disconnected);
        let (lifecycle_tx, _lifecycle_rx) = broadcast::channel(LIFECYCLE_CAPACITY);
        Ok(Self {
            shared: Arc::new(ChannelShared {
                config,
                store,
                bus: Arc::new(EventBus::new()),
                state_tx,
                lifecycle_tx,
                retry: Notify::new(),
            }),
            running: Mutex::new(None),
        })
    }

    /// Returns the current channel state.
    #[must_use]
    pub fn state(&self) -> ChannelState {
        *self.shared.state_tx.borrow()
    }

    /// Returns a watch receiver over the channel state (read-only UI
    /// surface).
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<ChannelState> {
        self.shared.state_tx.subscribe()
    }

    /// Subscribes to lifecycle milestones
    /// ([`LifecycleSignal::Reconnected`] is the backlog-reconciliation cue).
    #[must_use]
    pub fn subscribe_lifecycle(&self) -> broadcast::Receiver<LifecycleSignal> {
        self.shared.lifecycle_tx.subscribe()
    }

    /// Registers an event subscriber.
    ///
    /// Delivery is at-most-once per connection instance, in receipt order.
    /// The returned [`Subscription`] unregisters on drop.
    #[must_use]
    pub fn subscribe(&self, filter: EventFilter, handler: Handler) -> Subscription {
        self.shared.bus.subscribe(filter, handler)
    }

    /// Returns the event bus handle.
    #[must_use]
    pub fn bus(&self) -> Arc<EventBus> {
        Arc::clone(&self.shared.bus)
    }

    /// Activates the channel for the current session, if the auth gate
    /// permits it.
    ///
    /// Re-reads the session store rather than trusting any cached session.
    /// Returns `true` if a connection task is running when the call
    /// completes (including the already-running case). If a task for a
    /// *different* session identity is still running it is torn down first;
    /// the guard normally does this explicitly, this is a backstop. Identity
    /// includes the token, so a same-user session with a rotated token
    /// replaces the connection rather than keeping the stale credential.
    pub async fn activate(&self) -> bool {
        let mut running = self.running.lock().await;

        let Some(session) = self.shared.store.current() else {
            debug!("activation requested with no session; gate inactive");
            return false;
        };
        if !AuthGate::is_active(Some(&session)) {
            return false;
        }

        if let Some(active) = running.as_ref() {
            if active.session == session && !active.handle.is_finished() {
                return true;
            }
            let stale = running.take();
            drop_connection(&self.shared, stale).await;
        }

        let generation = self.shared.bus.advance_generation();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let shared = Arc::clone(&self.shared);

        info!(user_id = %session.user_id, generation, "activating notification channel");
        let handle = tokio::spawn(run_connection(
            shared,
            session.clone(),
            generation,
            shutdown_rx,
        ));

        *running = Some(ActiveConnection {
            session,
            generation,
            shutdown_tx,
            handle,
        });
        true
    }

    /// Forces the channel to `Disconnected`, closing the transport and
    /// invalidating every in-flight dispatch and pending backoff timer.
    ///
    /// Synchronous from the caller's perspective: when this returns, the
    /// connection task has terminated, the transport close has been sent,
    /// and no event from the torn-down instance can reach subscribers.
    pub async fn deactivate(&self) {
        let mut running = self.running.lock().await;
        let active = running.take();
        drop_connection(&self.shared, active).await;
    }

    /// Manual retry trigger: restarts dialing from the `Failed` state with
    /// a fresh retry budget.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::InvalidState`] if the channel is in any
    /// state other than `Failed`; nothing is triggered in that case.
    pub fn retry(&self) -> ChannelResult<()> {
        let state = self.state();
        if state != ChannelState::Failed {
            return Err(ChannelError::InvalidState {
                expected: ChannelState::Failed.to_string(),
                actual: state.to_string(),
            });
        }
        info!("manual retry triggered");
        self.shared.retry.notify_one();
        Ok(())
    }
}

impl std::fmt::Debug for NotificationChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationChannel")
            .field("state", &self.state())
            .field("endpoint", &self.shared.config.endpoint)
            .field("generation", &self.shared.bus.current_generation())
            .finish_non_exhaustive()
    }
}

/// Tears down a connection: invalidate the generation first, then signal
/// shutdown, join the task, and publish `Disconnected`.
async fn drop_connection(shared: &Arc<ChannelShared>, active: Option<ActiveConnection>) {
    if let Some(active) = active {
        shared.bus.advance_generation();
        let _ = active.shutdown_tx.send(true);
        // The task might be parked in `Failed`; wake it so it observes the
        // shutdown signal promptly.
        shared.retry.notify_waiters();

        let mut handle = active.handle;
        if tokio::time::timeout(TEARDOWN_JOIN_TIMEOUT, &mut handle)
            .await
            .is_err()
        {
            warn!(
                user_id = %active.session.user_id,
                generation = active.generation,
                "connection task did not stop in time; aborting"
            );
            handle.abort();
            let _ = handle.await;
        }
        info!(
            user_id = %active.session.user_id,
            generation = active.generation,
            "notification channel torn down"
        );
    }
    // Only writer besides the (now joined) task.
    let _ = shared.state_tx.send_if_modified(|current| {
        if *current == ChannelState::Disconnected {
            false
        } else {
            *current = ChannelState::Disconnected;
            true
        }
    });
}

/// Builds the websocket handshake request with the session credential
/// attached per the configured placement.
///
/// Query-parameter placement assumes a URL-safe token (the usual shape for
/// opaque bearer tokens); header placement validates the value.
fn build_handshake_request(
    config: &ChannelConfig,
    session: &Session,
) -> ChannelResult<tungstenite::handshake::client::Request> {
    match &config.credential {
        CredentialPlacement::QueryParam { name } => {
            let separator = if config.endpoint.contains('?') { '&' } else { '?' };
            let url = format!("{}{}{}={}", config.endpoint, separator, name, session.token);
            url.into_client_request()
                .map_err(|e| ChannelError::Configuration(format!("invalid endpoint: {e}")))
        }
        CredentialPlacement::Header { name, prefix } => {
            let mut request = config
                .endpoint
                .as_str()
                .into_client_request()
                .map_err(|e| ChannelError::Configuration(format!("invalid endpoint: {e}")))?;
            let header = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| ChannelError::Configuration(format!("invalid header name: {e}")))?;
            let value = HeaderValue::from_str(&format!("{prefix}{}", session.token))
                .map_err(|e| ChannelError::Configuration(format!("invalid credential: {e}")))?;
            request.headers_mut().insert(header, value);
            Ok(request)
        }
        CredentialPlacement::FirstFrame => config
            .endpoint
            .as_str()
            .into_client_request()
            .map_err(|e| ChannelError::Configuration(format!("invalid endpoint: {e}"))),
    }
}

/// The JSON auth message sent as the first frame when
/// [`CredentialPlacement::FirstFrame`] is configured.
fn first_frame_auth(session: &Session) -> String {
    serde_json::json!({"type": "auth", "token": session.token}).to_string()
}

/// The connection task: dial, read, back off, repeat -- until shutdown or a
/// session boundary.
#[allow(clippy::too_many_lines)]
async fn run_connection(
    shared: Arc<ChannelShared>,
    session: Session,
    generation: u64,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut policy = ReconnectPolicy::new(shared.config.reconnect.clone());
    // Set once the channel enters `Reconnecting`; the next successful dial
    // then emits `Reconnected` so consumers reconcile backlog.
    let mut resumed = false;

    'dial: loop {
        if *shutdown_rx.borrow() {
            break;
        }

        // Re-validate the gate before dialing: a session that ended (or was
        // replaced) mid-backoff must not reconnect.
        let session = match shared.store.current() {
            Some(current) if current.user_id == session.user_id => current,
            _ => {
                debug!(user_id = %session.user_id, "session ended; abandoning dial");
                break;
            }
        };

        // A fresh budget cycle dials as `Connecting`; mid-budget redials
        // stay `Reconnecting`.
        if policy.attempt() == 0 {
            shared.set_state(generation, ChannelState::Connecting);
        }

        let request = match build_handshake_request(&shared.config, &session) {
            Ok(request) => request,
            Err(e) => {
                warn!(error = %e, "cannot build handshake request");
                shared.set_state(generation, ChannelState::Failed);
                let _ = shared.lifecycle_tx.send(LifecycleSignal::Failed {
                    attempts: policy.attempt(),
                });
                tokio::select! {
                    () = shared.retry.notified() => {
                        if *shutdown_rx.borrow() {
                            break 'dial;
                        }
                        policy.reset();
                        continue 'dial;
                    }
                    _ = shutdown_rx.changed() => break 'dial,
                }
            }
        };

        match tokio::time::timeout(
            shared.config.handshake_timeout,
            tokio_tungstenite::connect_async(request),
        )
        .await
        {
            Ok(Ok((stream, _response))) => {
                policy.reset();
                let (mut write, mut read) = stream.split();

                if matches!(shared.config.credential, CredentialPlacement::FirstFrame) {
                    if let Err(e) = write
                        .send(tungstenite::Message::Text(
                            first_frame_auth(&session).into(),
                        ))
                        .await
                    {
                        warn!(error = %e, "failed to send auth frame");
                        resumed = true;
                        shared.set_state(generation, ChannelState::Reconnecting);
                        if !backoff_or_park(&shared, generation, &mut policy, &mut shutdown_rx)
                            .await
                        {
                            break 'dial;
                        }
                        continue 'dial;
                    }
                }

                shared.set_state(generation, ChannelState::Connected);
                info!(endpoint = %shared.config.endpoint, generation, "channel connected");
                if resumed {
                    let _ = shared.lifecycle_tx.send(LifecycleSignal::Reconnected);
                    info!("reconnected; consumers should reconcile backlog");
                }

                // Read loop: dispatch in receipt order for this instance.
                let drop_reason = loop {
                    tokio::select! {
                        msg = read.next() => match msg {
                            Some(Ok(tungstenite::Message::Text(text))) => {
                                dispatch_frame(&shared, generation, text.as_str());
                            }
                            Some(Ok(tungstenite::Message::Binary(data))) => {
                                match std::str::from_utf8(&data) {
                                    Ok(text) => dispatch_frame(&shared, generation, text),
                                    Err(_) => debug!("ignoring non-utf8 binary frame"),
                                }
                            }
                            Some(Ok(tungstenite::Message::Ping(data))) => {
                                let _ = write.send(tungstenite::Message::Pong(data)).await;
                            }
                            Some(Ok(tungstenite::Message::Close(_))) => {
                                break ChannelError::UnexpectedDrop(
                                    "server sent close frame".into(),
                                );
                            }
                            Some(Ok(_)) => {} // Pong, Frame -- ignore
                            Some(Err(e)) => {
                                break ChannelError::UnexpectedDrop(format!("read error: {e}"));
                            }
                            None => break ChannelError::UnexpectedDrop("stream ended".into()),
                        },
                        _ = shutdown_rx.changed() => {
                            debug!("shutdown observed in read loop; closing transport");
                            let _ = write.send(tungstenite::Message::Close(None)).await;
                            break 'dial;
                        }
                    }
                };

                warn!(error = %drop_reason, "connection dropped");
                resumed = true;
                shared.set_state(generation, ChannelState::Reconnecting);
            }
            Ok(Err(e)) => {
                let err = ChannelError::HandshakeFailed(e.to_string());
                warn!(error = %err, "dial failed");
                resumed = true;
                shared.set_state(generation, ChannelState::Reconnecting);
            }
            Err(_elapsed) => {
                let err = ChannelError::HandshakeFailed(format!(
                    "timed out after {:?}",
                    shared.config.handshake_timeout
                ));
                warn!(endpoint = %shared.config.endpoint, error = %err, "dial failed");
                resumed = true;
                shared.set_state(generation, ChannelState::Reconnecting);
            }
        }

        if !backoff_or_park(&shared, generation, &mut policy, &mut shutdown_rx).await {
            break 'dial;
        }
    }

    shared.set_state(generation, ChannelState::Disconnected);
    debug!(generation, "connection task finished");
}

/// Waits out the next backoff delay, or parks in `Failed` when the budget
/// is exhausted until a manual retry. Returns `false` if shutdown was
/// observed and the task should exit.
async fn backoff_or_park(
    shared: &ChannelShared,
    generation: u64,
    policy: &mut ReconnectPolicy,
    shutdown_rx: &mut watch::Receiver<bool>,
) -> bool {
    match policy.next_delay() {
        Some(delay) => {
            tokio::select! {
                () = tokio::time::sleep(delay) => true,
                _ = shutdown_rx.changed() => false,
            }
        }
        None => {
            let err = ChannelError::RetryBudgetExhausted {
                attempts: policy.attempt(),
            };
            shared.set_state(generation, ChannelState::Failed);
            let _ = shared.lifecycle_tx.send(LifecycleSignal::Failed {
                attempts: policy.attempt(),
            });
            warn!(error = %err, "entering Failed; awaiting manual retry");
            tokio::select! {
                () = shared.retry.notified() => {
                    if *shutdown_rx.borrow() {
                        return false;
                    }
                    policy.reset();
                    true
                }
                _ = shutdown_rx.changed() => false,
            }
        }
    }
}

/// Decodes one inbound frame and dispatches it on the bus.
fn dispatch_frame(shared: &ChannelShared, generation: u64, frame: &str) {
    if frame.len() > shared.config.max_message_size {
        warn!(
            size = frame.len(),
            max = shared.config.max_message_size,
            "frame exceeds max size, dropping"
        );
        return;
    }
    match InboundEvent::decode(frame) {
        Ok(event) => {
            if let EventKind::Unknown(ref kind) = event.kind {
                debug!(kind = %kind, event_id = %event.id, "ignoring unknown event type");
                return;
            }
            let outcome = shared.bus.dispatch(&event, generation);
            debug!(
                event_id = %event.id,
                delivered = outcome.delivered,
                faulted = outcome.faulted,
                stale = outcome.stale,
                "event dispatched"
            );
        }
        Err(e) => {
            warn!(error = %e, "skipping malformed frame");
        }
    }
}
