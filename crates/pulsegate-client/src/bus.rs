//! Event fan-out bus.
//!
//! [`EventBus`] dispatches decoded inbound events to registered
//! subscribers. Each subscriber provides a kind filter and a handler
//! callback; a handler panic is isolated and logged without affecting
//! sibling subscribers or channel state (a `HandlerFault` is never fatal).
//!
//! The bus also owns the **generation token**: a monotonically increasing
//! id distinguishing successive channel activations. Every dispatch carries
//! the generation captured when its connection was opened; a mismatch with
//! the live generation means a session boundary has been observed since the
//! event was read, and the event is silently discarded.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, warn};

use pulsegate_core::{EventKind, InboundEvent};

/// Unique identifier for a bus subscription.
pub type SubscriptionId = u64;

/// Handler callback invoked for each delivered event.
pub type Handler = Arc<dyn Fn(&InboundEvent) + Send + Sync>;

/// Which event kinds a subscription wants to receive.
#[derive(Debug, Clone)]
pub enum EventFilter {
    /// Receive every known event kind.
    All,
    /// Receive only the listed kinds.
    Kinds(Vec<EventKind>),
}

impl EventFilter {
    /// Returns whether an event of `kind` passes this filter.
    #[must_use]
    pub fn matches(&self, kind: &EventKind) -> bool {
        match self {
            Self::All => true,
            Self::Kinds(kinds) => kinds.contains(kind),
        }
    }
}

/// Per-subscriber state.
struct SubscriberState {
    filter: EventFilter,
    handler: Handler,
}

/// Outcome of a single dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchOutcome {
    /// Subscribers whose handler ran to completion.
    pub delivered: u64,
    /// Subscribers whose handler panicked (isolated).
    pub faulted: u64,
    /// Whether the event was discarded as stale (generation mismatch).
    pub stale: bool,
}

/// Fan-out bus with generation-guarded dispatch.
pub struct EventBus {
    /// Registered subscribers keyed by id.
    subscribers: RwLock<HashMap<SubscriptionId, SubscriberState>>,
    /// Next subscription id.
    next_id: AtomicU64,
    /// Live generation; bumped on every activation boundary.
    generation: AtomicU64,
}

impl EventBus {
    /// Creates an empty bus at generation zero.
    #[must_use]
    pub fn new() -> Self {
        Self {
            subscribers: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            generation: AtomicU64::new(0),
        }
    }

    /// Returns the live generation.
    #[must_use]
    pub fn current_generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Bumps the generation, invalidating every dispatch captured under an
    /// older one. Returns the new generation.
    pub fn advance_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Registers a subscriber and returns its [`Subscription`] guard.
    ///
    /// The subscription unregisters itself on drop, so a torn-down consumer
    /// can never be dispatched into.
    pub fn subscribe(self: &Arc<Self>, filter: EventFilter, handler: Handler) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers
            .write()
            .insert(id, SubscriberState { filter, handler });
        debug!(subscription_id = id, "subscriber registered");
        Subscription {
            id,
            bus: Arc::clone(self),
        }
    }

    /// Returns the number of registered subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }

    /// Dispatches an event captured under `generation` to all matching
    /// subscribers, in an unspecified subscriber order.
    ///
    /// If `generation` no longer matches the live generation the event is
    /// discarded: the connection instance that read it has been invalidated
    /// by a session boundary.
    pub fn dispatch(&self, event: &InboundEvent, generation: u64) -> DispatchOutcome {
        if generation != self.current_generation() {
            debug!(
                event_id = %event.id,
                captured = generation,
                live = self.current_generation(),
                "discarding stale dispatch from invalidated connection"
            );
            return DispatchOutcome {
                delivered: 0,
                faulted: 0,
                stale: true,
            };
        }

        let subscribers = self.subscribers.read();
        let mut delivered = 0u64;
        let mut faulted = 0u64;

        for (&id, state) in subscribers.iter() {
            if !state.filter.matches(&event.kind) {
                continue;
            }
            let handler = Arc::clone(&state.handler);
            match catch_unwind(AssertUnwindSafe(|| handler(event))) {
                Ok(()) => delivered += 1,
                Err(_) => {
                    faulted += 1;
                    warn!(
                        subscription_id = id,
                        event_id = %event.id,
                        "subscriber handler panicked; fault isolated"
                    );
                }
            }
        }

        DispatchOutcome {
            delivered,
            faulted,
            stale: false,
        }
    }

    /// Removes a subscriber by id, returning whether it existed.
    fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let removed = self.subscribers.write().remove(&id).is_some();
        if removed {
            debug!(subscription_id = id, "subscriber removed");
        }
        removed
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.subscriber_count())
            .field("generation", &self.current_generation())
            .finish_non_exhaustive()
    }
}

/// RAII registration with the bus; unregisters on drop.
pub struct Subscription {
    id: SubscriptionId,
    bus: Arc<EventBus>,
}

impl Subscription {
    /// Returns this subscription's id.
    #[must_use]
    pub fn id(&self) -> SubscriptionId {
        self.id
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.bus.unsubscribe(self.id);
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}
