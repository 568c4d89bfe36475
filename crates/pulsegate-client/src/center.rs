//! Built-in notification consumer.
//!
//! [`NotificationCenter`] subscribes to the channel's event bus and
//! maintains the id -> read/unread record map exposed to the UI layer:
//! an ordered snapshot (most-recent-first by `created_at`) and a derived
//! unread count. It clears its own state when the session boundary guard
//! signals teardown, independent of subscription teardown.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use pulsegate_core::{
    ChannelResult, EventKind, InboundEvent, LifecycleSignal, NotificationRecord,
};

use crate::bus::{EventFilter, Subscription};
use crate::channel::NotificationChannel;

/// External history API used for backlog reconciliation after a reconnect.
///
/// The channel offers no replay guarantee, so after
/// [`LifecycleSignal::Reconnected`] the center fetches records created
/// since the newest one it holds and merges them in.
#[async_trait]
pub trait BacklogSource: Send + Sync {
    /// Fetches records created after `since` (epoch millis).
    async fn fetch_since(&self, since: i64) -> ChannelResult<Vec<NotificationRecord>>;
}

/// Shared record map.
type RecordMap = Arc<RwLock<HashMap<String, NotificationRecord>>>;

/// The notification record store.
pub struct NotificationCenter {
    /// Records keyed by notification id.
    records: RecordMap,
    /// Live bus registration, if attached.
    subscription: Mutex<Option<Subscription>>,
    /// Backlog reconciliation task, if enabled.
    reconcile_task: Mutex<Option<JoinHandle<()>>>,
}

impl NotificationCenter {
    /// Creates an empty, detached center.
    #[must_use]
    pub fn new() -> Self {
        Self {
            records: Arc::new(RwLock::new(HashMap::new())),
            subscription: Mutex::new(None),
            reconcile_task: Mutex::new(None),
        }
    }

    /// Subscribes this center to a channel's event bus, replacing any
    /// previous attachment (the old subscription unregisters on drop).
    pub fn attach(&self, channel: &NotificationChannel) {
        let records = Arc::clone(&self.records);
        let subscription = channel.subscribe(
            EventFilter::Kinds(vec![
                EventKind::NotificationCreated,
                EventKind::NotificationRead,
            ]),
            Arc::new(move |event| apply_event(&records, event)),
        );
        *self.subscription.lock() = Some(subscription);
    }

    /// Drops the bus registration; the record map is left intact.
    pub fn detach(&self) {
        self.subscription.lock().take();
    }

    /// Enables backlog reconciliation: on every
    /// [`LifecycleSignal::Reconnected`], fetch records newer than the
    /// newest held one and merge them (insert-if-absent, so a locally read
    /// record is not reverted to unread).
    ///
    /// The merge re-checks the bus generation captured at the signal, so a
    /// fetch still in flight across a session boundary is discarded.
    pub fn enable_reconciliation(
        &self,
        channel: &NotificationChannel,
        source: Arc<dyn BacklogSource>,
    ) {
        let records = Arc::clone(&self.records);
        let bus = channel.bus();
        let mut lifecycle_rx = channel.subscribe_lifecycle();

        let handle = tokio::spawn(async move {
            loop {
                match lifecycle_rx.recv().await {
                    Ok(LifecycleSignal::Reconnected) => {
                        let generation = bus.current_generation();
                        let since = newest_created_at(&records);
                        match source.fetch_since(since).await {
                            Ok(backlog) => {
                                if bus.current_generation() != generation {
                                    debug!("discarding backlog fetched across a session boundary");
                                    continue;
                                }
                                let merged = merge_backlog(&records, backlog);
                                debug!(merged, "backlog reconciled");
                            }
                            Err(e) => warn!(error = %e, "backlog reconciliation failed"),
                        }
                    }
                    Ok(LifecycleSignal::Failed { .. }) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(skipped, "lifecycle receiver lagged");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        if let Some(old) = self.reconcile_task.lock().replace(handle) {
            old.abort();
        }
    }

    /// Applies a single inbound event to the record map.
    ///
    /// `NotificationCreated` inserts-or-replaces by id; `NotificationRead`
    /// marks the matching record read, and is a silent no-op for an unknown
    /// id (the record may arrive out of order relative to the read-mark).
    /// Unknown kinds are ignored.
    pub fn apply(&self, event: &InboundEvent) {
        apply_event(&self.records, event);
    }

    /// Returns records most-recent-first by `created_at` (display order;
    /// reconnects may redeliver backlog out of real-time order, so receipt
    /// order is not used).
    #[must_use]
    pub fn snapshot(&self) -> Vec<NotificationRecord> {
        let mut records: Vec<_> = self.records.read().values().cloned().collect();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.cmp(&b.id)));
        records
    }

    /// Returns the number of records with `read == false`.
    #[must_use]
    pub fn unread_count(&self) -> usize {
        self.records.read().values().filter(|r| !r.read).count()
    }

    /// Returns the number of held records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    /// Returns whether the center holds no records.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    /// Clears all records. Called by the session boundary guard during
    /// teardown; also safe for embedders to call directly.
    pub fn clear(&self) {
        self.records.write().clear();
        debug!("notification records cleared");
    }
}

impl Default for NotificationCenter {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for NotificationCenter {
    fn drop(&mut self) {
        if let Some(task) = self.reconcile_task.lock().take() {
            task.abort();
        }
    }
}

impl std::fmt::Debug for NotificationCenter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationCenter")
            .field("records", &self.len())
            .field("unread", &self.unread_count())
            .field("attached", &self.subscription.lock().is_some())
            .finish_non_exhaustive()
    }
}

/// Insert-if-absent merge of fetched backlog records into the record map.
///
/// An id already held locally wins: the live copy may carry a read-mark the
/// history API does not know about, and redelivered backlog must not revert
/// it. Returns the number of records inserted.
fn merge_backlog(records: &RecordMap, backlog: Vec<NotificationRecord>) -> usize {
    let mut map = records.write();
    let mut merged = 0usize;
    for record in backlog {
        if !map.contains_key(&record.id) {
            map.insert(record.id.clone(), record);
            merged += 1;
        }
    }
    merged
}

/// Returns the newest `created_at` held, or 0 when empty.
fn newest_created_at(records: &RecordMap) -> i64 {
    records
        .read()
        .values()
        .map(|r| r.created_at)
        .max()
        .unwrap_or(0)
}

/// Event application shared between the bus handler and [`NotificationCenter::apply`].
fn apply_event(records: &RecordMap, event: &InboundEvent) {
    match &event.kind {
        EventKind::NotificationCreated => match NotificationRecord::from_created(event) {
            Ok(record) => {
                records.write().insert(record.id.clone(), record);
            }
            Err(e) => warn!(event_id = %event.id, error = %e, "malformed created payload"),
        },
        EventKind::NotificationRead => {
            let mut map = records.write();
            if let Some(record) = map.get_mut(&event.id) {
                record.read = true;
            } else {
                // Read-mark raced ahead of the record itself -- not a fault.
                debug!(event_id = %event.id, "read-mark for unknown id ignored");
            }
        }
        EventKind::Unknown(kind) => {
            debug!(kind = %kind, "consumer ignoring unknown event kind");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn created(id: &str, created_at: i64) -> InboundEvent {
        InboundEvent {
            id: id.into(),
            kind: EventKind::NotificationCreated,
            payload: serde_json::json!({
                "title": format!("title-{id}"),
                "body": "b",
                "created_at": created_at,
            }),
            received_at: 0,
        }
    }

    fn read_mark(id: &str) -> InboundEvent {
        InboundEvent {
            id: id.into(),
            kind: EventKind::NotificationRead,
            payload: serde_json::Value::Null,
            received_at: 0,
        }
    }

    #[test]
    fn test_created_inserts_and_counts_unread() {
        let center = NotificationCenter::new();
        center.apply(&created("n1", 10));
        center.apply(&created("n2", 20));

        assert_eq!(center.len(), 2);
        assert_eq!(center.unread_count(), 2);
    }

    #[test]
    fn test_read_mark_known_id() {
        let center = NotificationCenter::new();
        center.apply(&created("n1", 10));
        center.apply(&read_mark("n1"));

        assert_eq!(center.unread_count(), 0);
        assert!(center.snapshot()[0].read);
    }

    #[test]
    fn test_read_mark_unknown_id_is_noop() {
        let center = NotificationCenter::new();
        center.apply(&read_mark("ghost"));
        assert!(center.is_empty());

        // A later create for that id arrives unread: the earlier read-mark
        // is not retroactive.
        center.apply(&created("ghost", 10));
        assert_eq!(center.unread_count(), 1);
    }

    #[test]
    fn test_created_replaces_by_id() {
        let center = NotificationCenter::new();
        center.apply(&created("n1", 10));
        center.apply(&read_mark("n1"));
        center.apply(&created("n1", 30)); // redelivery resets read state

        assert_eq!(center.len(), 1);
        assert_eq!(center.unread_count(), 1);
        assert_eq!(center.snapshot()[0].created_at, 30);
    }

    #[test]
    fn test_snapshot_most_recent_first() {
        let center = NotificationCenter::new();
        center.apply(&created("old", 10));
        center.apply(&created("new", 30));
        center.apply(&created("mid", 20));

        let ids: Vec<_> = center.snapshot().into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec!["new", "mid", "old"]);
    }

    #[test]
    fn test_unknown_kind_ignored() {
        let center = NotificationCenter::new();
        center.apply(&InboundEvent {
            id: "x".into(),
            kind: EventKind::Unknown("presence.changed".into()),
            payload: serde_json::Value::Null,
            received_at: 0,
        });
        assert!(center.is_empty());
    }

    #[test]
    fn test_clear_resets_state() {
        let center = NotificationCenter::new();
        center.apply(&created("n1", 10));
        center.clear();
        assert!(center.is_empty());
        assert_eq!(center.unread_count(), 0);
    }

    #[test]
    fn test_backlog_merge_preserves_read_flags() {
        let center = NotificationCenter::new();
        center.apply(&created("n1", 10));
        center.apply(&read_mark("n1"));

        // Backlog fetch redelivers n1 (unread upstream) alongside a new n2.
        let backlog = vec![
            NotificationRecord {
                id: "n1".into(),
                title: "t".into(),
                body: "b".into(),
                created_at: 10,
                read: false,
            },
            NotificationRecord {
                id: "n2".into(),
                title: "t".into(),
                body: "b".into(),
                created_at: 20,
                read: false,
            },
        ];
        let merged = merge_backlog(&center.records, backlog);

        // Only n2 was inserted; n1 stays read.
        assert_eq!(merged, 1);
        assert_eq!(center.len(), 2);
        assert_eq!(center.unread_count(), 1);
    }
}
