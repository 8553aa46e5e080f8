pub mod listener;
pub mod messages;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::config::CHANNEL_CAPACITY;
use crate::types::{ChangeEvent, Notification};

/// In-process fan-out over the remote change-notification stream.
///
/// Delivery is at-least-once with no ordering guarantee across tables —
/// subscribers must treat a notification as "something changed, re-read",
/// never as a diff to apply.
pub struct ChangeBus {
    next_id: AtomicU64,
    subs: DashMap<u64, SubEntry>,
}

struct SubEntry {
    table: String,
    filter: ChangeEvent,
    tx: mpsc::Sender<Notification>,
}

/// Returned by `subscribe`. The `id` unsubscribes; the receiver yields the
/// matching notifications.
pub struct SubscriptionHandle {
    pub id: u64,
    pub rx: mpsc::Receiver<Notification>,
}

impl ChangeBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            next_id: AtomicU64::new(1),
            subs: DashMap::new(),
        })
    }

    pub fn subscribe(&self, table: &str, filter: ChangeEvent) -> SubscriptionHandle {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subs.insert(
            id,
            SubEntry {
                table: table.to_string(),
                filter,
                tx,
            },
        );
        debug!(id, table, filter = %filter, "bus subscription opened");
        SubscriptionHandle { id, rx }
    }

    /// Returns false if the id was already gone. Dropping the entry closes
    /// the subscriber's receiver, so any forwarding task unwinds with it.
    pub fn unsubscribe(&self, id: u64) -> bool {
        let removed = self.subs.remove(&id).is_some();
        if removed {
            debug!(id, "bus subscription closed");
        }
        removed
    }

    /// Fan a notification out to every matching subscription. Returns the
    /// number of deliveries. Slow subscribers lose notifications rather than
    /// stall the feed — the poll backstop covers the gap.
    pub fn publish(&self, notification: &Notification) -> usize {
        let mut delivered = 0;
        for entry in self.subs.iter() {
            if entry.table != notification.table || !entry.filter.matches(notification.event) {
                continue;
            }
            match entry.tx.try_send(notification.clone()) {
                Ok(()) => delivered += 1,
                Err(e) => warn!(
                    table = %notification.table,
                    "bus subscriber channel full, dropping notification: {e}"
                ),
            }
        }
        delivered
    }

    pub fn subscription_count(&self) -> usize {
        self.subs.len()
    }
}

/// The set of live subscriptions owned by one coordinator. Opened together
/// on start, released together on teardown — no dangling channel survives a
/// restart.
pub struct SubscriptionSet {
    bus: Arc<ChangeBus>,
    ids: Vec<u64>,
}

impl SubscriptionSet {
    pub fn new(bus: Arc<ChangeBus>) -> Self {
        Self { bus, ids: Vec::new() }
    }

    pub fn track(&mut self, id: u64) {
        self.ids.push(id);
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Unsubscribe everything. Returns how many subscriptions were released.
    pub fn release(mut self) -> usize {
        let mut released = 0;
        for id in self.ids.drain(..) {
            if self.bus.unsubscribe(id) {
                released += 1;
            }
        }
        released
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn notification(table: &str, event: ChangeEvent) -> Notification {
        Notification {
            table: table.to_string(),
            event,
        }
    }

    #[tokio::test]
    async fn delivers_matching_table_and_event() {
        let bus = ChangeBus::new();
        let mut handle = bus.subscribe("markets", ChangeEvent::Update);

        let delivered = bus.publish(&notification("markets", ChangeEvent::Update));
        assert_eq!(delivered, 1);
        let n = handle.rx.try_recv().expect("notification expected");
        assert_eq!(n.table, "markets");
        assert_eq!(n.event, ChangeEvent::Update);
    }

    #[tokio::test]
    async fn filters_out_other_tables_and_events() {
        let bus = ChangeBus::new();
        let mut handle = bus.subscribe("markets", ChangeEvent::Update);

        assert_eq!(bus.publish(&notification("transactions", ChangeEvent::Update)), 0);
        assert_eq!(bus.publish(&notification("markets", ChangeEvent::Delete)), 0);
        assert!(handle.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn wildcard_filter_matches_every_event() {
        let bus = ChangeBus::new();
        let mut handle = bus.subscribe("markets", ChangeEvent::All);

        assert_eq!(bus.publish(&notification("markets", ChangeEvent::Insert)), 1);
        assert_eq!(bus.publish(&notification("markets", ChangeEvent::Delete)), 1);
        assert!(handle.rx.try_recv().is_ok());
        assert!(handle.rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn wildcard_event_reaches_specific_filters() {
        let bus = ChangeBus::new();
        let mut handle = bus.subscribe("markets", ChangeEvent::Update);

        assert_eq!(bus.publish(&notification("markets", ChangeEvent::All)), 1);
        assert!(handle.rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery_and_closes_channel() {
        let bus = ChangeBus::new();
        let mut handle = bus.subscribe("markets", ChangeEvent::All);

        assert!(bus.unsubscribe(handle.id));
        assert!(!bus.unsubscribe(handle.id), "second unsubscribe is a no-op");
        assert_eq!(bus.publish(&notification("markets", ChangeEvent::Update)), 0);
        // Sender side dropped with the entry — receiver reports disconnect.
        assert!(matches!(
            handle.rx.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));
    }

    #[tokio::test]
    async fn subscription_set_releases_everything_together() {
        let bus = ChangeBus::new();
        let mut set = SubscriptionSet::new(Arc::clone(&bus));
        let h1 = bus.subscribe("markets", ChangeEvent::All);
        let h2 = bus.subscribe("transactions", ChangeEvent::All);
        set.track(h1.id);
        set.track(h2.id);

        assert_eq!(bus.subscription_count(), 2);
        assert_eq!(set.release(), 2);
        assert_eq!(bus.subscription_count(), 0);
    }
}
