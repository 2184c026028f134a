//! Subscription bus for state-change notifications.
//!
//! Replaces ad hoc callback listeners with an explicit subscribe/unsubscribe
//! abstraction. Delivery is at-least-once per subscriber, in registration
//! order, through unbounded channels so emitters never block.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tokio::sync::mpsc;

struct SubscriberEntry<T> {
    id: u64,
    tx: mpsc::UnboundedSender<T>,
}

/// A live subscription. Dropping the subscription detaches it; the bus prunes
/// the dead sender on the next emit.
pub struct Subscription<T> {
    id: u64,
    rx: mpsc::UnboundedReceiver<T>,
}

impl<T> Subscription<T> {
    /// Stable identifier, usable with [`EventBus::unsubscribe`].
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Wait for the next event. Returns `None` once unsubscribed.
    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    /// Non-blocking poll for a buffered event.
    pub fn try_recv(&mut self) -> Option<T> {
        self.rx.try_recv().ok()
    }
}

/// Fan-out event channel with explicit lifecycle.
pub struct EventBus<T> {
    subscribers: Mutex<Vec<SubscriberEntry<T>>>,
    next_id: AtomicU64,
}

impl<T: Clone> EventBus<T> {
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn subscribe(&self) -> Subscription<T> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        if let Ok(mut subs) = self.subscribers.lock() {
            subs.push(SubscriberEntry { id, tx });
        }
        Subscription { id, rx }
    }

    /// Detach a subscriber. Returns false when the id was not registered.
    pub fn unsubscribe(&self, id: u64) -> bool {
        let Ok(mut subs) = self.subscribers.lock() else {
            return false;
        };
        let before = subs.len();
        subs.retain(|entry| entry.id != id);
        subs.len() != before
    }

    /// Deliver `event` to every live subscriber in registration order,
    /// pruning subscribers whose receiving end is gone.
    pub fn emit(&self, event: &T) {
        let Ok(mut subs) = self.subscribers.lock() else {
            return;
        };
        subs.retain(|entry| entry.tx.send(event.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().map(|s| s.len()).unwrap_or(0)
    }
}

impl<T: Clone> Default for EventBus<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_events_delivered_in_registration_order() {
        let bus: EventBus<u32> = EventBus::new();
        let mut first = bus.subscribe();
        let mut second = bus.subscribe();

        bus.emit(&7);
        bus.emit(&8);

        assert_eq!(first.try_recv(), Some(7));
        assert_eq!(first.try_recv(), Some(8));
        assert_eq!(second.try_recv(), Some(7));
        assert_eq!(second.try_recv(), Some(8));
        assert_eq!(first.try_recv(), None);
    }

    #[test]
    fn test_unsubscribe_stops_delivery() {
        let bus: EventBus<&'static str> = EventBus::new();
        let mut sub = bus.subscribe();

        bus.emit(&"before");
        assert!(bus.unsubscribe(sub.id()));
        bus.emit(&"after");

        assert_eq!(sub.try_recv(), Some("before"));
        assert_eq!(sub.try_recv(), None);
        assert!(!bus.unsubscribe(sub.id()));
    }

    #[test]
    fn test_dropped_subscriber_is_pruned_on_emit() {
        let bus: EventBus<u32> = EventBus::new();
        let sub = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 1);

        drop(sub);
        bus.emit(&1);
        assert_eq!(bus.subscriber_count(), 0);
    }
}
