//! Broadcast bus for session lifecycle events.
//!
//! The controller publishes every state change here; the webhook forwarder,
//! log sinks and tests subscribe. Publishing never blocks and never fails:
//! events are simply dropped when nobody is listening.

use crate::events::LifecycleEvent;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;
use tracing::trace;

/// Default capacity for the broadcast channel.
const DEFAULT_BROADCAST_CAPACITY: usize = 256;

/// Cloneable handle to the lifecycle event bus.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<EventBusInner>,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

struct EventBusInner {
    tx: broadcast::Sender<LifecycleEvent>,
    published: AtomicU64,
    unobserved: AtomicU64,
}

/// Event bus statistics.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BusStats {
    /// Total events published.
    pub published: u64,
    /// Events published while no subscriber was attached.
    pub unobserved: u64,
}

impl EventBus {
    /// Create a bus with the default capacity.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_BROADCAST_CAPACITY)
    }

    /// Create a bus whose subscribers may lag by up to `capacity` events.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            inner: Arc::new(EventBusInner {
                tx,
                published: AtomicU64::new(0),
                unobserved: AtomicU64::new(0),
            }),
        }
    }

    /// Publish an event to all current subscribers.
    pub fn publish(&self, event: LifecycleEvent) {
        trace!(token = %event.token, kind = ?event.kind, "publishing lifecycle event");
        self.inner.published.fetch_add(1, Ordering::Relaxed);
        if self.inner.tx.send(event).is_err() {
            self.inner.unobserved.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Subscribe to events published from now on.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.inner.tx.subscribe()
    }

    /// Number of attached subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.inner.tx.receiver_count()
    }

    /// Current counters.
    #[must_use]
    pub fn stats(&self) -> BusStats {
        BusStats {
            published: self.inner.published.load(Ordering::Relaxed),
            unobserved: self.inner.unobserved.load(Ordering::Relaxed),
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::LifecycleKind;

    #[tokio::test]
    async fn test_broadcast_to_all_subscribers() {
        let bus = EventBus::new();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();

        bus.publish(LifecycleEvent::new("T1", LifecycleKind::Authenticated));

        assert_eq!(a.recv().await.unwrap().token, "T1");
        assert_eq!(b.recv().await.unwrap().kind, LifecycleKind::Authenticated);
        assert_eq!(bus.subscriber_count(), 2);
    }

    #[test]
    fn test_publish_without_subscribers() {
        let bus = EventBus::new();
        bus.publish(LifecycleEvent::new("T1", LifecycleKind::Removed));

        let stats = bus.stats();
        assert_eq!(stats.published, 1);
        assert_eq!(stats.unobserved, 1);
    }
}
