use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::broadcast;
use tracing::debug;

use super::types::DomainEvent;

/// Publish/subscribe channel for [`DomainEvent`]s. Late subscribers only see
/// events published after they subscribed.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<DomainEvent>,
    published: Arc<AtomicU64>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            published: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DomainEvent> {
        self.tx.subscribe()
    }

    /// Publishes `event`, returning how many subscribers received it.
    pub fn emit(&self, event: DomainEvent) -> usize {
        self.published.fetch_add(1, Ordering::Relaxed);
        let name = event.name();
        match self.tx.send(event) {
            Ok(receivers) => {
                debug!(event = name, receivers, "domain event published");
                receivers
            }
            Err(_) => {
                debug!(event = name, "domain event published (no subscribers)");
                0
            }
        }
    }

    #[inline]
    pub fn metrics_published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_in_publish_order() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();
        assert_eq!(bus.emit(DomainEvent::ItemsChanged(vec![1])), 1);
        bus.emit(DomainEvent::Loaded);
        assert_eq!(rx.recv().await.unwrap(), DomainEvent::ItemsChanged(vec![1]));
        assert_eq!(rx.recv().await.unwrap(), DomainEvent::Loaded);
        assert_eq!(bus.metrics_published(), 2);
    }

    #[test]
    fn emit_without_subscribers_is_fine() {
        let bus = EventBus::default();
        assert_eq!(bus.emit(DomainEvent::LibrariesRemoved(vec![2])), 0);
    }
}
