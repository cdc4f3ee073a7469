//! In-memory event bus.

use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::mpsc;

use crate::bus::{EventBus, Subscription, SubscriptionId};

#[derive(Debug, thiserror::Error)]
pub enum InMemoryBusError {
    /// Publish failed due to internal lock poisoning.
    #[error("event bus lock poisoned")]
    Poisoned,
}

/// In-memory pub/sub bus.
///
/// - No IO
/// - Best-effort fan-out over unbounded channels
/// - Dead subscribers are pruned while publishing
#[derive(Debug)]
pub struct InMemoryEventBus<M> {
    subscribers: Mutex<Vec<(SubscriptionId, mpsc::UnboundedSender<M>)>>,
    next_id: AtomicU64,
}

impl<M> InMemoryEventBus<M> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().map(|s| s.len()).unwrap_or(0)
    }
}

impl<M> Default for InMemoryEventBus<M> {
    fn default() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }
}

impl<M> EventBus<M> for InMemoryEventBus<M>
where
    M: Clone + Send + 'static,
{
    type Error = InMemoryBusError;

    fn publish(&self, message: M) -> Result<(), Self::Error> {
        let mut subs = self
            .subscribers
            .lock()
            .map_err(|_| InMemoryBusError::Poisoned)?;

        // Drop any dead subscribers while publishing.
        subs.retain(|(id, tx)| {
            let alive = tx.send(message.clone()).is_ok();
            if !alive {
                tracing::trace!(subscription = %id, "pruned closed subscription");
            }
            alive
        });

        Ok(())
    }

    fn subscribe(&self) -> Subscription<M> {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));

        // If the lock is poisoned we still return a subscription;
        // it just never receives messages.
        if let Ok(mut subs) = self.subscribers.lock() {
            subs.push((id, tx));
        }

        Subscription::new(id, rx)
    }

    fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let Ok(mut subs) = self.subscribers.lock() else {
            return false;
        };
        let before = subs.len();
        subs.retain(|(sub_id, _)| *sub_id != id);
        subs.len() != before
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn every_subscriber_receives_published_messages() {
        let bus = InMemoryEventBus::<u32>::new();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();

        bus.publish(7).unwrap();

        assert_eq!(a.recv().await, Some(7));
        assert_eq!(b.recv().await, Some(7));
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery_and_closes_stream() {
        let bus = InMemoryEventBus::<&'static str>::new();
        let mut sub = bus.subscribe();

        assert!(bus.unsubscribe(sub.id()));
        assert!(!bus.unsubscribe(sub.id()));

        bus.publish("ignored").unwrap();
        assert_eq!(sub.recv().await, None);
    }

    #[test]
    fn dropped_subscriptions_are_pruned_on_publish() {
        let bus = InMemoryEventBus::<u8>::new();
        let sub = bus.subscribe();
        let _keep = bus.subscribe();
        drop(sub);

        bus.publish(1).unwrap();
        assert_eq!(bus.subscriber_count(), 1);
    }

    #[test]
    fn late_subscribers_only_see_later_messages() {
        let bus = InMemoryEventBus::<u8>::new();
        bus.publish(1).unwrap();
        let mut sub = bus.subscribe();
        bus.publish(2).unwrap();
        assert_eq!(sub.drain(), vec![2]);
    }
}
