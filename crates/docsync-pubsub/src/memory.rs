//! In-memory [`PubSub`] implementation for single-node deployments and tests.
//!
//! Structured as a topic map guarded by a `parking_lot::Mutex`, each entry a `Vec` of
//! `(SubscriptionId, handler)` pairs.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::{Delivery, DeliveryHandler, NodeId, PubSub, SubscriptionId, Topic};

struct Subscription {
    id: SubscriptionId,
    handler: Arc<dyn DeliveryHandler>,
}

#[derive(Default)]
pub struct InMemoryPubSub {
    topics: Mutex<HashMap<Topic, Vec<Subscription>>>,
    next_id: AtomicU64,
    disposed: Mutex<bool>,
}

impl InMemoryPubSub {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PubSub for InMemoryPubSub {
    async fn subscribe(&self, topic: Topic, handler: Arc<dyn DeliveryHandler>) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.topics
            .lock()
            .entry(topic.clone())
            .or_default()
            .push(Subscription { id: id.clone(), handler });
        trace!(%topic, subscription_id = id.0, "subscribed");
        id
    }

    async fn unsubscribe(&self, topic: &Topic, id: SubscriptionId) {
        let mut topics = self.topics.lock();
        if let Some(subs) = topics.get_mut(topic) {
            subs.retain(|s| s.id != id);
            if subs.is_empty() {
                topics.remove(topic);
            }
        }
        trace!(%topic, subscription_id = id.0, "unsubscribed");
    }

    async fn publish(&self, topic: Topic, payload: Bytes, origin: NodeId) {
        if *self.disposed.lock() {
            debug!(%topic, "dropping publish: fabric already disposed");
            return;
        }
        let handlers: Vec<_> = {
            let topics = self.topics.lock();
            topics
                .get(&topic)
                .map(|subs| subs.iter().map(|s| s.handler.clone()).collect())
                .unwrap_or_default()
        };
        trace!(%topic, %origin, subscriber_count = handlers.len(), "publishing");
        for handler in handlers {
            let delivery = Delivery {
                topic: topic.clone(),
                payload: payload.clone(),
                origin: origin.clone(),
            };
            handler.handle(delivery).await;
        }
    }

    async fn dispose(&self) {
        *self.disposed.lock() = true;
        self.topics.lock().clear();
        debug!("in-memory pubsub fabric disposed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::Notify;

    struct CountingHandler {
        count: Arc<AtomicUsize>,
        notify: Arc<Notify>,
    }

    #[async_trait]
    impl DeliveryHandler for CountingHandler {
        async fn handle(&self, _delivery: Delivery) {
            self.count.fetch_add(1, Ordering::SeqCst);
            self.notify.notify_one();
        }
    }

    #[tokio::test]
    async fn delivers_to_all_subscribers() {
        let pubsub = InMemoryPubSub::new();
        let count = Arc::new(AtomicUsize::new(0));
        let notify = Arc::new(Notify::new());
        let handler = Arc::new(CountingHandler {
            count: count.clone(),
            notify: notify.clone(),
        });

        pubsub.subscribe("document/d1".to_string(), handler.clone()).await;
        pubsub.subscribe("document/d1".to_string(), handler).await;

        pubsub
            .publish("document/d1".to_string(), Bytes::from_static(b"x"), NodeId::generate())
            .await;

        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery() {
        let pubsub = InMemoryPubSub::new();
        let count = Arc::new(AtomicUsize::new(0));
        let notify = Arc::new(Notify::new());
        let handler = Arc::new(CountingHandler {
            count: count.clone(),
            notify,
        });

        let id = pubsub.subscribe("document/d1".to_string(), handler).await;
        pubsub.unsubscribe(&"document/d1".to_string(), id).await;

        pubsub
            .publish("document/d1".to_string(), Bytes::from_static(b"x"), NodeId::generate())
            .await;

        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn dispose_drops_subscriptions_and_ignores_further_publishes() {
        let pubsub = InMemoryPubSub::new();
        let count = Arc::new(AtomicUsize::new(0));
        let notify = Arc::new(Notify::new());
        let handler = Arc::new(CountingHandler { count: count.clone(), notify });

        pubsub.subscribe("document/d1".to_string(), handler).await;
        pubsub.dispose().await;
        pubsub
            .publish("document/d1".to_string(), Bytes::from_static(b"x"), NodeId::generate())
            .await;

        assert_eq!(count.load(Ordering::SeqCst), 0);
    }
}
