//! Cross-node replication fabric: a topic-keyed publish/subscribe contract plus the dedupe set
//! that makes replicated delivery idempotent.
//!
//! A topic map with per-subscription delivery, each publication tagged with the publishing
//! node's id so subscribers can filter their own publications back out (self-echo suppression).

mod dedupe;
mod memory;

pub use dedupe::Dedupe;
pub use memory::InMemoryPubSub;

use async_trait::async_trait;
use bytes::Bytes;

/// Identifies the broker process that published a message, so subscribers can filter their own
/// publications back out (self-echo suppression).
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A topic string, e.g. `document/{namespacedId}` or `client/{clientId}`.
pub type Topic = String;

pub fn document_topic(namespaced_doc_id: &docsync_proto::NamespacedDocId) -> Topic {
    format!("document/{namespaced_doc_id}")
}

pub fn client_topic(client_id: &docsync_proto::ClientId) -> Topic {
    format!("client/{client_id}")
}

/// A single delivered publication.
#[derive(Clone, Debug)]
pub struct Delivery {
    pub topic: Topic,
    pub payload: Bytes,
    pub origin: NodeId,
}

/// A handler invoked once per delivery on a subscription. Deliveries to one subscription are
/// always serialized; the fabric may run distinct subscriptions' handlers concurrently.
#[async_trait]
pub trait DeliveryHandler: Send + Sync {
    async fn handle(&self, delivery: Delivery);
}

/// An opaque unsubscribe token; dropping it does not unsubscribe — callers must call
/// `PubSub::unsubscribe` explicitly so disposal stays an auditable action, mirroring the
/// session's own disposal guard.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u64);

/// Cross-node replication contract. An implementation may be in-process (this crate's
/// [`InMemoryPubSub`]) or backed by a distributed broker (Redis streams, NATS, Kafka, ...);
/// any implementation meeting this contract is acceptable.
#[async_trait]
pub trait PubSub: Send + Sync {
    /// Registers `handler` for `topic`. Returns a token that can later be passed to
    /// `unsubscribe`.
    async fn subscribe(&self, topic: Topic, handler: std::sync::Arc<dyn DeliveryHandler>) -> SubscriptionId;

    /// Removes a previously registered subscription. No-op if already removed.
    async fn unsubscribe(&self, topic: &Topic, id: SubscriptionId);

    /// Publishes `payload` to every current subscriber of `topic`, tagged with `origin`.
    async fn publish(&self, topic: Topic, payload: Bytes, origin: NodeId);

    /// Releases all resources held by this fabric. Idempotent.
    async fn dispose(&self);
}
