//! Message bus
//!
//! Thin publish/subscribe layer over the ledger. `publish` appends to the
//! ledger first, then notifies in-process subscribers synchronously.
//! Subscribers must be short-running: the cluster dispatcher only enqueues
//! the record onto its own ordered channel, and long work happens in the
//! owning agent's execution slot.
//!
//! Subscriptions are in-process only and not durable; crash recovery comes
//! from ledger replay, not from the bus.

use crate::error::Result;
use crate::ledger::{LedgerStore, MessageDraft, MessageFilter};
use crate::types::{ClusterId, Message, MessageContent, BROADCAST};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tracing::debug;

/// Subscriber callback; invoked on the publish path
pub type SubscriberFn = Box<dyn Fn(&Message) + Send + Sync>;

/// Handle returned by subscribe calls; pass to `unsubscribe`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionId(u64);

/// Publish request: a draft without ledger- or bus-assigned fields
#[derive(Debug, Clone, Default)]
pub struct Publish {
    pub topic: String,
    pub sender: String,
    /// Defaults to `broadcast`
    pub receiver: Option<String>,
    pub content: MessageContent,
    pub metadata: serde_json::Map<String, Value>,
}

impl Publish {
    pub fn new(topic: impl Into<String>, sender: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            sender: sender.into(),
            ..Default::default()
        }
    }

    pub fn receiver(mut self, receiver: impl Into<String>) -> Self {
        self.receiver = Some(receiver.into());
        self
    }

    pub fn content(mut self, content: MessageContent) -> Self {
        self.content = content;
        self
    }

    pub fn text(mut self, text: impl Into<String>) -> Self {
        self.content.text = Some(text.into());
        self
    }

    pub fn data(mut self, data: Value) -> Self {
        self.content.data = Some(data);
        self
    }

    pub fn meta(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

struct Subscriber {
    id: u64,
    /// None subscribes to every topic
    topic: Option<String>,
    callback: SubscriberFn,
}

/// Publish/subscribe fan-out over one cluster's ledger
pub struct MessageBus {
    ledger: Arc<dyn LedgerStore>,
    cluster_id: ClusterId,
    subscribers: RwLock<Vec<Subscriber>>,
    next_id: AtomicU64,
}

impl MessageBus {
    pub fn new(ledger: Arc<dyn LedgerStore>, cluster_id: ClusterId) -> Self {
        Self {
            ledger,
            cluster_id,
            subscribers: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Cluster this bus serves
    pub fn cluster_id(&self) -> ClusterId {
        self.cluster_id
    }

    /// Underlying ledger
    pub fn ledger(&self) -> &Arc<dyn LedgerStore> {
        &self.ledger
    }

    /// Append a record and notify matching subscribers
    pub async fn publish(&self, publish: Publish) -> Result<Message> {
        let draft = MessageDraft {
            cluster_id: self.cluster_id,
            topic: publish.topic,
            sender: publish.sender,
            receiver: publish.receiver.unwrap_or_else(|| BROADCAST.to_string()),
            content: publish.content,
            metadata: publish.metadata,
        };
        let message = self.ledger.append(draft).await?;
        debug!(topic = %message.topic, sender = %message.sender, "published");

        let subscribers = self
            .subscribers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        for sub in subscribers.iter() {
            let matches = match &sub.topic {
                Some(topic) => *topic == message.topic,
                None => true,
            };
            if matches {
                (sub.callback)(&message);
            }
        }
        drop(subscribers);

        Ok(message)
    }

    /// Subscribe to one topic
    pub fn subscribe_topic(
        &self,
        topic: impl Into<String>,
        callback: SubscriberFn,
    ) -> SubscriptionId {
        self.add_subscriber(Some(topic.into()), callback)
    }

    /// Subscribe to every topic (dispatcher, log followers)
    pub fn subscribe_all(&self, callback: SubscriberFn) -> SubscriptionId {
        self.add_subscriber(None, callback)
    }

    fn add_subscriber(&self, topic: Option<String>, callback: SubscriberFn) -> SubscriptionId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(Subscriber {
                id,
                topic,
                callback,
            });
        SubscriptionId(id)
    }

    /// Remove a subscription; unknown ids are a no-op
    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.subscribers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .retain(|s| s.id != id.0);
    }

    /// Ledger query pass-through
    pub async fn query(&self, filter: &MessageFilter) -> Result<Vec<Message>> {
        self.ledger.query(filter).await
    }

    /// Ledger find-last pass-through
    pub async fn find_last(&self, filter: &MessageFilter) -> Result<Option<Message>> {
        self.ledger.find_last(filter).await
    }

    /// Ledger count pass-through
    pub async fn count(&self, filter: &MessageFilter) -> Result<u64> {
        self.ledger.count(filter).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::SqliteLedger;
    use crate::types::topic;
    use std::sync::atomic::AtomicUsize;

    async fn test_bus() -> (Arc<MessageBus>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let cluster_id = ClusterId::new();
        let ledger = SqliteLedger::open(dir.path(), cluster_id).await.unwrap();
        (Arc::new(MessageBus::new(Arc::new(ledger), cluster_id)), dir)
    }

    #[tokio::test]
    async fn test_publish_fills_broadcast_default() {
        let (bus, _dir) = test_bus().await;
        let msg = bus
            .publish(Publish::new(topic::ISSUE_OPENED, "user").text("hello"))
            .await
            .unwrap();
        assert_eq!(msg.receiver, BROADCAST);
        assert_eq!(msg.content.text.as_deref(), Some("hello"));
    }

    #[tokio::test]
    async fn test_topic_subscription_fires_after_append() {
        let (bus, _dir) = test_bus().await;
        let hits = Arc::new(AtomicUsize::new(0));

        let hits_clone = hits.clone();
        bus.subscribe_topic(
            "VALIDATION_RESULT",
            Box::new(move |msg| {
                assert_eq!(msg.topic, "VALIDATION_RESULT");
                hits_clone.fetch_add(1, Ordering::SeqCst);
            }),
        );

        bus.publish(Publish::new("VALIDATION_RESULT", "validator"))
            .await
            .unwrap();
        bus.publish(Publish::new("OTHER", "validator")).await.unwrap();

        assert_eq!(hits.load(Ordering::SeqCst), 1);

        // Both records hit the ledger regardless of subscriptions
        assert_eq!(bus.count(&MessageFilter::default()).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_subscribe_all_and_unsubscribe() {
        let (bus, _dir) = test_bus().await;
        let hits = Arc::new(AtomicUsize::new(0));

        let hits_clone = hits.clone();
        let sub = bus.subscribe_all(Box::new(move |_| {
            hits_clone.fetch_add(1, Ordering::SeqCst);
        }));

        bus.publish(Publish::new("A", "x")).await.unwrap();
        bus.publish(Publish::new("B", "x")).await.unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 2);

        bus.unsubscribe(sub);
        bus.publish(Publish::new("C", "x")).await.unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }
}
