//! Durable message ledger
//!
//! The ledger is the per-cluster append-only event log everything else is
//! layered on: the bus publishes through it, triggers evaluate over it,
//! context is assembled from it, and crash resume replays it.
//!
//! Guarantees:
//! - Writes are durable before `append` returns
//! - A reader issuing `query` after `append` returned sees that record
//! - Records are totally ordered by `(timestamp, seq)`; timestamps are
//!   monotonic per ledger and `seq` breaks ties in insertion order

pub mod lock;
pub mod sqlite;

use crate::error::Result;
use crate::types::{ClusterId, Message, MessageContent, MessageId};
use async_trait::async_trait;
use serde_json::Value;

pub use lock::FileLock;
pub use sqlite::SqliteLedger;

/// A record to append: everything but the ledger-assigned fields
#[derive(Debug, Clone)]
pub struct MessageDraft {
    pub cluster_id: ClusterId,
    pub topic: String,
    pub sender: String,
    pub receiver: String,
    pub content: MessageContent,
    pub metadata: serde_json::Map<String, Value>,
}

impl MessageDraft {
    /// Draft with broadcast receiver and empty metadata
    pub fn new(
        cluster_id: ClusterId,
        topic: impl Into<String>,
        sender: impl Into<String>,
    ) -> Self {
        Self {
            cluster_id,
            topic: topic.into(),
            sender: sender.into(),
            receiver: crate::types::BROADCAST.to_string(),
            content: MessageContent::default(),
            metadata: serde_json::Map::new(),
        }
    }

    pub fn receiver(mut self, receiver: impl Into<String>) -> Self {
        self.receiver = receiver.into();
        self
    }

    pub fn content(mut self, content: MessageContent) -> Self {
        self.content = content;
        self
    }

    pub fn metadata(mut self, metadata: serde_json::Map<String, Value>) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn meta(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

/// Server-side filter for ledger reads
///
/// `since` is inclusive (`timestamp >= since`); `before` is exclusive.
/// When `limit` is set the *most recent* matching records are returned,
/// still in ascending order; context windows want the tail of the log,
/// not its head.
#[derive(Debug, Clone, Default)]
pub struct MessageFilter {
    pub topic: Option<String>,
    pub sender: Option<String>,
    pub receiver: Option<String>,
    pub since: Option<i64>,
    pub before: Option<i64>,
    pub limit: Option<u32>,
}

impl MessageFilter {
    /// Filter on a topic alone
    pub fn topic(topic: impl Into<String>) -> Self {
        Self {
            topic: Some(topic.into()),
            ..Default::default()
        }
    }

    pub fn sender(mut self, sender: impl Into<String>) -> Self {
        self.sender = Some(sender.into());
        self
    }

    pub fn since(mut self, since: i64) -> Self {
        self.since = Some(since);
        self
    }

    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// Append-only typed event log with an indexed query API
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Append a record: the ledger generates its `id`, assigns a
    /// monotonic `timestamp`, persists atomically, and returns the stored
    /// record.
    async fn append(&self, draft: MessageDraft) -> Result<Message>;

    /// All matching records in ascending `(timestamp, seq)` order
    async fn query(&self, filter: &MessageFilter) -> Result<Vec<Message>>;

    /// Newest matching record, if any
    async fn find_last(&self, filter: &MessageFilter) -> Result<Option<Message>>;

    /// Cardinality of the matching set
    async fn count(&self, filter: &MessageFilter) -> Result<u64>;

    /// Look up one record by id
    async fn get(&self, id: MessageId) -> Result<Option<Message>>;

    /// Release resources; the store is unusable afterwards
    async fn close(&self);
}
