//! SQLite ledger backend
//!
//! One database file per cluster at `<state_dir>/<cluster_id>.db`,
//! guarded by a sibling lock file. Appends are serialized behind an
//! internal mutex so assigned timestamps are monotonic and tie-breaking
//! follows insertion order.

use crate::error::{HarmoniaError, Result};
use crate::ledger::lock::FileLock;
use crate::ledger::{LedgerStore, MessageDraft, MessageFilter};
use crate::types::{ClusterId, Message, MessageContent, MessageId};
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqliteRow};
use sqlx::{ConnectOptions, QueryBuilder, Row};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tokio::sync::Mutex;
use tracing::{debug, info};

const SCHEMA: &str = "\
CREATE TABLE IF NOT EXISTS messages (
    seq          INTEGER PRIMARY KEY AUTOINCREMENT,
    id           TEXT NOT NULL UNIQUE,
    timestamp    INTEGER NOT NULL,
    topic        TEXT NOT NULL,
    sender       TEXT NOT NULL,
    receiver     TEXT NOT NULL,
    content_text TEXT,
    content_data TEXT,
    metadata     TEXT NOT NULL DEFAULT '{}',
    cluster_id   TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_messages_cluster_topic_ts
    ON messages (cluster_id, topic, timestamp);
";

/// SQLite-backed ledger for one cluster
pub struct SqliteLedger {
    pool: SqlitePool,
    cluster_id: ClusterId,
    db_path: PathBuf,
    /// Highest timestamp assigned so far; appends never go below it
    last_timestamp: Mutex<i64>,
    _lock: FileLock,
}

impl SqliteLedger {
    /// Open (or create) the ledger for `cluster_id` under `state_dir`
    pub async fn open(state_dir: &Path, cluster_id: ClusterId) -> Result<Self> {
        let db_path = state_dir.join(format!("{cluster_id}.db"));
        Self::open_path(&db_path, cluster_id).await
    }

    /// Open a ledger at an explicit path
    pub async fn open_path(db_path: &Path, cluster_id: ClusterId) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let lock = FileLock::acquire(db_path).await?;

        let url = format!("sqlite://{}", db_path.display());
        let mut options = SqliteConnectOptions::from_str(&url)
            .map_err(HarmoniaError::Database)?
            .create_if_missing(true)
            .busy_timeout(std::time::Duration::from_secs(30));
        options = options.disable_statement_logging();

        let pool = SqlitePool::connect_with(options).await?;
        sqlx::raw_sql(SCHEMA).execute(&pool).await?;

        // Resume monotonicity where the previous process left off
        let last_timestamp: Option<i64> =
            sqlx::query_scalar("SELECT MAX(timestamp) FROM messages WHERE cluster_id = ?")
                .bind(cluster_id.to_string())
                .fetch_one(&pool)
                .await?;

        info!(cluster = %cluster_id, path = %db_path.display(), "ledger open");

        Ok(Self {
            pool,
            cluster_id,
            db_path: db_path.to_path_buf(),
            last_timestamp: Mutex::new(last_timestamp.unwrap_or(0)),
            _lock: lock,
        })
    }

    /// Path of the backing database file
    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    /// Cluster this ledger belongs to
    pub fn cluster_id(&self) -> ClusterId {
        self.cluster_id
    }

    fn row_to_message(row: &SqliteRow) -> Result<Message> {
        let id_str: String = row.try_get("id")?;
        let id = MessageId::from_string(&id_str)?;

        let cluster_str: String = row.try_get("cluster_id")?;
        let cluster_id = ClusterId::from_string(&cluster_str)?;

        let content_text: Option<String> = row.try_get("content_text")?;
        let content_data: Option<String> = row.try_get("content_data")?;
        let data = match content_data {
            Some(raw) => Some(
                serde_json::from_str(&raw).map_err(|e| corruption("content_data", &raw, e))?,
            ),
            None => None,
        };

        let metadata_raw: String = row.try_get("metadata")?;
        let metadata = serde_json::from_str(&metadata_raw)
            .map_err(|e| corruption("metadata", &metadata_raw, e))?;

        Ok(Message {
            id,
            seq: row.try_get("seq")?,
            timestamp: row.try_get("timestamp")?,
            cluster_id,
            topic: row.try_get("topic")?,
            sender: row.try_get("sender")?,
            receiver: row.try_get("receiver")?,
            content: MessageContent {
                text: content_text,
                data,
            },
            metadata,
        })
    }

    fn build_select<'a>(
        &self,
        filter: &'a MessageFilter,
        projection: &str,
    ) -> QueryBuilder<'a, sqlx::Sqlite> {
        let mut qb: QueryBuilder<sqlx::Sqlite> =
            QueryBuilder::new(format!("SELECT {projection} FROM messages WHERE cluster_id = "));
        qb.push_bind(self.cluster_id.to_string());
        if let Some(topic) = &filter.topic {
            qb.push(" AND topic = ").push_bind(topic.as_str());
        }
        if let Some(sender) = &filter.sender {
            qb.push(" AND sender = ").push_bind(sender.as_str());
        }
        if let Some(receiver) = &filter.receiver {
            qb.push(" AND receiver = ").push_bind(receiver.as_str());
        }
        if let Some(since) = filter.since {
            qb.push(" AND timestamp >= ").push_bind(since);
        }
        if let Some(before) = filter.before {
            qb.push(" AND timestamp < ").push_bind(before);
        }
        qb
    }
}

fn corruption(column: &str, raw: &str, err: serde_json::Error) -> HarmoniaError {
    let head: String = raw.chars().take(200).collect();
    HarmoniaError::LedgerCorruption(format!("{column} unparseable ({err}); payload: {head}"))
}

#[async_trait]
impl LedgerStore for SqliteLedger {
    async fn append(&self, draft: MessageDraft) -> Result<Message> {
        let id = MessageId::new();
        let content_data = draft
            .content
            .data
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let metadata = serde_json::to_string(&draft.metadata)?;

        // Serialize appends: monotonic timestamps, insertion-order ties
        let mut last = self.last_timestamp.lock().await;
        let timestamp = chrono::Utc::now().timestamp_millis().max(*last);

        let result = sqlx::query(
            "INSERT INTO messages \
             (id, timestamp, topic, sender, receiver, content_text, content_data, metadata, cluster_id) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(id.to_string())
        .bind(timestamp)
        .bind(&draft.topic)
        .bind(&draft.sender)
        .bind(&draft.receiver)
        .bind(&draft.content.text)
        .bind(&content_data)
        .bind(&metadata)
        .bind(draft.cluster_id.to_string())
        .execute(&self.pool)
        .await?;

        *last = timestamp;
        drop(last);

        let seq = result.last_insert_rowid();
        debug!(topic = %draft.topic, seq, "ledger append");

        Ok(Message {
            id,
            seq,
            timestamp,
            cluster_id: draft.cluster_id,
            topic: draft.topic,
            sender: draft.sender,
            receiver: draft.receiver,
            content: draft.content,
            metadata: draft.metadata,
        })
    }

    async fn query(&self, filter: &MessageFilter) -> Result<Vec<Message>> {
        let mut qb = self.build_select(filter, "*");
        if let Some(limit) = filter.limit {
            // The tail of the log, returned in ascending order
            qb.push(" ORDER BY timestamp DESC, seq DESC LIMIT ")
                .push_bind(limit as i64);
            let rows = qb.build().fetch_all(&self.pool).await?;
            let mut messages = rows
                .iter()
                .map(Self::row_to_message)
                .collect::<Result<Vec<_>>>()?;
            messages.reverse();
            Ok(messages)
        } else {
            qb.push(" ORDER BY timestamp ASC, seq ASC");
            let rows = qb.build().fetch_all(&self.pool).await?;
            rows.iter().map(Self::row_to_message).collect()
        }
    }

    async fn find_last(&self, filter: &MessageFilter) -> Result<Option<Message>> {
        let mut qb = self.build_select(filter, "*");
        qb.push(" ORDER BY timestamp DESC, seq DESC LIMIT 1");
        let row = qb.build().fetch_optional(&self.pool).await?;
        row.as_ref().map(Self::row_to_message).transpose()
    }

    async fn count(&self, filter: &MessageFilter) -> Result<u64> {
        let mut qb = self.build_select(filter, "COUNT(*) AS n");
        let row = qb.build().fetch_one(&self.pool).await?;
        let n: i64 = row.try_get("n")?;
        Ok(n as u64)
    }

    async fn get(&self, id: MessageId) -> Result<Option<Message>> {
        let row = sqlx::query("SELECT * FROM messages WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::row_to_message).transpose()
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}
