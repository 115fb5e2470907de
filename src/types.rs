//! Core data structures shared across the engine
//!
//! Defines the identifier newtypes, the ledger `Message` record, cluster
//! lifecycle states, and the task input variants accepted by the
//! orchestrator.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;
use uuid::Uuid;

/// Well-known message topics published by the engine itself
///
/// Workflow configurations are free to introduce their own topics; these
/// are the ones the core publishes or recognizes.
pub mod topic {
    /// Seed message carrying the task input
    pub const ISSUE_OPENED: &str = "ISSUE_OPENED";
    /// Ordered cluster mutation operations (add/remove agents, publish, stop)
    pub const CLUSTER_OPERATIONS: &str = "CLUSTER_OPERATIONS";
    /// Published when an agent task spawns; powers crash resume
    pub const TASK_STARTED: &str = "TASK_STARTED";
    /// Published when an agent task finishes; powers `last_task_end` scoping
    pub const TASK_COMPLETED: &str = "TASK_COMPLETED";
    /// Agent-level failure (runner, model policy, validator schema)
    pub const AGENT_ERROR: &str = "AGENT_ERROR";
    /// Non-fatal schema mismatch for non-validator roles
    pub const AGENT_SCHEMA_WARNING: &str = "AGENT_SCHEMA_WARNING";
    /// Agent refused further work past its iteration ceiling
    pub const AGENT_HALTED: &str = "AGENT_HALTED";
    /// In-flight task exceeded its stale window
    pub const AGENT_STALE: &str = "AGENT_STALE";
    /// In-flight task exceeded its timeout
    pub const AGENT_TIMEOUT: &str = "AGENT_TIMEOUT";
    /// Trigger predicate raised or failed to parse
    pub const LOGIC_ERROR: &str = "LOGIC_ERROR";
    /// Hook action failed
    pub const HOOK_ERROR: &str = "HOOK_ERROR";
    /// Cooperative stop requested by a workflow
    pub const STOP_CLUSTER: &str = "STOP_CLUSTER";
    /// Workflow declared the cluster done
    pub const CLUSTER_COMPLETE: &str = "CLUSTER_COMPLETE";
    /// Mirrored result of a sub-cluster spawned by a hook
    pub const SUB_CLUSTER_COMPLETE: &str = "SUB_CLUSTER_COMPLETE";
}

/// Receiver value addressing every agent in the cluster
pub const BROADCAST: &str = "broadcast";

/// Sender value for engine-originated messages
pub const SYSTEM_SENDER: &str = "system";

/// Sender value for user-originated messages
pub const USER_SENDER: &str = "user";

/// Metadata key marking a republished record
pub const META_REPUBLISHED: &str = "_republished";

/// Metadata key recording the input source of a seed message
pub const META_SOURCE: &str = "source";

/// Unique cluster identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClusterId(pub Uuid);

impl ClusterId {
    /// Create a new random cluster ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse a cluster ID from a string
    pub fn from_string(s: &str) -> Result<Self, uuid::Error> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

impl Default for ClusterId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ClusterId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique message identifier, generated before append
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(pub Uuid);

impl MessageId {
    /// Create a new random message ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse a message ID from a string
    pub fn from_string(s: &str) -> Result<Self, uuid::Error> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Message body: free text, structured data, or both
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageContent {
    /// Human-readable text
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,

    /// Structured payload
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl MessageContent {
    /// Content with only a text body
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            data: None,
        }
    }

    /// Content with only a structured payload
    pub fn data(data: Value) -> Self {
        Self {
            text: None,
            data: Some(data),
        }
    }
}

/// One durable ledger record
///
/// Records are totally ordered per cluster by `(timestamp, seq)`; `seq` is
/// assigned by the ledger at append time and breaks timestamp ties in
/// insertion order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Unique identifier, generated before append
    pub id: MessageId,

    /// Ledger-assigned append sequence
    pub seq: i64,

    /// UNIX milliseconds, monotonic per ledger
    pub timestamp: i64,

    /// Cluster owning this record
    pub cluster_id: ClusterId,

    /// Uppercase topic identifier
    pub topic: String,

    /// Agent identifier, `system`, or `user`
    pub sender: String,

    /// Agent identifier or `broadcast`
    pub receiver: String,

    /// Message body
    pub content: MessageContent,

    /// Free-form metadata; reserved keys `_republished`, `source`
    pub metadata: serde_json::Map<String, Value>,
}

impl Message {
    /// Whether this record was emitted by a republish operation
    pub fn is_republished(&self) -> bool {
        self.metadata
            .get(META_REPUBLISHED)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    /// Whether this record is addressed to the given agent
    ///
    /// Broadcast records are addressed to everyone.
    pub fn addressed_to(&self, agent_id: &str) -> bool {
        self.receiver == BROADCAST || self.receiver == agent_id
    }

    /// Timestamp as a chrono instant
    pub fn timestamp_utc(&self) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(self.timestamp)
            .single()
            .unwrap_or_else(Utc::now)
    }
}

/// Cluster lifecycle state
///
/// `Running` is the only non-terminal state; terminal states are final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClusterState {
    /// Agents are live and triggers fire
    Running,
    /// Stopped by request; no new trigger firings
    Stopped,
    /// Aborted on a fatal error
    Failed,
    /// Workflow declared completion
    Completed,
}

impl ClusterState {
    /// Whether the state admits no further transitions
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ClusterState::Running)
    }
}

impl std::fmt::Display for ClusterState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ClusterState::Running => "running",
            ClusterState::Stopped => "stopped",
            ClusterState::Failed => "failed",
            ClusterState::Completed => "completed",
        };
        f.write_str(s)
    }
}

/// Where the seed input for a cluster came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputSource {
    Issue,
    File,
    Text,
}

impl InputSource {
    /// Wire representation used in seed metadata
    pub fn as_str(&self) -> &'static str {
        match self {
            InputSource::Issue => "issue",
            InputSource::File => "file",
            InputSource::Text => "text",
        }
    }
}

/// Task input accepted by `Orchestrator::start`
///
/// Issue bodies are fetched by peripheral glue before they reach the
/// engine; the engine only records the reference alongside the text.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClusterInput {
    /// Pre-fetched GitHub issue
    Issue { reference: String, body: String },
    /// Markdown file on disk, read at seed time
    File { path: PathBuf },
    /// Inline task description
    Text { text: String },
}

impl ClusterInput {
    /// Source tag recorded in the seed message metadata
    pub fn source(&self) -> InputSource {
        match self {
            ClusterInput::Issue { .. } => InputSource::Issue,
            ClusterInput::File { .. } => InputSource::File,
            ClusterInput::Text { .. } => InputSource::Text,
        }
    }

    /// Resolve the input to the text body of the seed message
    pub async fn load_text(&self) -> crate::error::Result<String> {
        match self {
            ClusterInput::Issue { body, .. } => Ok(body.clone()),
            ClusterInput::File { path } => Ok(tokio::fs::read_to_string(path).await?),
            ClusterInput::Text { text } => Ok(text.clone()),
        }
    }
}
