//! Error types for the Harmonia coordination engine
//!
//! This module provides comprehensive error handling using thiserror for
//! structured error definitions and anyhow for error propagation.

use thiserror::Error;

/// Main error type for Harmonia operations
#[derive(Error, Debug)]
pub enum HarmoniaError {
    /// Database operation failed
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Invalid cluster or agent definition; fatal at cluster start
    #[error("Configuration error: {0}")]
    Config(String),

    /// Settings file could not be loaded
    #[error("Settings error: {0}")]
    Settings(#[from] config::ConfigError),

    /// Model selection violated the cluster model policy
    #[error("Model policy error [{code}]: {detail}")]
    ModelPolicy { code: ModelPolicyCode, detail: String },

    /// The external task runner reported failure
    #[error("Runner error: {0}")]
    Runner(String),

    /// Agent output was not parseable as JSON
    #[error("Parse error: {0}")]
    Parse(String),

    /// Agent output did not validate against its schema
    #[error("Schema validation failed: {0}")]
    Schema(String),

    /// Trigger predicate evaluation failed
    #[error("Logic error: {0}")]
    Logic(String),

    /// Hook action failed
    #[error("Hook error: {0}")]
    Hook(String),

    /// Stored ledger record could not be decoded; fatal for the cluster
    #[error("Ledger corruption: {0}")]
    LedgerCorruption(String),

    /// Task exceeded its configured timeout
    #[error("Task timed out after {0} ms")]
    Timeout(u64),

    /// Task exceeded its stale-detection window
    #[error("Task stale after {0} ms")]
    Stale(u64),

    /// Ledger or index lock could not be acquired
    #[error("Lock acquisition failed: {0}")]
    Lock(String),

    /// Cluster not found in the cluster table
    #[error("Cluster not found: {0}")]
    ClusterNotFound(String),

    /// Agent not found within its cluster
    #[error("Agent not found: {0}")]
    AgentNotFound(String),

    /// Invalid identifier format
    #[error("Invalid identifier: {0}")]
    InvalidId(#[from] uuid::Error),

    /// Template resolution failed
    #[error("Template error: {0}")]
    Template(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Generic error with context
    #[error("{0}")]
    Other(String),
}

/// Machine-readable model policy violation codes
///
/// These surface in `AGENT_ERROR` ledger records so workflow hooks can
/// branch on them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelPolicyCode {
    /// Selected model lies outside the settings ceiling/floor
    ModelCeilingViolation,
    /// No model rule matched the current iteration
    NoModelRule,
}

impl ModelPolicyCode {
    /// Wire representation used in ledger records
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelPolicyCode::ModelCeilingViolation => "MODEL_CEILING_VIOLATION",
            ModelPolicyCode::NoModelRule => "NO_MODEL_RULE",
        }
    }
}

impl std::fmt::Display for ModelPolicyCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result type alias for Harmonia operations
pub type Result<T> = std::result::Result<T, HarmoniaError>;

/// Convert anyhow::Error to HarmoniaError
impl From<anyhow::Error> for HarmoniaError {
    fn from(err: anyhow::Error) -> Self {
        HarmoniaError::Other(err.to_string())
    }
}
