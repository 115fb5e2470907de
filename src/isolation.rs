//! Isolation backend plug point
//!
//! Working-directory isolation (git worktrees, containers) is provided by
//! an external collaborator. The engine only asks where a cluster's agents
//! should run; it never creates or tears down the isolation itself.

use crate::error::Result;
use crate::types::ClusterId;
use async_trait::async_trait;
use std::path::PathBuf;

/// Optional working-directory backend for clusters
#[async_trait]
pub trait IsolationProvider: Send + Sync {
    /// Working directory for the cluster's agents, if the backend
    /// allocates one
    async fn work_dir(&self, cluster_id: ClusterId) -> Result<Option<PathBuf>>;

    /// Container identifier for the cluster, if the backend runs one
    async fn container_id(&self, cluster_id: ClusterId) -> Result<Option<String>>;
}
