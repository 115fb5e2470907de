//! Orchestrator
//!
//! Owns the cluster table: creates clusters from inline configs or
//! templates, seeds their input, routes the control surface (list,
//! status, logs, stop, kill, resume, purge), and rebuilds runtime state
//! from the ledger after a crash.
//!
//! Resume publishes nothing: iteration counters come from historical
//! `TASK_STARTED` counts, `last_task_end` from the newest
//! `TASK_COMPLETED`, and past triggers are not replayed: the ledger
//! already reflects the desired state.

pub mod cluster;

use crate::agent::{model, AgentState, ClusterConfig};
use crate::bus::{MessageBus, Publish};
use crate::error::{HarmoniaError, Result};
use crate::hooks::SubClusterSpawner;
use crate::isolation::IsolationProvider;
use crate::ledger::{FileLock, LedgerStore, MessageFilter, SqliteLedger};
use crate::runner::TaskRunner;
use crate::settings::SettingsStore;
use crate::template::{ClusterTemplate, TemplateResolver};
use crate::types::{
    topic, ClusterId, ClusterInput, ClusterState, InputSource, Message, MessageContent,
    META_SOURCE, USER_SENDER,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, RwLock};
use tracing::{info, warn};

pub use cluster::{AgentStatusRow, ClusterEvent, ClusterOperation, ClusterRuntime};

/// Cluster definition accepted by `start`: a template reference or an
/// inline config
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ClusterSpec {
    Template(ClusterTemplate),
    Inline(ClusterConfig),
}

/// Per-start options
#[derive(Debug, Clone, Default)]
pub struct StartOptions {
    /// Worktree allocated by the caller's isolation glue, if any
    pub worktree_path: Option<PathBuf>,
}

/// Orchestrator construction parameters
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Ledger files and the cluster index live here
    pub state_dir: PathBuf,

    /// Template bases are resolved against this directory
    pub templates_dir: Option<PathBuf>,

    /// Settings file consumed read-through at cluster boundaries
    pub settings_path: Option<PathBuf>,
}

/// Persisted record of one cluster in `clusters.json`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterRecord {
    pub id: ClusterId,
    pub created_at: i64,
    pub state: ClusterState,
    pub config: ClusterConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worktree_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<InputSource>,
}

/// One row of `list` output
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSummary {
    pub id: ClusterId,
    pub created_at: i64,
    pub state: ClusterState,
    pub agent_count: usize,
    pub source: Option<InputSource>,
}

/// Full cluster status for the control surface
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterDetail {
    pub id: ClusterId,
    pub created_at: i64,
    pub state: ClusterState,
    pub agents: Vec<AgentStatusRow>,
    pub message_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worktree_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_id: Option<String>,
}

/// Ledger history plus an optional live tail
pub struct LogStream {
    pub history: Vec<Message>,
    pub live: Option<mpsc::UnboundedReceiver<Message>>,
}

/// The cluster index at `<state_dir>/clusters.json`
///
/// Read-modify-write under the same lock discipline as the ledger files.
pub struct ClusterIndex {
    path: PathBuf,
}

impl ClusterIndex {
    pub fn new(state_dir: &std::path::Path) -> Self {
        Self {
            path: state_dir.join("clusters.json"),
        }
    }

    /// All persisted records
    pub async fn load(&self) -> Result<Vec<ClusterRecord>> {
        let _lock = FileLock::acquire(&self.path).await?;
        self.read_unlocked()
    }

    /// One record by id
    pub async fn get(&self, id: ClusterId) -> Result<Option<ClusterRecord>> {
        Ok(self.load().await?.into_iter().find(|r| r.id == id))
    }

    /// Insert or replace a record
    pub async fn upsert(&self, record: ClusterRecord) -> Result<()> {
        self.mutate(|records| {
            records.retain(|r| r.id != record.id);
            records.push(record);
        })
        .await
    }

    pub async fn update_state(&self, id: ClusterId, state: ClusterState) -> Result<()> {
        self.mutate(|records| {
            if let Some(record) = records.iter_mut().find(|r| r.id == id) {
                record.state = state;
            }
        })
        .await
    }

    pub async fn update_config(&self, id: ClusterId, config: &ClusterConfig) -> Result<()> {
        let config = config.clone();
        self.mutate(move |records| {
            if let Some(record) = records.iter_mut().find(|r| r.id == id) {
                record.config = config;
            }
        })
        .await
    }

    pub async fn remove(&self, id: ClusterId) -> Result<()> {
        self.mutate(|records| {
            records.retain(|r| r.id != id);
        })
        .await
    }

    fn read_unlocked(&self) -> Result<Vec<ClusterRecord>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let raw = std::fs::read_to_string(&self.path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    async fn mutate(&self, f: impl FnOnce(&mut Vec<ClusterRecord>)) -> Result<()> {
        let _lock = FileLock::acquire(&self.path).await?;
        let mut records = self.read_unlocked()?;
        f(&mut records);
        std::fs::write(&self.path, serde_json::to_string_pretty(&records)?)?;
        Ok(())
    }
}

/// Cluster table and control surface
pub struct Orchestrator {
    state_dir: PathBuf,
    templates_dir: Option<PathBuf>,
    settings: SettingsStore,
    runner: Arc<dyn TaskRunner>,
    isolation: Option<Arc<dyn IsolationProvider>>,
    clusters: RwLock<HashMap<ClusterId, Arc<ClusterRuntime>>>,
    index: Arc<ClusterIndex>,
    /// Weak handle to ourselves for the hook-level sub-cluster spawner
    self_ref: Weak<Orchestrator>,
}

impl Orchestrator {
    /// Create an orchestrator over a state directory
    pub fn new(config: OrchestratorConfig, runner: Arc<dyn TaskRunner>) -> Result<Arc<Self>> {
        Self::with_isolation(config, runner, None)
    }

    /// Create an orchestrator with an isolation backend
    pub fn with_isolation(
        config: OrchestratorConfig,
        runner: Arc<dyn TaskRunner>,
        isolation: Option<Arc<dyn IsolationProvider>>,
    ) -> Result<Arc<Self>> {
        std::fs::create_dir_all(&config.state_dir)?;
        let settings = match &config.settings_path {
            Some(path) => SettingsStore::new(path),
            None => SettingsStore::defaults(),
        };
        let index = Arc::new(ClusterIndex::new(&config.state_dir));
        Ok(Arc::new_cyclic(|weak| Self {
            state_dir: config.state_dir,
            templates_dir: config.templates_dir,
            settings,
            runner,
            isolation,
            clusters: RwLock::new(HashMap::new()),
            index,
            self_ref: weak.clone(),
        }))
    }

    /// Create a cluster, validate it, and seed its input
    ///
    /// Config errors are fatal here and publish nothing. Model policy
    /// violations are not config errors: they surface as `AGENT_ERROR`
    /// records before the seed message, and the cluster continues.
    pub async fn start(
        &self,
        spec: ClusterSpec,
        input: ClusterInput,
        options: StartOptions,
    ) -> Result<Arc<ClusterRuntime>> {
        let config = match spec {
            ClusterSpec::Inline(config) => config,
            ClusterSpec::Template(template) => {
                let dir = self.templates_dir.as_ref().ok_or_else(|| {
                    HarmoniaError::Config("no template directory configured".to_string())
                })?;
                TemplateResolver::new(dir).resolve(&template).await?
            }
        };
        config.validate()?;

        // Boundary read: cluster start
        let settings = self.settings.load()?;

        let id = ClusterId::new();
        let created_at = chrono::Utc::now().timestamp_millis();
        let source = input.source();

        let (isolation_work_dir, container_id) = match &self.isolation {
            Some(provider) => (
                provider.work_dir(id).await?,
                provider.container_id(id).await?,
            ),
            None => (None, None),
        };

        let ledger: Arc<dyn LedgerStore> =
            Arc::new(SqliteLedger::open(&self.state_dir, id).await?);
        let bus = Arc::new(MessageBus::new(ledger, id));

        self.index
            .upsert(ClusterRecord {
                id,
                created_at,
                state: ClusterState::Running,
                config: config.clone(),
                worktree_path: options.worktree_path.clone(),
                container_id: container_id.clone(),
                source: Some(source),
            })
            .await?;

        let runtime = ClusterRuntime::launch(cluster::ClusterLaunchArgs {
            id,
            created_at,
            config: config.clone(),
            bus: bus.clone(),
            runner: self.runner.clone(),
            settings: self.settings.clone(),
            spawner: Some(self.spawner()),
            index: self.index.clone(),
            worktree_path: options.worktree_path,
            container_id,
            isolation_work_dir,
        })
        .await?;

        // Model policy validation before any task can run
        for def in &config.agents {
            if let Some(model_config) = &def.model_config {
                for violation in model::validate_policy(model_config, &settings) {
                    if let HarmoniaError::ModelPolicy { code, detail } = violation {
                        warn!(cluster = %id, agent = %def.id, %code, "{detail}");
                        bus.publish(
                            Publish::new(topic::AGENT_ERROR, def.id.clone()).data(json!({
                                "agent": def.id,
                                "errorCode": code.as_str(),
                                "detail": detail,
                            })),
                        )
                        .await?;
                    }
                }
            }
        }

        // Seed the input
        let text = input.load_text().await?;
        let mut seed = Publish::new(topic::ISSUE_OPENED, USER_SENDER)
            .content(MessageContent::text(text))
            .meta(META_SOURCE, json!(source.as_str()));
        if let ClusterInput::Issue { reference, .. } = &input {
            seed = seed.meta("reference", json!(reference));
        }
        bus.publish(seed).await?;

        info!(cluster = %id, agents = config.agents.len(), "cluster started");
        self.clusters.write().await.insert(id, runtime.clone());
        Ok(runtime)
    }

    /// Summaries of every known cluster
    pub async fn list(&self) -> Result<Vec<ClusterSummary>> {
        let mut summaries: Vec<ClusterSummary> = self
            .index
            .load()
            .await?
            .into_iter()
            .map(|r| ClusterSummary {
                id: r.id,
                created_at: r.created_at,
                state: r.state,
                agent_count: r.config.agents.len(),
                source: r.source,
            })
            .collect();
        summaries.sort_by_key(|s| s.created_at);
        Ok(summaries)
    }

    /// Full status of one cluster
    pub async fn status(&self, id: ClusterId) -> Result<ClusterDetail> {
        if let Some(runtime) = self.clusters.read().await.get(&id).cloned() {
            let message_count = runtime.bus().count(&MessageFilter::default()).await?;
            return Ok(ClusterDetail {
                id,
                created_at: runtime.created_at,
                state: runtime.state(),
                agents: runtime.agent_statuses(),
                message_count,
                worktree_path: runtime.worktree_path.clone(),
                container_id: runtime.container_id.clone(),
            });
        }

        let record = self
            .index
            .get(id)
            .await?
            .ok_or_else(|| HarmoniaError::ClusterNotFound(id.to_string()))?;
        let ledger = SqliteLedger::open(&self.state_dir, id).await?;
        let message_count = ledger.count(&MessageFilter::default()).await?;
        let mut agents = Vec::with_capacity(record.config.agents.len());
        for def in &record.config.agents {
            let iteration = ledger
                .count(&MessageFilter::topic(topic::TASK_STARTED).sender(&def.id))
                .await? as u32;
            agents.push(AgentStatusRow {
                id: def.id.clone(),
                role: def.role.clone(),
                state: AgentState::Idle,
                iteration,
                halted: false,
            });
        }
        ledger.close().await;

        Ok(ClusterDetail {
            id,
            created_at: record.created_at,
            state: record.state,
            agents,
            message_count,
            worktree_path: record.worktree_path,
            container_id: record.container_id,
        })
    }

    /// Ledger history, with a live tail when `follow` is set
    pub async fn logs(&self, id: ClusterId, follow: bool) -> Result<LogStream> {
        if let Some(runtime) = self.clusters.read().await.get(&id).cloned() {
            let history = runtime.bus().query(&MessageFilter::default()).await?;
            let live = if follow {
                let (tx, rx) = mpsc::unbounded_channel();
                runtime.bus().subscribe_all(Box::new(move |msg| {
                    let _ = tx.send(msg.clone());
                }));
                Some(rx)
            } else {
                None
            };
            return Ok(LogStream { history, live });
        }

        let record = self.index.get(id).await?;
        if record.is_none() {
            return Err(HarmoniaError::ClusterNotFound(id.to_string()));
        }
        let ledger = SqliteLedger::open(&self.state_dir, id).await?;
        let history = ledger.query(&MessageFilter::default()).await?;
        ledger.close().await;
        Ok(LogStream {
            history,
            live: None,
        })
    }

    /// Cooperative stop: no new trigger firings, in-flight tasks finish
    pub async fn stop(&self, id: ClusterId) -> Result<()> {
        if let Some(runtime) = self.clusters.read().await.get(&id).cloned() {
            runtime.request_stop(None).await;
            return Ok(());
        }
        if self.index.get(id).await?.is_some() {
            self.index.update_state(id, ClusterState::Stopped).await?;
            return Ok(());
        }
        Err(HarmoniaError::ClusterNotFound(id.to_string()))
    }

    /// Immediate stop: cancel in-flight tasks
    pub async fn kill(&self, id: ClusterId) -> Result<()> {
        if let Some(runtime) = self.clusters.read().await.get(&id).cloned() {
            runtime.kill().await;
            return Ok(());
        }
        if self.index.get(id).await?.is_some() {
            self.index.update_state(id, ClusterState::Stopped).await?;
            return Ok(());
        }
        Err(HarmoniaError::ClusterNotFound(id.to_string()))
    }

    /// Rebuild a cluster from its persisted record and ledger
    pub async fn resume(&self, id: ClusterId) -> Result<Arc<ClusterRuntime>> {
        if let Some(runtime) = self.clusters.read().await.get(&id).cloned() {
            return Ok(runtime);
        }

        let record = self
            .index
            .get(id)
            .await?
            .ok_or_else(|| HarmoniaError::ClusterNotFound(id.to_string()))?;

        let (isolation_work_dir, container_id) = match &self.isolation {
            Some(provider) => (
                provider.work_dir(id).await?,
                record
                    .container_id
                    .clone()
                    .or(provider.container_id(id).await?),
            ),
            None => (None, record.container_id.clone()),
        };

        let ledger: Arc<dyn LedgerStore> =
            Arc::new(SqliteLedger::open(&self.state_dir, id).await?);
        let bus = Arc::new(MessageBus::new(ledger, id));

        // Registration restores iteration from TASK_STARTED counts and
        // last_task_end from the newest TASK_COMPLETED, and re-applies
        // the cwd default chain to definitions that predate it
        let runtime = ClusterRuntime::launch(cluster::ClusterLaunchArgs {
            id,
            created_at: record.created_at,
            config: record.config,
            bus,
            runner: self.runner.clone(),
            settings: self.settings.clone(),
            spawner: Some(self.spawner()),
            index: self.index.clone(),
            worktree_path: record.worktree_path,
            container_id,
            isolation_work_dir,
        })
        .await?;

        self.index.update_state(id, ClusterState::Running).await?;
        self.clusters.write().await.insert(id, runtime.clone());
        info!(cluster = %id, "cluster resumed");
        Ok(runtime)
    }

    /// Delete a cluster's ledger and index record
    pub async fn purge(&self, id: ClusterId) -> Result<()> {
        if let Some(runtime) = self.clusters.write().await.remove(&id) {
            runtime.kill().await;
            runtime.bus().ledger().close().await;
        }
        if self.index.get(id).await?.is_none() {
            return Err(HarmoniaError::ClusterNotFound(id.to_string()));
        }

        let db_path = self.state_dir.join(format!("{id}.db"));
        for suffix in ["", "-wal", "-shm", ".lock"] {
            let path = PathBuf::from(format!("{}{suffix}", db_path.display()));
            if path.exists() {
                std::fs::remove_file(&path)?;
            }
        }
        self.index.remove(id).await?;
        info!(cluster = %id, "cluster purged");
        Ok(())
    }

    fn spawner(&self) -> Arc<dyn SubClusterSpawner> {
        Arc::new(OrchestratorSpawner {
            inner: self.self_ref.clone(),
        })
    }
}

/// Weak handle implementing recursive sub-cluster spawning for hooks
struct OrchestratorSpawner {
    inner: Weak<Orchestrator>,
}

#[async_trait]
impl SubClusterSpawner for OrchestratorSpawner {
    async fn spawn(
        &self,
        config: Value,
        input: String,
        wait_for_topic: Option<String>,
    ) -> Result<Value> {
        let orchestrator = self
            .inner
            .upgrade()
            .ok_or_else(|| HarmoniaError::Hook("orchestrator is gone".to_string()))?;
        let config: ClusterConfig = serde_json::from_value(config)
            .map_err(|e| HarmoniaError::Hook(format!("sub-cluster config invalid: {e}")))?;

        let cluster = orchestrator
            .start(
                ClusterSpec::Inline(config),
                ClusterInput::Text { text: input },
                StartOptions::default(),
            )
            .await?;

        let Some(wanted) = wait_for_topic else {
            return Ok(json!({ "clusterId": cluster.id.to_string() }));
        };

        loop {
            if let Some(found) = cluster.bus().find_last(&MessageFilter::topic(&wanted)).await? {
                return Ok(json!({
                    "clusterId": cluster.id.to_string(),
                    "topic": wanted,
                    "content": {
                        "text": found.content.text,
                        "data": found.content.data,
                    },
                }));
            }
            if cluster.state().is_terminal() {
                return Ok(json!({
                    "clusterId": cluster.id.to_string(),
                    "state": cluster.state().to_string(),
                }));
            }
            tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        }
    }
}
