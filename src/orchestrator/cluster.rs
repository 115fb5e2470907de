//! Cluster runtime
//!
//! One cluster owns a ledger, a bus, an agent table, and a single
//! dispatcher task consuming an ordered event channel. The dispatcher is
//! the only writer of agent lifecycle state, which gives the core its
//! ordering guarantees:
//!
//! - messages are processed in ledger order
//! - a single agent never has two tasks in flight
//! - `CLUSTER_OPERATIONS` lists apply sequentially, so their effects are
//!   atomic with respect to other readers
//!
//! Agent executions themselves run as spawned tasks in parallel; only
//! their begin/end transitions pass through the dispatcher.

use crate::agent::{
    AgentDefinition, AgentExecutor, AgentRuntime, AgentState, ClusterConfig,
};
use crate::bus::{MessageBus, Publish};
use crate::error::{HarmoniaError, Result};
use crate::hooks::{HookRunner, HookScope, PublishSpec, StopRequest, SubClusterSpawner};
use crate::ledger::MessageFilter;
use crate::orchestrator::ClusterIndex;
use crate::runner::TaskRunner;
use crate::settings::SettingsStore;
use crate::trigger::{FiredTrigger, LogicWorld, TriggerAction, TriggerEngine};
use crate::types::{topic, ClusterId, ClusterState, Message, MessageContent};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock, Weak};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Events consumed by the dispatcher, in arrival order
#[derive(Debug)]
pub enum ClusterEvent {
    /// A record was appended to the ledger
    Message(Message),
    /// An agent finished its task and returned to idle
    AgentIdle(String),
    /// A hook or API call requested a cooperative stop
    Stop(StopRequest),
}

/// One operation inside a `CLUSTER_OPERATIONS` message
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ClusterOperation {
    /// Register additional agents; they become indistinguishable from
    /// static ones
    AddAgents { agents: Vec<AgentDefinition> },

    /// Remove an agent from the table
    RemoveAgent { id: String },

    /// Publish a message; republishes of an earlier topic are tagged
    /// `_republished`
    #[serde(rename_all = "camelCase")]
    Publish {
        topic: String,
        #[serde(default)]
        content: Option<MessageContent>,
        #[serde(default)]
        metadata: Option<serde_json::Map<String, Value>>,
    },

    /// Stop the cluster after this operation list
    Stop {
        #[serde(default)]
        reason: Option<String>,
    },
}

/// Everything `ClusterRuntime::launch` needs
pub struct ClusterLaunchArgs {
    pub id: ClusterId,
    pub created_at: i64,
    pub config: ClusterConfig,
    pub bus: Arc<MessageBus>,
    pub runner: Arc<dyn TaskRunner>,
    pub settings: SettingsStore,
    pub spawner: Option<Arc<dyn SubClusterSpawner>>,
    pub index: Arc<ClusterIndex>,
    pub worktree_path: Option<PathBuf>,
    pub container_id: Option<String>,
    pub isolation_work_dir: Option<PathBuf>,
}

/// Live state of one cluster
pub struct ClusterRuntime {
    pub id: ClusterId,
    pub created_at: i64,
    pub worktree_path: Option<PathBuf>,
    pub container_id: Option<String>,
    isolation_work_dir: Option<PathBuf>,

    state: Mutex<ClusterState>,
    config: Mutex<ClusterConfig>,
    agents: RwLock<HashMap<String, Arc<AgentRuntime>>>,

    bus: Arc<MessageBus>,
    trigger_engine: TriggerEngine,
    executor: Arc<AgentExecutor>,
    hook_runner: Arc<HookRunner>,
    events_tx: mpsc::UnboundedSender<ClusterEvent>,
    cancel: CancellationToken,
    index: Arc<ClusterIndex>,
    /// Weak handle to ourselves for tasks spawned off the dispatcher
    self_ref: Weak<ClusterRuntime>,
}

impl ClusterRuntime {
    /// Build the runtime, register agents, restore counters from the
    /// ledger, and start the dispatcher
    ///
    /// Counter restoration is what makes crash resume work: iteration is
    /// the count of historical `TASK_STARTED` records per agent, and
    /// `last_task_end` the newest `TASK_COMPLETED` timestamp. For a fresh
    /// cluster both are naturally zero/absent.
    pub async fn launch(args: ClusterLaunchArgs) -> Result<Arc<Self>> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (stop_tx, mut stop_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let hook_runner = Arc::new(HookRunner::new(args.bus.clone(), stop_tx, args.spawner));
        let executor = Arc::new(AgentExecutor {
            bus: args.bus.clone(),
            runner: args.runner,
            hook_runner: hook_runner.clone(),
            settings: args.settings,
            cluster_created_at: args.created_at,
            cancel: cancel.clone(),
        });

        let runtime = Arc::new_cyclic(|weak| Self {
            self_ref: weak.clone(),
            id: args.id,
            created_at: args.created_at,
            worktree_path: args.worktree_path,
            container_id: args.container_id,
            isolation_work_dir: args.isolation_work_dir,
            state: Mutex::new(ClusterState::Running),
            config: Mutex::new(ClusterConfig::default()),
            agents: RwLock::new(HashMap::new()),
            bus: args.bus.clone(),
            trigger_engine: TriggerEngine::new(),
            executor,
            hook_runner,
            events_tx: events_tx.clone(),
            cancel,
            index: args.index,
        });

        for def in args.config.agents {
            runtime.register_agent(def).await?;
        }

        // Bus → dispatcher channel; the callback must stay short-running
        let tx = events_tx.clone();
        args.bus.subscribe_all(Box::new(move |msg| {
            let _ = tx.send(ClusterEvent::Message(msg.clone()));
        }));

        // Hook stop requests feed the same ordered channel
        let tx = events_tx.clone();
        tokio::spawn(async move {
            while let Some(req) = stop_rx.recv().await {
                if tx.send(ClusterEvent::Stop(req)).is_err() {
                    break;
                }
            }
        });

        let dispatcher = runtime.clone();
        tokio::spawn(async move {
            dispatcher.dispatch_loop(events_rx).await;
        });

        Ok(runtime)
    }

    /// Current lifecycle state
    pub fn state(&self) -> ClusterState {
        *self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Resolved agent definitions, including dynamically added ones
    pub fn config(&self) -> ClusterConfig {
        self.config.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    /// Bus serving this cluster
    pub fn bus(&self) -> &Arc<MessageBus> {
        &self.bus
    }

    /// Agent runtime handle by id
    pub fn agent(&self, id: &str) -> Option<Arc<AgentRuntime>> {
        self.agents
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(id)
            .cloned()
    }

    /// Snapshot of agent ids in the table
    pub fn agent_ids(&self) -> Vec<String> {
        self.agents
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .keys()
            .cloned()
            .collect()
    }

    /// Per-agent status rows for the control surface
    pub fn agent_statuses(&self) -> Vec<AgentStatusRow> {
        self.agents
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .values()
            .map(|a| AgentStatusRow {
                id: a.id().to_string(),
                role: a.definition.role.clone(),
                state: a.state(),
                iteration: a.iteration(),
                halted: a.is_halted(),
            })
            .collect()
    }

    /// Cooperative stop: no new firings, in-flight tasks finish
    ///
    /// Writes nothing to the ledger, so a resume immediately followed by a
    /// stop leaves the ledger byte-identical.
    pub async fn request_stop(&self, reason: Option<String>) {
        let _ = self.events_tx.send(ClusterEvent::Stop(StopRequest { reason }));
    }

    /// Immediate stop: cancel in-flight tasks and mark stopped
    pub async fn kill(&self) {
        self.cancel.cancel();
        self.transition(ClusterState::Stopped).await;
    }

    /// Whether the dispatcher has shut down
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Register an agent, applying the cwd default chain, and restore its
    /// counters from the ledger
    pub async fn register_agent(&self, mut def: AgentDefinition) -> Result<()> {
        if def.cwd.is_none() {
            def.cwd = self
                .worktree_path
                .clone()
                .or_else(|| self.isolation_work_dir.clone())
                .or_else(|| std::env::current_dir().ok());
        }

        let agent_id = def.id.clone();
        {
            let agents = self.agents.read().unwrap_or_else(|p| p.into_inner());
            if agents.contains_key(&agent_id) {
                return Err(HarmoniaError::Config(format!(
                    "duplicate agent id '{agent_id}'"
                )));
            }
        }

        let runtime = Arc::new(AgentRuntime::new(def.clone()));

        let started = self
            .bus
            .count(&MessageFilter::topic(topic::TASK_STARTED).sender(&agent_id))
            .await?;
        let last_completed = self
            .bus
            .find_last(&MessageFilter::topic(topic::TASK_COMPLETED).sender(&agent_id))
            .await?;
        if started > 0 || last_completed.is_some() {
            runtime.restore(started as u32, last_completed.map(|m| m.timestamp));
            debug!(agent = %agent_id, iteration = started, "restored agent counters");
        }

        self.agents
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .insert(agent_id, runtime);
        self.config
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .agents
            .push(def);
        Ok(())
    }

    async fn persist_config(&self) {
        let config = self.config();
        if let Err(err) = self.index.update_config(self.id, &config).await {
            warn!(cluster = %self.id, "failed to persist config: {err}");
        }
    }

    async fn transition(&self, next: ClusterState) {
        {
            let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
            if state.is_terminal() {
                return;
            }
            *state = next;
        }
        info!(cluster = %self.id, state = %next, "cluster state change");
        if let Err(err) = self.index.update_state(self.id, next).await {
            warn!(cluster = %self.id, "failed to persist state: {err}");
        }
    }

    /// Abort on an unrecoverable failure
    async fn fail(&self, reason: &str) {
        error!(cluster = %self.id, "cluster failed: {reason}");
        self.cancel.cancel();
        self.transition(ClusterState::Failed).await;
    }

    async fn dispatch_loop(self: Arc<Self>, mut events_rx: mpsc::UnboundedReceiver<ClusterEvent>) {
        info!(cluster = %self.id, "dispatcher started");
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                event = events_rx.recv() => match event {
                    Some(event) => self.handle_event(event).await,
                    None => break,
                },
            }
        }
        info!(cluster = %self.id, "dispatcher stopped");
    }

    async fn handle_event(&self, event: ClusterEvent) {
        match event {
            ClusterEvent::Message(message) => self.handle_message(message).await,
            ClusterEvent::AgentIdle(agent_id) => self.drain_deferred(&agent_id).await,
            ClusterEvent::Stop(req) => {
                info!(cluster = %self.id, reason = ?req.reason, "cooperative stop");
                self.transition(ClusterState::Stopped).await;
            }
        }
    }

    async fn handle_message(&self, message: Message) {
        if message.topic == topic::CLUSTER_OPERATIONS {
            self.apply_operations(&message).await;
        }

        match message.topic.as_str() {
            topic::STOP_CLUSTER => {
                self.transition(ClusterState::Stopped).await;
                return;
            }
            topic::CLUSTER_COMPLETE => {
                self.transition(ClusterState::Completed).await;
                return;
            }
            _ => {}
        }

        if self.state() != ClusterState::Running {
            return;
        }

        // Pinned snapshot: every trigger for this message sees one view
        let snapshot = match self.bus.query(&MessageFilter::default()).await {
            Ok(messages) => Arc::new(messages),
            Err(err) => {
                self.fail(&format!("ledger snapshot failed: {err}")).await;
                return;
            }
        };
        let agent_handles: Vec<Arc<AgentRuntime>> = {
            let agents = self.agents.read().unwrap_or_else(|p| p.into_inner());
            agents.values().cloned().collect()
        };
        let world = LogicWorld {
            messages: snapshot.clone(),
            agents: Arc::new(agent_handles.iter().map(|a| a.id().to_string()).collect()),
        };

        for agent in agent_handles {
            let evaluating = agent.begin_evaluation();
            let (fired, logic_errors) = self.trigger_engine.select(
                agent.id(),
                &agent.definition.triggers,
                &message,
                &world,
            );

            for detail in logic_errors {
                let publish = Publish::new(topic::LOGIC_ERROR, agent.id())
                    .data(json!({ "detail": detail }));
                if let Err(err) = self.bus.publish(publish).await {
                    warn!(cluster = %self.id, "failed to publish LOGIC_ERROR: {err}");
                }
            }

            if let Some(fired) = fired {
                self.fire(agent.clone(), fired, &snapshot).await;
            }
            if evaluating {
                agent.end_evaluation();
            }
        }
    }

    async fn fire(
        &self,
        agent: Arc<AgentRuntime>,
        fired: FiredTrigger,
        snapshot: &Arc<Vec<Message>>,
    ) {
        match fired.action {
            TriggerAction::ExecuteTask => self.fire_execute(agent, fired).await,
            TriggerAction::StopCluster => {
                info!(cluster = %self.id, agent = %agent.id(), "trigger requested stop");
                self.transition(ClusterState::Stopped).await;
            }
            TriggerAction::PublishMessage => {
                let Some(config) = fired.config else {
                    self.publish_hook_error(agent.id(), "publish_message trigger has no config")
                        .await;
                    return;
                };
                let spec: PublishSpec = match serde_json::from_value(config) {
                    Ok(spec) => spec,
                    Err(err) => {
                        self.publish_hook_error(
                            agent.id(),
                            &format!("publish_message config invalid: {err}"),
                        )
                        .await;
                        return;
                    }
                };
                let scope = HookScope::ledger_only(snapshot);
                if let Err(err) = self.hook_runner.publish(&spec, &scope, agent.id()).await {
                    self.publish_hook_error(agent.id(), &err.to_string()).await;
                }
            }
            TriggerAction::Noop => {
                debug!(agent = %agent.id(), "noop trigger");
            }
        }
    }

    /// Start one iteration, defer if busy, halt past the ceiling
    async fn fire_execute(&self, agent: Arc<AgentRuntime>, fired: FiredTrigger) {
        if agent.is_halted() {
            return;
        }
        if agent.iteration() + 1 > agent.definition.max_iterations {
            agent.halt();
            warn!(agent = %agent.id(), max = agent.definition.max_iterations, "iteration ceiling");
            let publish = Publish::new(topic::AGENT_HALTED, agent.id()).data(json!({
                "agent": agent.id(),
                "maxIterations": agent.definition.max_iterations,
            }));
            if let Err(err) = self.bus.publish(publish).await {
                warn!(cluster = %self.id, "failed to publish AGENT_HALTED: {err}");
            }
            return;
        }

        if agent.try_begin_execution().is_none() {
            debug!(agent = %agent.id(), "busy, trigger deferred");
            agent.defer(fired);
            return;
        }

        let Some(cluster) = self.self_ref.upgrade() else {
            return;
        };
        let executor = self.executor.clone();
        let events_tx = self.events_tx.clone();
        tokio::spawn(async move {
            let agent_id = agent.id().to_string();
            if let Err(err) = executor.execute(agent).await {
                cluster.fail(&format!("agent {agent_id}: {err}")).await;
                return;
            }
            let _ = events_tx.send(ClusterEvent::AgentIdle(agent_id));
        });
    }

    /// Fire the oldest deferred trigger for a newly idle agent
    async fn drain_deferred(&self, agent_id: &str) {
        if self.state() != ClusterState::Running {
            return;
        }
        let Some(agent) = self.agent(agent_id) else {
            return;
        };
        if let Some(fired) = agent.pop_deferred() {
            debug!(agent = %agent_id, "draining deferred trigger");
            self.fire_execute(agent, fired).await;
        }
    }

    /// Apply a `CLUSTER_OPERATIONS` list in declared order
    async fn apply_operations(&self, message: &Message) {
        let Some(data) = &message.content.data else {
            self.publish_hook_error(&message.sender, "CLUSTER_OPERATIONS has no data")
                .await;
            return;
        };
        let operations: Vec<ClusterOperation> = match data
            .get("operations")
            .cloned()
            .map(serde_json::from_value)
        {
            Some(Ok(ops)) => ops,
            Some(Err(err)) => {
                self.publish_hook_error(
                    &message.sender,
                    &format!("CLUSTER_OPERATIONS invalid: {err}"),
                )
                .await;
                return;
            }
            None => {
                self.publish_hook_error(&message.sender, "CLUSTER_OPERATIONS missing 'operations'")
                    .await;
                return;
            }
        };

        let mut config_dirty = false;
        for operation in operations {
            match operation {
                ClusterOperation::AddAgents { agents } => {
                    for def in agents {
                        let id = def.id.clone();
                        match self.register_agent(def).await {
                            Ok(()) => {
                                info!(cluster = %self.id, agent = %id, "agent added");
                                config_dirty = true;
                            }
                            Err(err) => {
                                self.publish_hook_error(
                                    &message.sender,
                                    &format!("add_agents '{id}': {err}"),
                                )
                                .await;
                            }
                        }
                    }
                }
                ClusterOperation::RemoveAgent { id } => {
                    let removed = self
                        .agents
                        .write()
                        .unwrap_or_else(|p| p.into_inner())
                        .remove(&id)
                        .is_some();
                    if removed {
                        self.config
                            .lock()
                            .unwrap_or_else(|p| p.into_inner())
                            .agents
                            .retain(|a| a.id != id);
                        info!(cluster = %self.id, agent = %id, "agent removed");
                        config_dirty = true;
                    }
                }
                ClusterOperation::Publish {
                    topic: publish_topic,
                    content,
                    metadata,
                } => {
                    let mut publish =
                        Publish::new(&publish_topic, message.sender.clone());
                    if let Some(content) = content {
                        publish = publish.content(content);
                    }
                    if let Some(metadata) = metadata {
                        publish.metadata = metadata;
                    }

                    // Republish semantics: re-emitting an earlier topic is
                    // tagged so default trigger filters skip it
                    let seen_before = match self
                        .bus
                        .count(&MessageFilter::topic(&publish_topic))
                        .await
                    {
                        Ok(n) => n > 0,
                        Err(err) => {
                            self.fail(&format!("ledger count failed: {err}")).await;
                            return;
                        }
                    };
                    if seen_before {
                        publish = publish.meta(crate::types::META_REPUBLISHED, json!(true));
                    }

                    if let Err(err) = self.bus.publish(publish).await {
                        self.publish_hook_error(
                            &message.sender,
                            &format!("publish '{publish_topic}': {err}"),
                        )
                        .await;
                    }
                }
                ClusterOperation::Stop { reason } => {
                    info!(cluster = %self.id, reason = ?reason, "operation requested stop");
                    self.transition(ClusterState::Stopped).await;
                }
            }
        }

        if config_dirty {
            self.persist_config().await;
        }
    }

    async fn publish_hook_error(&self, sender: &str, detail: &str) {
        error!(cluster = %self.id, "{detail}");
        let publish =
            Publish::new(topic::HOOK_ERROR, sender).data(json!({ "detail": detail }));
        if let Err(err) = self.bus.publish(publish).await {
            warn!(cluster = %self.id, "failed to publish HOOK_ERROR: {err}");
        }
    }
}

/// One row of per-agent status in `ClusterDetail`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentStatusRow {
    pub id: String,
    pub role: Option<String>,
    pub state: AgentState,
    pub iteration: u32,
    pub halted: bool,
}
