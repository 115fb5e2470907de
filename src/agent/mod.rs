//! Agent definitions and lifecycle
//!
//! An agent is a bounded lifecycle around invocations of an external task
//! runner. Runtime states: idle → evaluating → executing → idle. A single
//! agent has at most one task in flight; its iteration counter increments
//! before each spawn and never decreases.
//!
//! The execute path (one iteration):
//! 1. Publish `TASK_STARTED` (powers crash resume)
//! 2. Run the `on_start` hook
//! 3. Select the model for this iteration and enforce the policy
//! 4. Assemble context and apply the schema-vs-streaming policy
//! 5. Call the task runner, racing the timeout and stale watchdogs
//! 6. Parse and validate output, run `on_complete` / `on_error`
//! 7. Publish `TASK_COMPLETED`, record the task-end instant, go idle

pub mod model;
pub mod output;

use crate::bus::{MessageBus, Publish};
use crate::context::{compose_prompt, schema_instruction, ContextBuilder, ContextStrategy};
use crate::error::{HarmoniaError, Result};
use crate::hooks::{HookAction, HookRunner, HookScope, HookSet};
use crate::ledger::MessageFilter;
use crate::runner::{OutputFormat, TaskOutcome, TaskRequest, TaskRunner};
use crate::settings::SettingsStore;
use crate::trigger::{FiredTrigger, TriggerDef};
use crate::types::{topic, MessageContent};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub use model::{IterationPattern, ModelChoice, ModelConfig, ModelRule};

fn default_max_iterations() -> u32 {
    100
}

fn default_stale_ms() -> u64 {
    30 * 60 * 1000
}

/// System prompt keyed by iteration pattern
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IterationPrompt {
    #[serde(rename = "match")]
    pub pattern: IterationPattern,
    pub system: String,
}

/// Agent system prompt: static, first-vs-later, or iteration-keyed
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PromptSpec {
    Static(String),
    Staged { initial: String, subsequent: String },
    ByIteration { iterations: Vec<IterationPrompt> },
}

impl PromptSpec {
    /// System prompt for the given iteration, if any pattern matches
    pub fn system_for(&self, iteration: u32) -> Option<&str> {
        match self {
            PromptSpec::Static(s) => Some(s),
            PromptSpec::Staged {
                initial,
                subsequent,
            } => {
                if iteration <= 1 {
                    Some(initial)
                } else {
                    Some(subsequent)
                }
            }
            PromptSpec::ByIteration { iterations } => iterations
                .iter()
                .find(|p| p.pattern.matches(iteration))
                .map(|p| p.system.as_str()),
        }
    }
}

/// Declarative agent definition (the input schema)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentDefinition {
    /// Unique within the cluster
    pub id: String,

    /// Free-form role tag; `validator` changes schema-failure severity
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<PromptSpec>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub triggers: Vec<TriggerDef>,

    #[serde(default)]
    pub hooks: HookSet,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_strategy: Option<ContextStrategy>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_config: Option<ModelConfig>,

    #[serde(default)]
    pub output_format: OutputFormat,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub json_schema: Option<Value>,

    /// Defaults to the engine-wide setting when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strict_schema: Option<bool>,

    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,

    /// 0 disables the timeout
    #[serde(default, alias = "timeout_ms")]
    pub timeout_ms: u64,

    #[serde(default = "default_stale_ms", alias = "staleDuration_ms")]
    pub stale_duration_ms: u64,

    /// Working directory; inherited from the cluster when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<PathBuf>,

    /// Provider override; defaults to the settings default provider
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
}

impl AgentDefinition {
    /// Whether schema failures are fatal for this agent's iterations
    pub fn is_validator(&self) -> bool {
        self.role.as_deref() == Some("validator")
    }
}

/// Resolved agent list for one cluster
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterConfig {
    pub agents: Vec<AgentDefinition>,
}

impl ClusterConfig {
    /// Validate the configuration; fatal at cluster start
    pub fn validate(&self) -> Result<()> {
        if self.agents.is_empty() {
            return Err(HarmoniaError::Config(
                "cluster config declares no agents".to_string(),
            ));
        }
        let mut seen = std::collections::HashSet::new();
        for agent in &self.agents {
            if agent.id.is_empty() {
                return Err(HarmoniaError::Config("agent id must not be empty".to_string()));
            }
            if !seen.insert(agent.id.as_str()) {
                return Err(HarmoniaError::Config(format!(
                    "duplicate agent id '{}'",
                    agent.id
                )));
            }
        }
        Ok(())
    }
}

/// Agent runtime lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    /// Waiting for a trigger
    Idle,
    /// Inside trigger processing (transient)
    Evaluating,
    /// One task in flight
    Executing,
}

/// Mutable runtime state around one agent definition
pub struct AgentRuntime {
    pub definition: AgentDefinition,
    iteration: AtomicU32,
    state: Mutex<AgentState>,
    last_task_end: Mutex<Option<i64>>,
    halted: AtomicBool,
    deferred: Mutex<VecDeque<FiredTrigger>>,
}

impl AgentRuntime {
    pub fn new(definition: AgentDefinition) -> Self {
        Self {
            definition,
            iteration: AtomicU32::new(0),
            state: Mutex::new(AgentState::Idle),
            last_task_end: Mutex::new(None),
            halted: AtomicBool::new(false),
            deferred: Mutex::new(VecDeque::new()),
        }
    }

    pub fn id(&self) -> &str {
        &self.definition.id
    }

    pub fn iteration(&self) -> u32 {
        self.iteration.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> AgentState {
        *self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn last_task_end(&self) -> Option<i64> {
        *self.last_task_end.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }

    /// Refuse further `execute_task` triggers
    pub fn halt(&self) {
        self.halted.store(true, Ordering::SeqCst);
    }

    /// Restore counters after crash resume
    pub fn restore(&self, iteration: u32, last_task_end: Option<i64>) {
        self.iteration.store(iteration, Ordering::SeqCst);
        *self.last_task_end.lock().unwrap_or_else(|p| p.into_inner()) = last_task_end;
    }

    /// Idle → evaluating, entered by the dispatcher while it matches
    /// triggers for this agent
    pub fn begin_evaluation(&self) -> bool {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        if *state != AgentState::Idle {
            return false;
        }
        *state = AgentState::Evaluating;
        true
    }

    /// Evaluating → idle, unless a trigger moved the agent to executing
    pub fn end_evaluation(&self) {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        if *state == AgentState::Evaluating {
            *state = AgentState::Idle;
        }
    }

    /// Idle/evaluating → executing, incrementing the iteration counter
    ///
    /// Returns the new iteration, or None if the agent already has a task
    /// in flight or is halted. The dispatcher calls this before spawning
    /// the task so a single agent never has two tasks in flight.
    pub fn try_begin_execution(&self) -> Option<u32> {
        if self.is_halted() {
            return None;
        }
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        if *state == AgentState::Executing {
            return None;
        }
        *state = AgentState::Executing;
        Some(self.iteration.fetch_add(1, Ordering::SeqCst) + 1)
    }

    /// Executing → idle, recording the task-end instant
    pub fn finish_execution(&self, ended_at: i64) {
        *self.last_task_end.lock().unwrap_or_else(|p| p.into_inner()) = Some(ended_at);
        *self.state.lock().unwrap_or_else(|p| p.into_inner()) = AgentState::Idle;
    }

    /// Queue a trigger that fired while the agent was busy
    pub fn defer(&self, fired: FiredTrigger) {
        self.deferred
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push_back(fired);
    }

    /// Take the oldest deferred trigger
    pub fn pop_deferred(&self) -> Option<FiredTrigger> {
        self.deferred
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .pop_front()
    }
}

/// Result category of one iteration, for dispatcher bookkeeping
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IterationVerdict {
    Succeeded,
    Failed,
}

/// Executes single agent iterations
///
/// The dispatcher transitions the agent to `executing` and increments the
/// iteration before handing it here; this struct does everything else.
pub struct AgentExecutor {
    pub bus: Arc<MessageBus>,
    pub runner: Arc<dyn TaskRunner>,
    pub hook_runner: Arc<HookRunner>,
    pub settings: SettingsStore,
    pub cluster_created_at: i64,
    pub cancel: CancellationToken,
}

impl AgentExecutor {
    /// Run one full iteration for `agent`
    ///
    /// Always returns the agent to idle. Only unrecoverable failures
    /// (ledger corruption, closed ledger) bubble up as errors.
    pub async fn execute(&self, agent: Arc<AgentRuntime>) -> Result<IterationVerdict> {
        let iteration = agent.iteration();
        let agent_id = agent.id().to_string();
        let def = &agent.definition;

        info!(agent = %agent_id, iteration, "task starting");
        self.bus
            .publish(
                Publish::new(topic::TASK_STARTED, &agent_id).data(json!({
                    "agent": agent_id,
                    "iteration": iteration,
                })),
            )
            .await?;

        if let Some(hook) = &def.hooks.on_start {
            self.run_hook(hook, &agent_id, None, "onStart").await?;
        }

        let verdict = match self.run_iteration(&agent, iteration).await {
            Ok(verdict) => verdict,
            Err(err) if is_fatal(&err) => return Err(err),
            Err(err) => {
                // Everything non-fatal was already surfaced as a ledger
                // record by run_iteration
                debug!(agent = %agent_id, "iteration error: {err}");
                IterationVerdict::Failed
            }
        };

        let completed = self
            .bus
            .publish(
                Publish::new(topic::TASK_COMPLETED, &agent_id).data(json!({
                    "agent": agent_id,
                    "iteration": iteration,
                    "success": verdict == IterationVerdict::Succeeded,
                })),
            )
            .await?;

        agent.finish_execution(completed.timestamp);
        info!(agent = %agent_id, iteration, success = verdict == IterationVerdict::Succeeded, "task finished");
        Ok(verdict)
    }

    /// Model selection through output handling; ledger records for every
    /// failure mode
    async fn run_iteration(
        &self,
        agent: &Arc<AgentRuntime>,
        iteration: u32,
    ) -> Result<IterationVerdict> {
        let def = &agent.definition;
        let agent_id = def.id.clone();

        // Settings are read-through at task spawn
        let settings = self.settings.load()?;

        // Model selection
        let provider = def
            .provider
            .clone()
            .unwrap_or_else(|| settings.default_provider.clone());
        let model_config = def.model_config.clone().unwrap_or_default();
        let mut choice = match model::select_model(&model_config, iteration, &settings) {
            Ok(choice) => choice,
            Err(HarmoniaError::ModelPolicy { code, detail }) => {
                warn!(agent = %agent_id, %code, "model policy violation: {detail}");
                self.bus
                    .publish(
                        Publish::new(topic::AGENT_ERROR, &agent_id).data(json!({
                            "agent": agent_id,
                            "iteration": iteration,
                            "errorCode": code.as_str(),
                            "detail": detail,
                        })),
                    )
                    .await?;
                return Ok(IterationVerdict::Failed);
            }
            Err(other) => return Err(other),
        };

        // Provider level overrides may pin a concrete model name
        if choice.model.is_none() {
            if let (Some(level), Some(provider_settings)) = (
                choice.model_level,
                settings.provider_settings.get(&provider),
            ) {
                if let Some(name) = provider_settings.level_overrides.get(level.as_str()) {
                    choice.model = Some(name.clone());
                }
            }
        }

        // Context assembly
        let strategy = def.context_strategy.clone().unwrap_or_default();
        let builder = ContextBuilder::new(self.bus.ledger().clone(), self.cluster_created_at);
        let sections = builder
            .render_sources(&strategy, agent.last_task_end())
            .await?;
        let system = def
            .prompt
            .as_ref()
            .and_then(|p| p.system_for(iteration))
            .map(str::to_string);

        // Schema-vs-streaming policy
        let strict = def.strict_schema.unwrap_or(settings.strict_schema);
        let schema = match def.output_format {
            OutputFormat::Text => def.json_schema.clone(),
            _ => Some(def.json_schema.clone().unwrap_or_else(output::default_schema)),
        };
        let (effective_format, embed_schema) = match (strict, def.output_format, &schema) {
            (true, OutputFormat::Json, _) => (OutputFormat::Json, false),
            (false, OutputFormat::Json, Some(_)) => (OutputFormat::StreamJson, true),
            (_, OutputFormat::StreamJson, Some(_)) => (OutputFormat::StreamJson, true),
            (_, fmt, _) => (fmt, false),
        };

        let schema_block = if embed_schema {
            match &schema {
                Some(s) => Some(schema_instruction(s)?),
                None => None,
            }
        } else {
            None
        };
        let prompt = compose_prompt(system.as_deref(), &sections, schema_block.as_deref());

        // Runner invocation with watchdogs
        let task_cancel = self.cancel.child_token();
        let request = TaskRequest {
            prompt,
            agent_id: agent_id.clone(),
            provider,
            model: choice.model.clone(),
            model_level: choice.model_level,
            reasoning_effort: choice.reasoning_effort.clone(),
            output_format: effective_format,
            json_schema: schema.clone(),
            strict_schema: strict,
            cwd: def.cwd.clone(),
            on_output: None,
            cancel: task_cancel.clone(),
        };

        let outcome = match self
            .run_with_watchdogs(request, &agent_id, iteration, def, &task_cancel)
            .await?
        {
            Some(outcome) => outcome,
            // Watchdog fired; records already published
            None => return Ok(IterationVerdict::Failed),
        };

        if !outcome.success {
            let detail = outcome
                .error
                .unwrap_or_else(|| "runner reported failure".to_string());
            warn!(agent = %agent_id, "runner failure: {detail}");
            self.bus
                .publish(
                    Publish::new(topic::AGENT_ERROR, &agent_id).data(json!({
                        "agent": agent_id,
                        "iteration": iteration,
                        "errorCode": "RUNNER_ERROR",
                        "detail": detail,
                    })),
                )
                .await?;
            if let Some(hook) = &def.hooks.on_error {
                self.run_hook(hook, &agent_id, None, "onError").await?;
            }
            return Ok(IterationVerdict::Failed);
        }

        // Output parsing
        let (result_value, verdict) = match &schema {
            Some(schema) => {
                self.handle_structured_output(&outcome.output, schema, def, iteration)
                    .await?
            }
            None => (None, IterationVerdict::Succeeded),
        };

        if verdict == IterationVerdict::Failed {
            if let Some(hook) = &def.hooks.on_error {
                self.run_hook(hook, &agent_id, result_value.as_ref(), "onError")
                    .await?;
            }
            return Ok(IterationVerdict::Failed);
        }

        if let Some(hook) = &def.hooks.on_complete {
            self.run_hook(hook, &agent_id, result_value.as_ref(), "onComplete")
                .await?;
        }

        Ok(IterationVerdict::Succeeded)
    }

    /// Race the runner against the timeout and stale watchdogs
    ///
    /// Both bounds are independent; the stricter fires first. Returns None
    /// when a watchdog cancelled the task.
    async fn run_with_watchdogs(
        &self,
        request: TaskRequest,
        agent_id: &str,
        iteration: u32,
        def: &AgentDefinition,
        task_cancel: &CancellationToken,
    ) -> Result<Option<TaskOutcome>> {
        let run_fut = self.runner.run(request);
        tokio::pin!(run_fut);

        let timeout_ms = def.timeout_ms;
        let stale_ms = def.stale_duration_ms;

        tokio::select! {
            result = &mut run_fut => {
                match result {
                    Ok(outcome) => Ok(Some(outcome)),
                    Err(err) => {
                        self.bus.publish(
                            Publish::new(topic::AGENT_ERROR, agent_id).data(json!({
                                "agent": agent_id,
                                "iteration": iteration,
                                "errorCode": "RUNNER_ERROR",
                                "detail": err.to_string(),
                            })),
                        ).await?;
                        if let Some(hook) = &def.hooks.on_error {
                            self.run_hook(hook, agent_id, None, "onError").await?;
                        }
                        Ok(None)
                    }
                }
            }
            _ = watchdog(timeout_ms), if timeout_ms > 0 => {
                warn!(agent = %agent_id, timeout_ms, "task timed out");
                task_cancel.cancel();
                self.bus.publish(
                    Publish::new(topic::AGENT_TIMEOUT, agent_id).data(json!({
                        "agent": agent_id,
                        "iteration": iteration,
                        "timeoutMs": timeout_ms,
                    })),
                ).await?;
                Ok(None)
            }
            _ = watchdog(stale_ms), if stale_ms > 0 => {
                warn!(agent = %agent_id, stale_ms, "task went stale");
                task_cancel.cancel();
                self.bus.publish(
                    Publish::new(topic::AGENT_STALE, agent_id).data(json!({
                        "agent": agent_id,
                        "iteration": iteration,
                        "staleDurationMs": stale_ms,
                    })),
                ).await?;
                Ok(None)
            }
        }
    }

    /// Parse, normalize, and validate structured output
    async fn handle_structured_output(
        &self,
        raw: &str,
        schema: &Value,
        def: &AgentDefinition,
        iteration: u32,
    ) -> Result<(Option<Value>, IterationVerdict)> {
        let agent_id = &def.id;
        match output::parse_structured(raw, schema) {
            Ok((value, Ok(()))) => Ok((Some(value), IterationVerdict::Succeeded)),
            Ok((value, Err(violations))) => {
                if def.is_validator() {
                    self.bus
                        .publish(
                            Publish::new(topic::AGENT_ERROR, agent_id).data(json!({
                                "agent": agent_id,
                                "iteration": iteration,
                                "errorCode": "SCHEMA_ERROR",
                                "violations": violations,
                            })),
                        )
                        .await?;
                    Ok((Some(value), IterationVerdict::Failed))
                } else {
                    self.bus
                        .publish(
                            Publish::new(topic::AGENT_SCHEMA_WARNING, agent_id)
                                .content(MessageContent {
                                    text: Some(raw.to_string()),
                                    data: Some(json!({
                                        "agent": agent_id,
                                        "iteration": iteration,
                                        "violations": violations,
                                    })),
                                }),
                        )
                        .await?;
                    // Output passes through as text; the parsed value is
                    // not trustworthy enough for hooks
                    Ok((None, IterationVerdict::Succeeded))
                }
            }
            Err(parse_err) => {
                if def.is_validator() {
                    self.bus
                        .publish(
                            Publish::new(topic::AGENT_ERROR, agent_id).data(json!({
                                "agent": agent_id,
                                "iteration": iteration,
                                "errorCode": "PARSE_ERROR",
                                "detail": parse_err.to_string(),
                            })),
                        )
                        .await?;
                    Ok((None, IterationVerdict::Failed))
                } else {
                    self.bus
                        .publish(
                            Publish::new(topic::AGENT_SCHEMA_WARNING, agent_id)
                                .content(MessageContent {
                                    text: Some(raw.to_string()),
                                    data: Some(json!({
                                        "agent": agent_id,
                                        "iteration": iteration,
                                        "detail": parse_err.to_string(),
                                    })),
                                }),
                        )
                        .await?;
                    Ok((None, IterationVerdict::Succeeded))
                }
            }
        }
    }

    /// Run one hook; failures become `HOOK_ERROR` records, never silent
    async fn run_hook(
        &self,
        hook: &HookAction,
        agent_id: &str,
        result: Option<&Value>,
        which: &str,
    ) -> Result<()> {
        let snapshot = self.bus.query(&MessageFilter::default()).await?;
        let scope = HookScope {
            result,
            messages: &snapshot,
        };
        if let Err(err) = self.hook_runner.run(hook, &scope, agent_id).await {
            error!(agent = %agent_id, hook = which, "hook failed: {err}");
            self.bus
                .publish(
                    Publish::new(topic::HOOK_ERROR, agent_id).data(json!({
                        "agent": agent_id,
                        "hook": which,
                        "detail": err.to_string(),
                    })),
                )
                .await?;
        }
        Ok(())
    }
}

/// Whether an error must abort the cluster rather than the iteration
fn is_fatal(err: &HarmoniaError) -> bool {
    matches!(
        err,
        HarmoniaError::LedgerCorruption(_) | HarmoniaError::Database(_)
    )
}

async fn watchdog(ms: u64) {
    tokio::time::sleep(std::time::Duration::from_millis(ms)).await;
}
