//! Harmonia - Multi-Agent Coordination Engine
//!
//! A coordination fabric for AI-assistant subprocess agents. A user
//! submits a task (a GitHub issue body, a text string, or a markdown
//! file) and the engine drives a set of agents (planners, workers,
//! validators) through a message-driven loop until a termination
//! condition fires. The engine never calls a model itself; each agent is
//! a bounded lifecycle around an external task runner.
//!
//! # Architecture
//!
//! The system is organized into layers, leaves first:
//! - **Ledger**: per-cluster append-only SQLite event log
//! - **Bus**: publish/subscribe fan-out over the ledger
//! - **Triggers**: sandboxed predicate evaluation, first match wins
//! - **Agents**: iteration-counted lifecycles around runner invocations
//! - **Orchestrator**: cluster table, dynamic agent spawning, crash resume
//!
//! # Example
//!
//! ```ignore
//! use harmonia::{
//!     ClusterInput, ClusterSpec, Orchestrator, OrchestratorConfig, StartOptions,
//! };
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let orchestrator = Orchestrator::new(
//!         OrchestratorConfig {
//!             state_dir: ".harmonia".into(),
//!             templates_dir: Some("templates".into()),
//!             settings_path: Some(".harmonia/settings.json".into()),
//!         },
//!         my_runner,
//!     )?;
//!
//!     let config = serde_json::from_str(include_str!("../workflow.json"))?;
//!     let cluster = orchestrator
//!         .start(
//!             ClusterSpec::Inline(config),
//!             ClusterInput::Text { text: "Implement dark mode".into() },
//!             StartOptions::default(),
//!         )
//!         .await?;
//!
//!     println!("cluster {} running", cluster.id);
//!     Ok(())
//! }
//! ```

pub mod agent;
pub mod bus;
pub mod context;
pub mod error;
pub mod hooks;
pub mod isolation;
pub mod ledger;
pub mod orchestrator;
pub mod runner;
pub mod settings;
pub mod template;
pub mod trigger;
pub mod types;

// Re-export commonly used types
pub use agent::{
    AgentDefinition, AgentRuntime, AgentState, ClusterConfig, IterationPattern, ModelChoice,
    ModelConfig, ModelRule, PromptSpec,
};
pub use bus::{MessageBus, Publish, SubscriptionId};
pub use context::{ContextSource, ContextStrategy, SinceSpec};
pub use error::{HarmoniaError, ModelPolicyCode, Result};
pub use hooks::{HookAction, HookRunner, HookSet, PublishSpec, SubClusterSpawner};
pub use isolation::IsolationProvider;
pub use ledger::{FileLock, LedgerStore, MessageDraft, MessageFilter, SqliteLedger};
pub use orchestrator::{
    AgentStatusRow, ClusterDetail, ClusterOperation, ClusterRecord, ClusterRuntime, ClusterSpec,
    ClusterSummary, LogStream, Orchestrator, OrchestratorConfig, StartOptions,
};
pub use runner::{OutputFormat, TaskOutcome, TaskRequest, TaskRunner};
pub use settings::{EngineSettings, ModelLevel, ProviderSettings, SettingsStore};
pub use template::{ClusterTemplate, TemplateResolver};
pub use trigger::{TriggerAction, TriggerDef, TriggerEngine, TriggerFilter, TriggerLogic};
pub use types::{
    topic, ClusterId, ClusterInput, ClusterState, InputSource, Message, MessageContent, MessageId,
};
