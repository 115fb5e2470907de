//! Task runner plug point
//!
//! The engine never calls a model itself. Each agent iteration hands a
//! composed prompt to an external runner (an AI CLI wrapper, a test stub)
//! through this trait and consumes its structured outcome. Runners are
//! contractually required to honor the cancellation token within a bounded
//! time: their own timeout, plus SIGKILL after that.

use crate::error::Result;
use crate::settings::ModelLevel;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Requested output shape for one task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum OutputFormat {
    #[serde(rename = "text")]
    Text,
    #[default]
    #[serde(rename = "json")]
    Json,
    #[serde(rename = "stream-json")]
    StreamJson,
}

/// Streaming output callback: `(chunk, agent_id)`
pub type OutputCallback = Arc<dyn Fn(&str, &str) + Send + Sync>;

/// Everything a runner needs for one invocation
#[derive(Clone)]
pub struct TaskRequest {
    /// Composed prompt (system + context + schema instruction)
    pub prompt: String,

    /// Agent on whose behalf the task runs
    pub agent_id: String,

    /// Provider name, e.g. `claude`
    pub provider: String,

    /// Concrete model name, if the workflow pinned one
    pub model: Option<String>,

    /// Capability level for providers that map levels to models
    pub model_level: Option<ModelLevel>,

    /// Provider-specific reasoning effort hint
    pub reasoning_effort: Option<String>,

    pub output_format: OutputFormat,

    /// Schema the final output must satisfy, if any
    pub json_schema: Option<Value>,

    /// Whether the runner should enforce the schema in-band
    pub strict_schema: bool,

    /// Working directory for the subprocess
    pub cwd: Option<PathBuf>,

    /// Streaming output hook; runners without streaming ignore it
    pub on_output: Option<OutputCallback>,

    /// Cluster cancellation token
    pub cancel: CancellationToken,
}

impl std::fmt::Debug for TaskRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskRequest")
            .field("agent_id", &self.agent_id)
            .field("provider", &self.provider)
            .field("model", &self.model)
            .field("model_level", &self.model_level)
            .field("output_format", &self.output_format)
            .field("strict_schema", &self.strict_schema)
            .field("cwd", &self.cwd)
            .field("prompt_len", &self.prompt.len())
            .finish()
    }
}

/// Structured result of one runner invocation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskOutcome {
    pub success: bool,

    /// Full output; for streaming runners, the concatenation of chunks
    pub output: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Runner-assigned task identifier, if it has one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
}

impl TaskOutcome {
    /// Successful outcome with the given output
    pub fn success(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: output.into(),
            error: None,
            task_id: None,
        }
    }

    /// Failed outcome with the given error
    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            output: String::new(),
            error: Some(error.into()),
            task_id: None,
        }
    }
}

/// Opaque execution of one prompt
#[async_trait]
pub trait TaskRunner: Send + Sync {
    /// Run one task to completion (or cancellation)
    async fn run(&self, request: TaskRequest) -> Result<TaskOutcome>;
}
