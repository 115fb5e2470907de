//! Shared test fixtures: a scripted stub runner and polling helpers

#![allow(dead_code)]

use async_trait::async_trait;
use harmonia::{Result, TaskOutcome, TaskRequest, TaskRunner};
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Scripted task runner: queued outcomes per agent, captured prompts
///
/// Without a queued outcome an agent gets a minimal valid JSON object.
/// The configurable delay keeps ledger timestamps of task boundaries
/// strictly ahead of the records that triggered them.
pub struct StubRunner {
    outputs: Mutex<HashMap<String, VecDeque<TaskOutcome>>>,
    prompts: Mutex<Vec<(String, String)>>,
    delay: Duration,
}

impl StubRunner {
    pub fn new() -> Arc<Self> {
        Self::with_delay(Duration::from_millis(10))
    }

    pub fn with_delay(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            outputs: Mutex::new(HashMap::new()),
            prompts: Mutex::new(Vec::new()),
            delay,
        })
    }

    /// Queue the next outcome for an agent
    pub fn queue(&self, agent: &str, outcome: TaskOutcome) {
        self.outputs
            .lock()
            .unwrap()
            .entry(agent.to_string())
            .or_default()
            .push_back(outcome);
    }

    /// Prompts captured for one agent, in execution order
    pub fn prompts_for(&self, agent: &str) -> Vec<String> {
        self.prompts
            .lock()
            .unwrap()
            .iter()
            .filter(|(a, _)| a == agent)
            .map(|(_, p)| p.clone())
            .collect()
    }

    /// Total number of runner invocations
    pub fn invocations(&self) -> usize {
        self.prompts.lock().unwrap().len()
    }
}

#[async_trait]
impl TaskRunner for StubRunner {
    async fn run(&self, request: TaskRequest) -> Result<TaskOutcome> {
        self.prompts
            .lock()
            .unwrap()
            .push((request.agent_id.clone(), request.prompt.clone()));

        tokio::select! {
            _ = request.cancel.cancelled() => {
                return Ok(TaskOutcome::failure("cancelled"));
            }
            _ = tokio::time::sleep(self.delay) => {}
        }

        let queued = self
            .outputs
            .lock()
            .unwrap()
            .get_mut(&request.agent_id)
            .and_then(|q| q.pop_front());
        Ok(queued.unwrap_or_else(|| TaskOutcome::success(r#"{"summary": "ok"}"#)))
    }
}

/// Route engine tracing into the test output when RUST_LOG is set
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Poll `check` every 20 ms until it yields true, for up to 5 s
pub async fn wait_until<F, Fut>(what: &str, check: F)
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    loop {
        if check().await {
            return;
        }
        if std::time::Instant::now() >= deadline {
            panic!("timed out waiting for: {what}");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
