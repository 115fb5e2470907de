//! Hook actions and template interpolation
//!
//! Hooks are declarative post-task side effects: publish a message, stop
//! the cluster, spawn a sub-cluster, or do nothing. Message payloads may
//! carry `{{path}}` placeholders resolved against the parsed task result
//! and a pinned ledger view:
//!
//! - `{{result.some.field}}` resolves into the parsed JSON result
//! - `{{ledger.last(TOPIC).content.data.field}}` resolves into the newest record
//!   of a topic
//!
//! Unknown paths are rejected at resolve time rather than producing empty
//! strings; the failure surfaces as a `HOOK_ERROR` ledger record.

use crate::bus::{MessageBus, Publish};
use crate::error::{HarmoniaError, Result};
use crate::types::{topic, Message, MessageContent};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Payload of a `publish_message` hook or trigger action
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishSpec {
    pub topic: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<MessageContent>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Map<String, Value>>,
}

/// One declarative hook action
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum HookAction {
    /// Publish a message, with placeholder interpolation
    #[serde(rename_all = "camelCase")]
    PublishMessage {
        #[serde(flatten)]
        spec: PublishSpec,
    },

    /// Stop the cluster cooperatively
    #[serde(rename_all = "camelCase")]
    StopCluster {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },

    /// Spawn a sub-cluster and optionally wait for one of its topics
    #[serde(rename_all = "camelCase")]
    SpawnSubCluster {
        config: Value,
        input: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        wait_for_topic: Option<String>,
    },

    /// Explicit skip, used for templated branches
    Noop,
}

/// Hook attachment points on an agent
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HookSet {
    pub on_start: Option<HookAction>,
    pub on_complete: Option<HookAction>,
    pub on_error: Option<HookAction>,
}

/// Interpolation environment: the parsed result plus a pinned ledger view
pub struct HookScope<'a> {
    pub result: Option<&'a Value>,
    pub messages: &'a [Message],
}

impl HookScope<'_> {
    /// Scope with no task result (trigger-level publishes)
    pub fn ledger_only(messages: &[Message]) -> HookScope<'_> {
        HookScope {
            result: None,
            messages,
        }
    }
}

/// Recursive spawner interface implemented by the orchestrator
///
/// Returns the data value to mirror into the parent ledger as
/// `SUB_CLUSTER_COMPLETE`.
#[async_trait]
pub trait SubClusterSpawner: Send + Sync {
    async fn spawn(
        &self,
        config: Value,
        input: String,
        wait_for_topic: Option<String>,
    ) -> Result<Value>;
}

/// Cooperative stop request forwarded into the cluster dispatcher
#[derive(Debug, Clone)]
pub struct StopRequest {
    pub reason: Option<String>,
}

/// Executes hook actions on behalf of one cluster
pub struct HookRunner {
    bus: Arc<MessageBus>,
    stop_tx: mpsc::UnboundedSender<StopRequest>,
    spawner: Option<Arc<dyn SubClusterSpawner>>,
}

impl HookRunner {
    pub fn new(
        bus: Arc<MessageBus>,
        stop_tx: mpsc::UnboundedSender<StopRequest>,
        spawner: Option<Arc<dyn SubClusterSpawner>>,
    ) -> Self {
        Self {
            bus,
            stop_tx,
            spawner,
        }
    }

    /// Run one hook action; the caller maps failures to `HOOK_ERROR`
    pub async fn run(
        &self,
        action: &HookAction,
        scope: &HookScope<'_>,
        sender: &str,
    ) -> Result<()> {
        match action {
            HookAction::PublishMessage { spec } => self.publish(spec, scope, sender).await,
            HookAction::StopCluster { reason } => {
                info!(sender, reason = ?reason, "hook requested cluster stop");
                self.stop_tx
                    .send(StopRequest {
                        reason: reason.clone(),
                    })
                    .map_err(|_| HarmoniaError::Hook("cluster dispatcher is gone".to_string()))
            }
            HookAction::SpawnSubCluster {
                config,
                input,
                wait_for_topic,
            } => {
                let spawner = self.spawner.as_ref().ok_or_else(|| {
                    HarmoniaError::Hook("no sub-cluster spawner configured".to_string())
                })?;
                let data = spawner
                    .spawn(config.clone(), input.clone(), wait_for_topic.clone())
                    .await?;
                self.bus
                    .publish(
                        Publish::new(topic::SUB_CLUSTER_COMPLETE, sender)
                            .content(MessageContent::data(data)),
                    )
                    .await?;
                Ok(())
            }
            HookAction::Noop => {
                debug!(sender, "noop hook");
                Ok(())
            }
        }
    }

    /// Interpolate and publish a `publish_message` payload
    pub async fn publish(
        &self,
        spec: &PublishSpec,
        scope: &HookScope<'_>,
        sender: &str,
    ) -> Result<()> {
        let mut publish = Publish::new(&spec.topic, sender);

        if let Some(content) = &spec.content {
            let text = content
                .text
                .as_ref()
                .map(|t| {
                    interpolate_string(t, scope).map(|v| match v {
                        Value::String(s) => s,
                        other => other.to_string(),
                    })
                })
                .transpose()?;
            let data = content
                .data
                .as_ref()
                .map(|d| interpolate(d, scope))
                .transpose()?;
            publish = publish.content(MessageContent { text, data });
        }

        if let Some(metadata) = &spec.metadata {
            let interpolated = interpolate(&Value::Object(metadata.clone()), scope)?;
            if let Value::Object(map) = interpolated {
                publish.metadata = map;
            }
        }

        self.bus.publish(publish).await?;
        Ok(())
    }
}

/// Deep-interpolate every string in a JSON value
pub fn interpolate(value: &Value, scope: &HookScope<'_>) -> Result<Value> {
    match value {
        Value::String(s) => interpolate_string(s, scope),
        Value::Array(items) => Ok(Value::Array(
            items
                .iter()
                .map(|v| interpolate(v, scope))
                .collect::<Result<Vec<_>>>()?,
        )),
        Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (k, v) in map {
                out.insert(k.clone(), interpolate(v, scope)?);
            }
            Ok(Value::Object(out))
        }
        other => Ok(other.clone()),
    }
}

/// Interpolate one string
///
/// A string that is exactly one `{{token}}` takes the resolved value's
/// JSON type; otherwise resolved values are stringified into place.
pub fn interpolate_string(s: &str, scope: &HookScope<'_>) -> Result<Value> {
    let trimmed = s.trim();
    if trimmed.starts_with("{{") && trimmed.ends_with("}}") && !trimmed[2..].contains("{{") {
        let token = trimmed[2..trimmed.len() - 2].trim();
        return resolve_token(token, scope);
    }

    let mut out = String::with_capacity(s.len());
    let mut rest = s;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after.find("}}").ok_or_else(|| {
            HarmoniaError::Hook(format!("unterminated placeholder in '{s}'"))
        })?;
        let token = after[..end].trim();
        let resolved = resolve_token(token, scope)?;
        match resolved {
            Value::String(v) => out.push_str(&v),
            other => out.push_str(&other.to_string()),
        }
        rest = &after[end + 2..];
    }
    out.push_str(rest);
    Ok(Value::String(out))
}

/// Resolve one placeholder path against the scope
fn resolve_token(token: &str, scope: &HookScope<'_>) -> Result<Value> {
    if token == "result" || token.starts_with("result.") {
        let result = scope.result.ok_or_else(|| {
            HarmoniaError::Hook(format!("'{token}': no task result in scope"))
        })?;
        let path = token.strip_prefix("result").unwrap_or("");
        return navigate(result, path.strip_prefix('.').unwrap_or(path), token);
    }

    if let Some(rest) = token.strip_prefix("ledger.last(") {
        let close = rest.find(')').ok_or_else(|| {
            HarmoniaError::Hook(format!("'{token}': missing ')' after topic"))
        })?;
        let topic_name = rest[..close].trim();
        let message = scope
            .messages
            .iter()
            .rev()
            .find(|m| m.topic == topic_name)
            .ok_or_else(|| {
                HarmoniaError::Hook(format!("'{token}': no record with topic {topic_name}"))
            })?;
        let message_value = serde_json::to_value(message)?;
        let path = rest[close + 1..].trim_start_matches('.');
        return navigate(&message_value, path, token);
    }

    Err(HarmoniaError::Hook(format!(
        "unknown placeholder root in '{token}' (expected result.* or ledger.last(TOPIC).*)"
    )))
}

fn navigate(root: &Value, path: &str, token: &str) -> Result<Value> {
    if path.is_empty() {
        return Ok(root.clone());
    }
    let mut current = root;
    for segment in path.split('.') {
        current = match current {
            Value::Object(map) => map.get(segment),
            Value::Array(items) => segment
                .parse::<usize>()
                .ok()
                .and_then(|i| items.get(i)),
            _ => None,
        }
        .ok_or_else(|| {
            HarmoniaError::Hook(format!("'{token}': path segment '{segment}' not found"))
        })?;
    }
    Ok(current.clone())
}
