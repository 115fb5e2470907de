//! Context assembly
//!
//! Builds the text prompt handed to the task runner from ordered slices of
//! the cluster ledger. Source order is preserved and repetition across
//! sources is deliberate: a workflow may want the same topic rendered
//! under two different windows.

use crate::error::{HarmoniaError, Result};
use crate::ledger::{LedgerStore, MessageFilter};
use crate::types::Message;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::sync::Arc;

/// Lower bound for one context source's ledger window
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SinceSpec {
    /// The cluster's creation instant
    ClusterStart,
    /// The agent's previous task-end instant, or cluster start if none
    LastTaskEnd,
    /// A fixed instant
    Timestamp(DateTime<Utc>),
}

impl Serialize for SinceSpec {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            SinceSpec::ClusterStart => serializer.serialize_str("cluster_start"),
            SinceSpec::LastTaskEnd => serializer.serialize_str("last_task_end"),
            SinceSpec::Timestamp(ts) => serializer.serialize_str(&ts.to_rfc3339()),
        }
    }
}

impl<'de> Deserialize<'de> for SinceSpec {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        match s.as_str() {
            "cluster_start" => Ok(SinceSpec::ClusterStart),
            "last_task_end" => Ok(SinceSpec::LastTaskEnd),
            other => DateTime::parse_from_rfc3339(other)
                .map(|ts| SinceSpec::Timestamp(ts.with_timezone(&Utc)))
                .map_err(|e| {
                    serde::de::Error::custom(format!(
                        "since must be cluster_start, last_task_end, or ISO-8601: {e}"
                    ))
                }),
        }
    }
}

/// One ledger slice feeding the context
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextSource {
    pub topic: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub since: Option<SinceSpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
}

/// Ordered list of context sources for one agent
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextStrategy {
    #[serde(default)]
    pub sources: Vec<ContextSource>,
}

/// Assembles prompts from ledger slices
pub struct ContextBuilder {
    ledger: Arc<dyn LedgerStore>,
    cluster_created_at: i64,
}

impl ContextBuilder {
    pub fn new(ledger: Arc<dyn LedgerStore>, cluster_created_at: i64) -> Self {
        Self {
            ledger,
            cluster_created_at,
        }
    }

    /// Resolve a `since` spec to a UNIX-millis lower bound
    fn resolve_since(&self, spec: Option<&SinceSpec>, last_task_end: Option<i64>) -> i64 {
        match spec {
            None | Some(SinceSpec::ClusterStart) => self.cluster_created_at,
            Some(SinceSpec::LastTaskEnd) => last_task_end.unwrap_or(self.cluster_created_at),
            Some(SinceSpec::Timestamp(ts)) => ts.timestamp_millis(),
        }
    }

    /// Render every source in order into one context block
    pub async fn render_sources(
        &self,
        strategy: &ContextStrategy,
        last_task_end: Option<i64>,
    ) -> Result<String> {
        let mut sections = Vec::with_capacity(strategy.sources.len());

        for source in &strategy.sources {
            let mut filter = MessageFilter::topic(&source.topic)
                .since(self.resolve_since(source.since.as_ref(), last_task_end));
            if let Some(sender) = &source.sender {
                filter = filter.sender(sender);
            }
            if let Some(limit) = source.limit {
                filter = filter.limit(limit);
            }

            let messages = self.ledger.query(&filter).await?;
            sections.push(render_section(&source.topic, &messages)?);
        }

        Ok(sections.join("\n\n"))
    }
}

fn render_section(topic: &str, messages: &[Message]) -> Result<String> {
    let mut out = format!("Messages from topic: {topic}");
    for msg in messages {
        out.push('\n');
        out.push_str(&format!(
            "{} ({}): {}",
            msg.sender,
            msg.timestamp_utc().to_rfc3339(),
            msg.content.text.as_deref().unwrap_or("")
        ));
        if let Some(data) = &msg.content.data {
            out.push('\n');
            out.push_str(
                &serde_json::to_string_pretty(data).map_err(HarmoniaError::Serialization)?,
            );
        }
    }
    Ok(out)
}

/// Canonical schema instruction appended when the outbound format is
/// stream-json but a schema still constrains the final object
pub fn schema_instruction(schema: &serde_json::Value) -> Result<String> {
    let pretty = serde_json::to_string_pretty(schema)?;
    Ok(format!(
        "OUTPUT FORMAT\n\
         Respond with exactly one JSON object conforming to the schema \
         below. Do not wrap it in markdown or code fences.\n\n{pretty}"
    ))
}

/// Compose the final prompt: system prompt, context sections, optional
/// schema instruction
pub fn compose_prompt(
    system: Option<&str>,
    sections: &str,
    schema_block: Option<&str>,
) -> String {
    let mut parts = Vec::new();
    if let Some(system) = system {
        if !system.is_empty() {
            parts.push(system.to_string());
        }
    }
    if !sections.is_empty() {
        parts.push(sections.to_string());
    }
    if let Some(block) = schema_block {
        parts.push(block.to_string());
    }
    parts.join("\n\n")
}
