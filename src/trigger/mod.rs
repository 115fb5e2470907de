//! Trigger engine
//!
//! Every published message is matched against each agent's ordered trigger
//! list; the first trigger that matches wins. A trigger fires when:
//!
//! 1. Its topic equals the message topic and the message is broadcast or
//!    addressed to the agent
//! 2. Its republish filter passes (republished records are excluded by
//!    default)
//! 3. Its `logic` predicate, if any, evaluates truthy in the sandbox
//! 4. It has not already fired for this exact message id
//!
//! State checks (`execute_task` requires an idle agent) and deferral live
//! in the cluster dispatcher, which owns agent runtime state.

pub mod logic;

use crate::types::{Message, MessageId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Mutex;
use tracing::warn;

pub use logic::{LogicOutcome, LogicWorld};

/// What a fired trigger does
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerAction {
    /// Run one agent iteration
    ExecuteTask,
    /// Stop the cluster cooperatively
    StopCluster,
    /// Publish a message described by the trigger's `config`
    PublishMessage,
    /// Explicit skip, used for templated branches
    Noop,
}

/// Republish filtering for a trigger
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TriggerFilter {
    /// Skip records carrying `_republished: true`
    pub exclude_republished: bool,
}

impl Default for TriggerFilter {
    fn default() -> Self {
        Self {
            exclude_republished: true,
        }
    }
}

/// Sandboxed predicate plus its filter
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TriggerLogic {
    /// Predicate script; absent means "always true"
    pub script: Option<String>,

    /// Republish filter
    pub filter: TriggerFilter,
}

/// One `(topic, logic, action)` attachment on an agent
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerDef {
    pub topic: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logic: Option<TriggerLogic>,

    pub action: TriggerAction,

    /// Action payload (e.g. the message published by `publish_message`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<Value>,
}

impl TriggerDef {
    /// Whether republished records are excluded for this trigger
    pub fn excludes_republished(&self) -> bool {
        self.logic
            .as_ref()
            .map(|l| l.filter.exclude_republished)
            .unwrap_or(true)
    }
}

/// A trigger selected for firing
#[derive(Debug, Clone)]
pub struct FiredTrigger {
    /// Index into the agent's trigger list
    pub index: usize,
    pub action: TriggerAction,
    pub config: Option<Value>,
    /// The record that fired it
    pub message: Message,
}

/// First-match trigger selection with per-message idempotency
///
/// The fired table is keyed by `(agent_id, trigger_index, message_id)`;
/// a trigger fires at most once per message.
pub struct TriggerEngine {
    fired: Mutex<HashSet<(String, usize, MessageId)>>,
}

impl TriggerEngine {
    pub fn new() -> Self {
        Self {
            fired: Mutex::new(HashSet::new()),
        }
    }

    /// Select the first matching trigger for `agent_id` on `message`
    ///
    /// Logic failures are returned alongside so the caller can publish
    /// `LOGIC_ERROR` records; a failed predicate counts as false and
    /// evaluation continues with the next trigger.
    pub fn select(
        &self,
        agent_id: &str,
        triggers: &[TriggerDef],
        message: &Message,
        world: &LogicWorld,
    ) -> (Option<FiredTrigger>, Vec<String>) {
        let mut logic_errors = Vec::new();

        if !message.addressed_to(agent_id) {
            return (None, logic_errors);
        }

        for (index, trigger) in triggers.iter().enumerate() {
            if trigger.topic != message.topic {
                continue;
            }
            if trigger.excludes_republished() && message.is_republished() {
                continue;
            }
            if self.already_fired(agent_id, index, message.id) {
                continue;
            }

            if let Some(script) = trigger.logic.as_ref().and_then(|l| l.script.as_deref()) {
                match logic::evaluate(script, message, world) {
                    LogicOutcome::Value(true) => {}
                    LogicOutcome::Value(false) => continue,
                    LogicOutcome::Budget => {
                        warn!(
                            agent = agent_id,
                            trigger = index,
                            "trigger logic exceeded its wall-time budget, treated as false"
                        );
                        continue;
                    }
                    LogicOutcome::Error(detail) => {
                        logic_errors.push(format!(
                            "agent {agent_id} trigger {index}: {detail}"
                        ));
                        continue;
                    }
                }
            }

            self.mark_fired(agent_id, index, message.id);
            return (
                Some(FiredTrigger {
                    index,
                    action: trigger.action,
                    config: trigger.config.clone(),
                    message: message.clone(),
                }),
                logic_errors,
            );
        }

        (None, logic_errors)
    }

    fn already_fired(&self, agent_id: &str, index: usize, message_id: MessageId) -> bool {
        self.fired
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .contains(&(agent_id.to_string(), index, message_id))
    }

    fn mark_fired(&self, agent_id: &str, index: usize, message_id: MessageId) {
        self.fired
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert((agent_id.to_string(), index, message_id));
    }
}

impl Default for TriggerEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ClusterId, MessageContent, BROADCAST};
    use serde_json::json;
    use std::sync::Arc;

    fn message(topic: &str, receiver: &str) -> Message {
        Message {
            id: MessageId::new(),
            seq: 1,
            timestamp: 1_700_000_000_000,
            cluster_id: ClusterId::new(),
            topic: topic.to_string(),
            sender: "user".to_string(),
            receiver: receiver.to_string(),
            content: MessageContent::default(),
            metadata: serde_json::Map::new(),
        }
    }

    fn world() -> LogicWorld {
        LogicWorld {
            messages: Arc::new(Vec::new()),
            agents: Arc::new(vec!["worker".to_string()]),
        }
    }

    fn execute_trigger(topic: &str) -> TriggerDef {
        TriggerDef {
            topic: topic.to_string(),
            logic: None,
            action: TriggerAction::ExecuteTask,
            config: None,
        }
    }

    #[test]
    fn test_first_match_wins() {
        let engine = TriggerEngine::new();
        let triggers = vec![
            TriggerDef {
                action: TriggerAction::Noop,
                ..execute_trigger("T")
            },
            execute_trigger("T"),
        ];
        let msg = message("T", BROADCAST);

        let (fired, errors) = engine.select("worker", &triggers, &msg, &world());
        let fired = fired.unwrap();
        assert_eq!(fired.index, 0);
        assert_eq!(fired.action, TriggerAction::Noop);
        assert!(errors.is_empty());
    }

    #[test]
    fn test_fires_at_most_once_per_message() {
        let engine = TriggerEngine::new();
        let triggers = vec![execute_trigger("T")];
        let msg = message("T", BROADCAST);

        assert!(engine
            .select("worker", &triggers, &msg, &world())
            .0
            .is_some());
        assert!(engine
            .select("worker", &triggers, &msg, &world())
            .0
            .is_none());

        // A different message fires again
        let other = message("T", BROADCAST);
        assert!(engine
            .select("worker", &triggers, &other, &world())
            .0
            .is_some());
    }

    #[test]
    fn test_republished_excluded_by_default() {
        let engine = TriggerEngine::new();
        let triggers = vec![execute_trigger("T")];
        let mut msg = message("T", BROADCAST);
        msg.metadata
            .insert(crate::types::META_REPUBLISHED.to_string(), json!(true));

        assert!(engine
            .select("worker", &triggers, &msg, &world())
            .0
            .is_none());

        // Opting in sees the republished record
        let opted_in = vec![TriggerDef {
            logic: Some(TriggerLogic {
                script: None,
                filter: TriggerFilter {
                    exclude_republished: false,
                },
            }),
            ..execute_trigger("T")
        }];
        assert!(engine
            .select("worker", &opted_in, &msg, &world())
            .0
            .is_some());
    }

    #[test]
    fn test_addressing_respected() {
        let engine = TriggerEngine::new();
        let triggers = vec![execute_trigger("T")];
        let msg = message("T", "validator");

        assert!(engine
            .select("worker", &triggers, &msg, &world())
            .0
            .is_none());
        assert!(engine
            .select("validator", &triggers, &msg, &world())
            .0
            .is_some());
    }

    #[test]
    fn test_logic_error_counts_as_false_and_surfaces() {
        let engine = TriggerEngine::new();
        let triggers = vec![TriggerDef {
            logic: Some(TriggerLogic {
                script: Some("this is not rhai ][".to_string()),
                filter: TriggerFilter::default(),
            }),
            ..execute_trigger("T")
        }];
        let msg = message("T", BROADCAST);

        let (fired, errors) = engine.select("worker", &triggers, &msg, &world());
        assert!(fired.is_none());
        assert_eq!(errors.len(), 1);
    }

    #[test]
    fn test_trigger_def_deserializes_camel_case() {
        let def: TriggerDef = serde_json::from_str(
            r#"{
                "topic": "VALIDATION_RESULT",
                "logic": {
                    "script": "message.content.data.approved == false",
                    "filter": { "excludeRepublished": true }
                },
                "action": "execute_task"
            }"#,
        )
        .unwrap();
        assert_eq!(def.action, TriggerAction::ExecuteTask);
        assert!(def.excludes_republished());
    }
}
