//! Sandboxed trigger predicates
//!
//! Predicates run in an embedded rhai engine with a frozen, read-only API
//! surface over a pinned snapshot of the cluster's ledger:
//!
//! - `message`: the triggering record as a map
//! - `ledger.query(topic)` / `ledger.find_last(topic)` / `ledger.count(topic)`
//! - `cluster.get_agents()`
//! - `helpers.all_responded(agents, topic, since_ts)`
//!
//! No I/O, no wall clock beyond `message.timestamp`. Evaluation carries a
//! hard 1000 ms wall-time budget enforced through the engine's progress
//! hook; exceeding it yields [`LogicOutcome::Budget`].

use crate::types::Message;
use rhai::{Dynamic, Engine, Scope};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Hard wall-time budget for one predicate evaluation
pub const LOGIC_BUDGET_MS: u64 = 1_000;

/// Pinned evaluation environment: a ledger snapshot plus the agent roster
///
/// The snapshot is taken once per evaluation round, so every trigger for a
/// given message sees the same frozen view regardless of concurrent
/// appends.
#[derive(Clone)]
pub struct LogicWorld {
    pub messages: Arc<Vec<Message>>,
    pub agents: Arc<Vec<String>>,
}

/// Result of one predicate evaluation
#[derive(Debug, Clone, PartialEq)]
pub enum LogicOutcome {
    /// The predicate produced a boolean
    Value(bool),
    /// The wall-time budget was exceeded; treat as false, warn once
    Budget,
    /// Syntax or runtime failure; treat as false, publish `LOGIC_ERROR`
    Error(String),
}

/// Read-only ledger facade exposed to scripts as `ledger`
#[derive(Clone)]
struct LedgerView {
    messages: Arc<Vec<Message>>,
}

impl LedgerView {
    fn query(&mut self, topic: &str) -> rhai::Array {
        self.messages
            .iter()
            .filter(|m| m.topic == topic)
            .filter_map(|m| rhai::serde::to_dynamic(m).ok())
            .collect()
    }

    fn find_last(&mut self, topic: &str) -> Dynamic {
        self.messages
            .iter()
            .rev()
            .find(|m| m.topic == topic)
            .and_then(|m| rhai::serde::to_dynamic(m).ok())
            .unwrap_or(Dynamic::UNIT)
    }

    fn count(&mut self, topic: &str) -> i64 {
        self.messages.iter().filter(|m| m.topic == topic).count() as i64
    }
}

/// Cluster roster facade exposed to scripts as `cluster`
#[derive(Clone)]
struct ClusterView {
    agents: Arc<Vec<String>>,
}

impl ClusterView {
    fn get_agents(&mut self) -> rhai::Array {
        self.agents
            .iter()
            .map(|a| Dynamic::from(a.clone()))
            .collect()
    }
}

/// Convenience predicates exposed to scripts as `helpers`
#[derive(Clone)]
struct HelpersView {
    messages: Arc<Vec<Message>>,
}

impl HelpersView {
    /// True when every listed agent has published `topic` at or after
    /// `since` (UNIX millis)
    fn all_responded(&mut self, agents: rhai::Array, topic: &str, since: i64) -> bool {
        agents.into_iter().all(|agent| {
            let Ok(agent) = agent.into_string() else {
                return false;
            };
            self.messages
                .iter()
                .any(|m| m.topic == topic && m.sender == agent && m.timestamp >= since)
        })
    }
}

/// Evaluate one predicate against a message and a pinned world
pub fn evaluate(script: &str, message: &Message, world: &LogicWorld) -> LogicOutcome {
    let mut engine = Engine::new();

    engine
        .register_type_with_name::<LedgerView>("LedgerView")
        .register_fn("query", LedgerView::query)
        .register_fn("find_last", LedgerView::find_last)
        .register_fn("count", LedgerView::count)
        .register_type_with_name::<ClusterView>("ClusterView")
        .register_fn("get_agents", ClusterView::get_agents)
        .register_type_with_name::<HelpersView>("HelpersView")
        .register_fn("all_responded", HelpersView::all_responded);

    // Wall-time budget; the progress hook runs once per operation
    let deadline = Instant::now() + Duration::from_millis(LOGIC_BUDGET_MS);
    engine.on_progress(move |_ops| {
        if Instant::now() >= deadline {
            Some(Dynamic::from("budget"))
        } else {
            None
        }
    });

    let message_dynamic = match rhai::serde::to_dynamic(message) {
        Ok(d) => d,
        Err(err) => return LogicOutcome::Error(format!("message conversion failed: {err}")),
    };

    let mut scope = Scope::new();
    scope.push_constant_dynamic("message", message_dynamic);
    scope.push_constant(
        "ledger",
        LedgerView {
            messages: world.messages.clone(),
        },
    );
    scope.push_constant(
        "cluster",
        ClusterView {
            agents: world.agents.clone(),
        },
    );
    scope.push_constant(
        "helpers",
        HelpersView {
            messages: world.messages.clone(),
        },
    );

    match engine.eval_with_scope::<Dynamic>(&mut scope, script) {
        Ok(value) => {
            if value.is_unit() {
                return LogicOutcome::Value(false);
            }
            match value.as_bool() {
                Ok(b) => LogicOutcome::Value(b),
                Err(actual) => LogicOutcome::Error(format!(
                    "predicate returned {actual}, expected bool"
                )),
            }
        }
        Err(err) => match *err {
            rhai::EvalAltResult::ErrorTerminated(_, _) => LogicOutcome::Budget,
            other => LogicOutcome::Error(other.to_string()),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ClusterId, MessageContent, MessageId, BROADCAST};
    use serde_json::json;

    fn message_with_data(topic: &str, sender: &str, data: serde_json::Value) -> Message {
        Message {
            id: MessageId::new(),
            seq: 1,
            timestamp: 1_700_000_000_000,
            cluster_id: ClusterId::new(),
            topic: topic.to_string(),
            sender: sender.to_string(),
            receiver: BROADCAST.to_string(),
            content: MessageContent::data(data),
            metadata: serde_json::Map::new(),
        }
    }

    fn world_with(messages: Vec<Message>, agents: Vec<&str>) -> LogicWorld {
        LogicWorld {
            messages: Arc::new(messages),
            agents: Arc::new(agents.into_iter().map(String::from).collect()),
        }
    }

    #[test]
    fn test_message_field_access() {
        let msg = message_with_data("VALIDATION_RESULT", "validator", json!({"approved": false}));
        let world = world_with(vec![], vec![]);

        let outcome = evaluate(
            "message.content.data.approved == false",
            &msg,
            &world,
        );
        assert_eq!(outcome, LogicOutcome::Value(true));

        let outcome = evaluate("message.sender == \"worker\"", &msg, &world);
        assert_eq!(outcome, LogicOutcome::Value(false));
    }

    #[test]
    fn test_ledger_api() {
        let history = vec![
            message_with_data("VALIDATION_RESULT", "v1", json!({"approved": true})),
            message_with_data("VALIDATION_RESULT", "v2", json!({"approved": false})),
            message_with_data("TASK_COMPLETED", "worker", json!({})),
        ];
        let trigger = history[2].clone();
        let world = world_with(history, vec!["v1", "v2"]);

        assert_eq!(
            evaluate("ledger.count(\"VALIDATION_RESULT\") == 2", &trigger, &world),
            LogicOutcome::Value(true)
        );
        assert_eq!(
            evaluate(
                "ledger.find_last(\"VALIDATION_RESULT\").content.data.approved == false",
                &trigger,
                &world
            ),
            LogicOutcome::Value(true)
        );
        assert_eq!(
            evaluate(
                "ledger.query(\"VALIDATION_RESULT\").len() == 2",
                &trigger,
                &world
            ),
            LogicOutcome::Value(true)
        );
        assert_eq!(
            evaluate("ledger.find_last(\"MISSING\") == ()", &trigger, &world),
            LogicOutcome::Value(true)
        );
    }

    #[test]
    fn test_all_responded_helper() {
        let history = vec![
            message_with_data("VALIDATION_RESULT", "v1", json!({})),
            message_with_data("VALIDATION_RESULT", "v2", json!({})),
        ];
        let trigger = history[0].clone();
        let world = world_with(history, vec!["v1", "v2"]);

        assert_eq!(
            evaluate(
                "helpers.all_responded(cluster.get_agents(), \"VALIDATION_RESULT\", 0)",
                &trigger,
                &world
            ),
            LogicOutcome::Value(true)
        );
        assert_eq!(
            evaluate(
                "helpers.all_responded([\"v1\", \"v3\"], \"VALIDATION_RESULT\", 0)",
                &trigger,
                &world
            ),
            LogicOutcome::Value(false)
        );
    }

    #[test]
    fn test_syntax_error_is_error_outcome() {
        let msg = message_with_data("T", "a", json!({}));
        let world = world_with(vec![], vec![]);
        assert!(matches!(
            evaluate("][ nonsense", &msg, &world),
            LogicOutcome::Error(_)
        ));
    }

    #[test]
    fn test_non_bool_result_is_error() {
        let msg = message_with_data("T", "a", json!({}));
        let world = world_with(vec![], vec![]);
        assert!(matches!(
            evaluate("42", &msg, &world),
            LogicOutcome::Error(_)
        ));
    }

    #[test]
    fn test_budget_exceeded_returns_budget() {
        let msg = message_with_data("T", "a", json!({}));
        let world = world_with(vec![], vec![]);
        let outcome = evaluate(
            "let x = 0; while true { x += 1; }; x > 0",
            &msg,
            &world,
        );
        assert_eq!(outcome, LogicOutcome::Budget);
    }
}
