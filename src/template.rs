//! Cluster templates
//!
//! A template is `{base, params}`: a base cluster definition file whose
//! agent definitions may carry `{{paramName}}` tokens. Resolution loads
//! the base, deep-substitutes parameters with type preservation, and
//! validates the materialized config. One level only: a base cannot
//! reference another template, so templates are acyclic by construction.

use crate::agent::ClusterConfig;
use crate::error::{HarmoniaError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::path::PathBuf;
use tracing::warn;

/// Template reference: a base definition plus its parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterTemplate {
    /// Base file name, resolved inside the template directory
    pub base: String,

    #[serde(default)]
    pub params: serde_json::Map<String, Value>,
}

/// Expands templates into concrete agent lists
pub struct TemplateResolver {
    templates_dir: PathBuf,
}

impl TemplateResolver {
    pub fn new(templates_dir: impl Into<PathBuf>) -> Self {
        Self {
            templates_dir: templates_dir.into(),
        }
    }

    /// Resolve a template into a validated cluster config
    pub async fn resolve(&self, template: &ClusterTemplate) -> Result<ClusterConfig> {
        let path = self.templates_dir.join(&template.base);
        let raw = tokio::fs::read_to_string(&path).await.map_err(|e| {
            HarmoniaError::Template(format!("cannot read base '{}': {e}", path.display()))
        })?;
        let base: Value = serde_json::from_str(&raw).map_err(|e| {
            HarmoniaError::Template(format!("base '{}' is not valid JSON: {e}", template.base))
        })?;

        let resolved = substitute(&base, &template.params)?;
        let config: ClusterConfig = serde_json::from_value(resolved).map_err(|e| {
            HarmoniaError::Template(format!(
                "resolved '{}' is not a valid cluster config: {e}",
                template.base
            ))
        })?;

        config.validate()?;
        warn_unreachable_topics(&config);
        Ok(config)
    }
}

/// Deep-substitute `{{name}}` tokens by parameter values
///
/// A string that is exactly one token takes the parameter's JSON type
/// (number, array, object); embedded tokens stringify into place. Unknown
/// parameters are rejected.
pub fn substitute(value: &Value, params: &serde_json::Map<String, Value>) -> Result<Value> {
    match value {
        Value::String(s) => substitute_string(s, params),
        Value::Array(items) => Ok(Value::Array(
            items
                .iter()
                .map(|v| substitute(v, params))
                .collect::<Result<Vec<_>>>()?,
        )),
        Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (k, v) in map {
                out.insert(k.clone(), substitute(v, params)?);
            }
            Ok(Value::Object(out))
        }
        other => Ok(other.clone()),
    }
}

fn substitute_string(s: &str, params: &serde_json::Map<String, Value>) -> Result<Value> {
    let trimmed = s.trim();
    if trimmed.starts_with("{{") && trimmed.ends_with("}}") && !trimmed[2..].contains("{{") {
        let name = trimmed[2..trimmed.len() - 2].trim();
        return params
            .get(name)
            .cloned()
            .ok_or_else(|| HarmoniaError::Template(format!("unknown parameter '{name}'")));
    }

    let mut out = String::with_capacity(s.len());
    let mut rest = s;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after
            .find("}}")
            .ok_or_else(|| HarmoniaError::Template(format!("unterminated token in '{s}'")))?;
        let name = after[..end].trim();
        let param = params
            .get(name)
            .ok_or_else(|| HarmoniaError::Template(format!("unknown parameter '{name}'")))?;
        match param {
            Value::String(v) => out.push_str(v),
            other => out.push_str(&other.to_string()),
        }
        rest = &after[end + 2..];
    }
    out.push_str(rest);
    Ok(Value::String(out))
}

/// Warn about trigger topics nothing in the config (or the engine) can
/// produce; usually a typo in the template
fn warn_unreachable_topics(config: &ClusterConfig) {
    let mut producible: HashSet<&str> = [
        crate::types::topic::ISSUE_OPENED,
        crate::types::topic::CLUSTER_OPERATIONS,
        crate::types::topic::TASK_STARTED,
        crate::types::topic::TASK_COMPLETED,
        crate::types::topic::AGENT_ERROR,
        crate::types::topic::AGENT_SCHEMA_WARNING,
        crate::types::topic::AGENT_HALTED,
        crate::types::topic::AGENT_STALE,
        crate::types::topic::AGENT_TIMEOUT,
        crate::types::topic::LOGIC_ERROR,
        crate::types::topic::HOOK_ERROR,
        crate::types::topic::STOP_CLUSTER,
        crate::types::topic::CLUSTER_COMPLETE,
        crate::types::topic::SUB_CLUSTER_COMPLETE,
    ]
    .into_iter()
    .collect();

    let mut published: Vec<&str> = Vec::new();
    for agent in &config.agents {
        for hook in [
            &agent.hooks.on_start,
            &agent.hooks.on_complete,
            &agent.hooks.on_error,
        ]
        .into_iter()
        .flatten()
        {
            if let crate::hooks::HookAction::PublishMessage { spec } = hook {
                published.push(&spec.topic);
            }
        }
        for trigger in &agent.triggers {
            if let Some(topic) = trigger
                .config
                .as_ref()
                .and_then(|c| c.get("topic"))
                .and_then(Value::as_str)
            {
                published.push(topic);
            }
        }
    }
    producible.extend(published);

    for agent in &config.agents {
        for trigger in &agent.triggers {
            if !producible.contains(trigger.topic.as_str()) {
                warn!(
                    agent = %agent.id,
                    topic = %trigger.topic,
                    "trigger topic is never published by this config"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn params(value: Value) -> serde_json::Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("params must be an object"),
        }
    }

    #[test]
    fn test_whole_token_preserves_type() {
        let p = params(json!({
            "count": 3,
            "topics": ["A", "B"],
            "name": "worker"
        }));

        assert_eq!(
            substitute(&json!("{{count}}"), &p).unwrap(),
            json!(3)
        );
        assert_eq!(
            substitute(&json!("{{topics}}"), &p).unwrap(),
            json!(["A", "B"])
        );
        assert_eq!(
            substitute(&json!("agent-{{name}}-{{count}}"), &p).unwrap(),
            json!("agent-worker-3")
        );
    }

    #[test]
    fn test_unknown_parameter_rejected() {
        let p = params(json!({}));
        assert!(substitute(&json!("{{missing}}"), &p).is_err());
        assert!(substitute(&json!("x {{missing}} y"), &p).is_err());
    }

    #[test]
    fn test_deep_substitution() {
        let p = params(json!({ "role": "validator", "max": 5 }));
        let base = json!({
            "agents": [{
                "id": "{{role}}-1",
                "role": "{{role}}",
                "maxIterations": "{{max}}"
            }]
        });
        let resolved = substitute(&base, &p).unwrap();
        assert_eq!(
            resolved,
            json!({
                "agents": [{
                    "id": "validator-1",
                    "role": "validator",
                    "maxIterations": 5
                }]
            })
        );
    }

    #[test]
    fn test_resolution_is_idempotent() {
        let p = params(json!({ "name": "worker", "limit": 10 }));
        let base = json!({
            "agents": [{ "id": "{{name}}", "maxIterations": "{{limit}}" }]
        });

        let once = substitute(&base, &p).unwrap();
        let twice = substitute(&once, &p).unwrap();
        assert_eq!(once, twice);
    }

    #[tokio::test]
    async fn test_resolve_from_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("pipeline.json"),
            serde_json::to_string_pretty(&json!({
                "agents": [
                    {
                        "id": "worker",
                        "prompt": "{{workerPrompt}}",
                        "triggers": [
                            { "topic": "ISSUE_OPENED", "action": "execute_task" }
                        ]
                    }
                ]
            }))
            .unwrap(),
        )
        .unwrap();

        let resolver = TemplateResolver::new(dir.path());
        let config = resolver
            .resolve(&ClusterTemplate {
                base: "pipeline.json".to_string(),
                params: params(json!({ "workerPrompt": "You are a worker." })),
            })
            .await
            .unwrap();

        assert_eq!(config.agents.len(), 1);
        assert_eq!(
            config.agents[0].prompt.as_ref().unwrap().system_for(1),
            Some("You are a worker.")
        );
    }

    #[tokio::test]
    async fn test_resolve_rejects_duplicate_ids() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("dup.json"),
            r#"{ "agents": [ { "id": "{{name}}" }, { "id": "{{name}}" } ] }"#,
        )
        .unwrap();

        let resolver = TemplateResolver::new(dir.path());
        let err = resolver
            .resolve(&ClusterTemplate {
                base: "dup.json".to_string(),
                params: params(json!({ "name": "same" })),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, HarmoniaError::Config(_)));
    }
}
