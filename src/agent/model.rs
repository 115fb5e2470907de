//! Model selection
//!
//! An agent either pins a static model/level or declares ordered rules
//! keyed by iteration patterns. Patterns: `"N"` exact, `"N-M"` inclusive
//! range, `"N+"` open-ended, `"all"` always. The first matching rule wins;
//! a gap (no matching rule) is a hard `NO_MODEL_RULE` error, and any
//! selection outside the settings ceiling/floor is a
//! `MODEL_CEILING_VIOLATION`.

use crate::error::{HarmoniaError, ModelPolicyCode, Result};
use crate::settings::{EngineSettings, ModelLevel};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Iteration pattern used by model rules and iteration-keyed prompts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IterationPattern {
    /// `"N"`: exactly iteration N
    Exact(u32),
    /// `"N-M"`: iterations N through M inclusive
    Range(u32, u32),
    /// `"N+"`: iteration N and later
    From(u32),
    /// `"all"`: every iteration
    All,
}

impl IterationPattern {
    /// Whether the pattern covers the given iteration
    pub fn matches(&self, iteration: u32) -> bool {
        match self {
            IterationPattern::Exact(n) => iteration == *n,
            IterationPattern::Range(lo, hi) => iteration >= *lo && iteration <= *hi,
            IterationPattern::From(n) => iteration >= *n,
            IterationPattern::All => true,
        }
    }

    /// Parse from the wire form
    pub fn parse(s: &str) -> Result<Self> {
        let s = s.trim();
        if s == "all" {
            return Ok(IterationPattern::All);
        }
        if let Some(base) = s.strip_suffix('+') {
            let n = base.parse::<u32>().map_err(|_| bad_pattern(s))?;
            return Ok(IterationPattern::From(n));
        }
        if let Some((lo, hi)) = s.split_once('-') {
            let lo = lo.parse::<u32>().map_err(|_| bad_pattern(s))?;
            let hi = hi.parse::<u32>().map_err(|_| bad_pattern(s))?;
            if lo > hi {
                return Err(bad_pattern(s));
            }
            return Ok(IterationPattern::Range(lo, hi));
        }
        let n = s.parse::<u32>().map_err(|_| bad_pattern(s))?;
        Ok(IterationPattern::Exact(n))
    }
}

fn bad_pattern(s: &str) -> HarmoniaError {
    HarmoniaError::Config(format!(
        "invalid iteration pattern '{s}' (expected N, N-M, N+, or all)"
    ))
}

impl std::fmt::Display for IterationPattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IterationPattern::Exact(n) => write!(f, "{n}"),
            IterationPattern::Range(lo, hi) => write!(f, "{lo}-{hi}"),
            IterationPattern::From(n) => write!(f, "{n}+"),
            IterationPattern::All => f.write_str("all"),
        }
    }
}

impl Serialize for IterationPattern {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for IterationPattern {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        IterationPattern::parse(&s).map_err(serde::de::Error::custom)
    }
}

/// One model rule: pattern plus the selection it yields
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelRule {
    pub iterations: IterationPattern,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_level: Option<ModelLevel>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_effort: Option<String>,
}

/// Agent model configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ModelConfig {
    /// One selection for every iteration
    #[serde(rename_all = "camelCase")]
    Static {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        model: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        model_level: Option<ModelLevel>,
    },
    /// Iteration-keyed rules, first match wins
    Rules { rules: Vec<ModelRule> },
}

impl Default for ModelConfig {
    fn default() -> Self {
        ModelConfig::Static {
            model: None,
            model_level: None,
        }
    }
}

/// Resolved selection handed to the runner
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModelChoice {
    pub model: Option<String>,
    pub model_level: Option<ModelLevel>,
    pub reasoning_effort: Option<String>,
}

/// Effective level of a choice: the explicit level, or the level implied
/// by a legacy model name
fn effective_level(choice: &ModelChoice) -> Option<ModelLevel> {
    choice.model_level.or_else(|| {
        choice
            .model
            .as_deref()
            .and_then(|name| ModelLevel::parse(name).ok())
    })
}

/// Select the model for an iteration and enforce the settings policy
pub fn select_model(
    config: &ModelConfig,
    iteration: u32,
    settings: &EngineSettings,
) -> Result<ModelChoice> {
    let mut choice = match config {
        ModelConfig::Static { model, model_level } => ModelChoice {
            model: model.clone(),
            model_level: *model_level,
            reasoning_effort: None,
        },
        ModelConfig::Rules { rules } => {
            let rule = rules
                .iter()
                .find(|r| r.iterations.matches(iteration))
                .ok_or_else(|| HarmoniaError::ModelPolicy {
                    code: ModelPolicyCode::NoModelRule,
                    detail: format!("no rule matches iteration {iteration}"),
                })?;
            ModelChoice {
                model: rule.model.clone(),
                model_level: rule.model_level,
                reasoning_effort: rule.reasoning_effort.clone(),
            }
        }
    };

    if choice.model.is_none() && choice.model_level.is_none() {
        choice.model_level = Some(settings.default_level_for(&settings.default_provider));
    }

    if let Some(level) = effective_level(&choice) {
        if !settings.level_in_bounds(level) {
            return Err(HarmoniaError::ModelPolicy {
                code: ModelPolicyCode::ModelCeilingViolation,
                detail: format!(
                    "level {level} outside bounds (max {}, min {})",
                    settings.max_model,
                    settings
                        .min_model
                        .map(|m| m.to_string())
                        .unwrap_or_else(|| "none".to_string())
                ),
            });
        }
    }

    Ok(choice)
}

/// Validate every rule of a config against the settings policy
///
/// Run at cluster start so ceiling violations surface before any task
/// spawns. Returns one error per offending rule.
pub fn validate_policy(config: &ModelConfig, settings: &EngineSettings) -> Vec<HarmoniaError> {
    let mut violations = Vec::new();
    let check = |model: &Option<String>, model_level: &Option<ModelLevel>, what: String| {
        let choice = ModelChoice {
            model: model.clone(),
            model_level: *model_level,
            reasoning_effort: None,
        };
        effective_level(&choice).and_then(|level| {
            if settings.level_in_bounds(level) {
                None
            } else {
                Some(HarmoniaError::ModelPolicy {
                    code: ModelPolicyCode::ModelCeilingViolation,
                    detail: format!("{what}: level {level} outside configured bounds"),
                })
            }
        })
    };

    match config {
        ModelConfig::Static { model, model_level } => {
            if let Some(v) = check(model, model_level, "static model config".to_string()) {
                violations.push(v);
            }
        }
        ModelConfig::Rules { rules } => {
            for (i, rule) in rules.iter().enumerate() {
                if let Some(v) = check(
                    &rule.model,
                    &rule.model_level,
                    format!("rule {i} ({})", rule.iterations),
                ) {
                    violations.push(v);
                }
            }
        }
    }

    violations
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pattern_parsing_and_matching() {
        assert!(IterationPattern::parse("1").unwrap().matches(1));
        assert!(!IterationPattern::parse("1").unwrap().matches(2));

        let range = IterationPattern::parse("2-4").unwrap();
        assert!(!range.matches(1));
        assert!(range.matches(2));
        assert!(range.matches(4));
        assert!(!range.matches(5));

        let open = IterationPattern::parse("5+").unwrap();
        assert!(!open.matches(4));
        assert!(open.matches(5));
        assert!(open.matches(500));

        assert!(IterationPattern::parse("all").unwrap().matches(73));

        assert!(IterationPattern::parse("x").is_err());
        assert!(IterationPattern::parse("4-2").is_err());
    }

    #[test]
    fn test_pattern_serde_roundtrip() {
        for raw in ["\"1\"", "\"2-4\"", "\"5+\"", "\"all\""] {
            let pattern: IterationPattern = serde_json::from_str(raw).unwrap();
            assert_eq!(serde_json::to_string(&pattern).unwrap(), raw);
        }
    }

    fn rules_config() -> ModelConfig {
        serde_json::from_value(serde_json::json!({
            "type": "rules",
            "rules": [
                { "iterations": "1", "modelLevel": "level1" },
                { "iterations": "2-3", "modelLevel": "level2", "reasoningEffort": "high" },
                { "iterations": "4+", "modelLevel": "level3" }
            ]
        }))
        .unwrap()
    }

    #[test]
    fn test_first_declared_rule_wins() {
        let config: ModelConfig = serde_json::from_value(serde_json::json!({
            "type": "rules",
            "rules": [
                { "iterations": "all", "modelLevel": "level1" },
                { "iterations": "2+", "modelLevel": "level3" }
            ]
        }))
        .unwrap();
        let settings = EngineSettings::default();

        let choice = select_model(&config, 2, &settings).unwrap();
        assert_eq!(choice.model_level, Some(ModelLevel::Level1));
    }

    #[test]
    fn test_rule_selection_by_iteration() {
        let settings = EngineSettings::default();
        let config = rules_config();

        assert_eq!(
            select_model(&config, 1, &settings).unwrap().model_level,
            Some(ModelLevel::Level1)
        );
        let third = select_model(&config, 3, &settings).unwrap();
        assert_eq!(third.model_level, Some(ModelLevel::Level2));
        assert_eq!(third.reasoning_effort.as_deref(), Some("high"));
        assert_eq!(
            select_model(&config, 10, &settings).unwrap().model_level,
            Some(ModelLevel::Level3)
        );
    }

    #[test]
    fn test_no_model_rule_is_hard_error() {
        let config: ModelConfig = serde_json::from_value(serde_json::json!({
            "type": "rules",
            "rules": [ { "iterations": "1", "modelLevel": "level1" } ]
        }))
        .unwrap();
        let settings = EngineSettings::default();

        let err = select_model(&config, 2, &settings).unwrap_err();
        assert!(matches!(
            err,
            HarmoniaError::ModelPolicy {
                code: ModelPolicyCode::NoModelRule,
                ..
            }
        ));
    }

    #[test]
    fn test_ceiling_enforced_at_selection() {
        let settings = EngineSettings {
            max_model: ModelLevel::Level2,
            ..Default::default()
        };
        let config = rules_config();

        assert!(select_model(&config, 1, &settings).is_ok());
        let err = select_model(&config, 4, &settings).unwrap_err();
        assert!(matches!(
            err,
            HarmoniaError::ModelPolicy {
                code: ModelPolicyCode::ModelCeilingViolation,
                ..
            }
        ));
    }

    #[test]
    fn test_legacy_model_name_counts_toward_ceiling() {
        let settings = EngineSettings {
            max_model: ModelLevel::Level2,
            ..Default::default()
        };
        let config = ModelConfig::Static {
            model: Some("opus".to_string()),
            model_level: None,
        };
        assert!(select_model(&config, 1, &settings).is_err());
    }

    #[test]
    fn test_default_fills_from_settings() {
        let settings = EngineSettings::default();
        let choice = select_model(&ModelConfig::default(), 1, &settings).unwrap();
        assert_eq!(choice.model_level, Some(ModelLevel::Level2));
    }

    #[test]
    fn test_validate_policy_reports_offending_rules() {
        let settings = EngineSettings {
            max_model: ModelLevel::Level2,
            ..Default::default()
        };
        let violations = validate_policy(&rules_config(), &settings);
        assert_eq!(violations.len(), 1, "only the level3 rule violates");
    }
}
