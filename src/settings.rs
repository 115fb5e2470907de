//! Engine settings consumed at cluster boundaries
//!
//! Settings are read-through: the store re-reads the settings file at each
//! well-defined consumption point (cluster start, task spawn) and never
//! caches across task executions. A settings change mid-run therefore
//! affects the next task spawn, not in-flight tasks.

use crate::error::{HarmoniaError, Result};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use tracing::debug;

/// Model capability level
///
/// Providers map levels to concrete model names; the engine only compares
/// levels against the configured ceiling/floor. Legacy model names
/// (`haiku`/`sonnet`/`opus`) map to `level1`/`level2`/`level3` on load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelLevel {
    Level1,
    Level2,
    Level3,
}

impl ModelLevel {
    /// Wire representation
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelLevel::Level1 => "level1",
            ModelLevel::Level2 => "level2",
            ModelLevel::Level3 => "level3",
        }
    }

    /// Parse a level name, accepting legacy model names
    pub fn parse(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "level1" | "haiku" => Ok(ModelLevel::Level1),
            "level2" | "sonnet" => Ok(ModelLevel::Level2),
            "level3" | "opus" => Ok(ModelLevel::Level3),
            other => Err(HarmoniaError::Config(format!(
                "unknown model level '{other}' (expected level1|level2|level3)"
            ))),
        }
    }
}

impl<'de> Deserialize<'de> for ModelLevel {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        ModelLevel::parse(&s).map_err(serde::de::Error::custom)
    }
}

impl std::fmt::Display for ModelLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-provider level policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProviderSettings {
    /// Lowest level this provider may run
    pub min_level: ModelLevel,

    /// Highest level this provider may run
    pub max_level: ModelLevel,

    /// Level used when an agent specifies neither model nor level
    pub default_level: ModelLevel,

    /// Concrete model name per level, overriding the provider default
    pub level_overrides: HashMap<String, String>,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            min_level: ModelLevel::Level1,
            max_level: ModelLevel::Level3,
            default_level: ModelLevel::Level2,
            level_overrides: HashMap::new(),
        }
    }
}

/// Engine-wide settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineSettings {
    /// Cluster-wide model ceiling
    pub max_model: ModelLevel,

    /// Cluster-wide model floor, if any
    pub min_model: Option<ModelLevel>,

    /// Provider used when an agent does not name one
    pub default_provider: String,

    /// Per-provider policies keyed by provider name
    pub provider_settings: HashMap<String, ProviderSettings>,

    /// Default for agents that do not set `strictSchema`
    pub strict_schema: bool,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            max_model: ModelLevel::Level3,
            min_model: None,
            default_provider: "claude".to_string(),
            provider_settings: HashMap::new(),
            strict_schema: true,
        }
    }
}

impl EngineSettings {
    /// Whether a level lies within the configured ceiling/floor
    pub fn level_in_bounds(&self, level: ModelLevel) -> bool {
        if level > self.max_model {
            return false;
        }
        if let Some(floor) = self.min_model {
            if level < floor {
                return false;
            }
        }
        true
    }

    /// Default level for the given provider (falling back to the
    /// engine-wide default provider policy)
    pub fn default_level_for(&self, provider: &str) -> ModelLevel {
        self.provider_settings
            .get(provider)
            .map(|p| p.default_level)
            .unwrap_or(ModelLevel::Level2)
    }
}

/// Read-through settings store
///
/// `load` re-reads the file every call; the engine invokes it only at
/// cluster start and task spawn.
#[derive(Debug, Clone)]
pub struct SettingsStore {
    path: Option<PathBuf>,
}

impl SettingsStore {
    /// Store backed by a settings file
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
        }
    }

    /// Store that always yields defaults (tests, embedded use)
    pub fn defaults() -> Self {
        Self { path: None }
    }

    /// Load current settings
    ///
    /// A missing file yields defaults; a malformed file is an error.
    pub fn load(&self) -> Result<EngineSettings> {
        let Some(path) = &self.path else {
            return Ok(EngineSettings::default());
        };
        if !path.exists() {
            debug!(path = %path.display(), "settings file absent, using defaults");
            return Ok(EngineSettings::default());
        }

        let raw = std::fs::read_to_string(path)?;
        let settings: EngineSettings = serde_json::from_str(&raw).map_err(|e| {
            HarmoniaError::Settings(config::ConfigError::Message(format!(
                "settings file {} invalid: {e}",
                path.display()
            )))
        })?;

        Ok(settings)
    }
}
