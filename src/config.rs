//! Registry configuration.
//!
//! Configuration is plain serde data so hosts can embed it in their own
//! TOML files. Every key is optional.
//!
//! ```toml
//! fault_policy = "isolated"
//! unload_timeout_ms = 5000
//! preload = ["metrics"]
//!
//! [plugins.metrics]
//! enabled = true
//!
//! [plugins.auth.settings]
//! issuer = "https://auth.example.com"
//! ```

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// How load failures reach waiters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum FaultPolicy {
    /// A resolution or factory failure terminates the shared loaded-events
    /// channel for every current and future observer.
    #[default]
    Broadcast,
    /// Each plugin id settles its own outcome; the shared channel only ever
    /// carries successful loads.
    Isolated,
}

/// Per-plugin configuration entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct PluginConfig {
    /// Whether loads for this plugin are accepted
    pub enabled: bool,
    /// Plugin-specific settings, exposed through `PluginScope::settings`
    pub settings: HashMap<String, serde_json::Value>,
}

impl Default for PluginConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            settings: HashMap::new(),
        }
    }
}

/// Top-level registry configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct RegistryConfig {
    /// Failure propagation policy for load events
    pub fault_policy: FaultPolicy,
    /// Grace period for a cancelled plugin before its task is aborted.
    /// `None` waits for cleanup indefinitely.
    pub unload_timeout_ms: Option<u64>,
    /// Plugin ids enqueued for loading when the registry is built
    pub preload: Vec<String>,
    /// Per-plugin entries keyed by plugin id
    pub plugins: HashMap<String, PluginConfig>,
}

/// Errors raised while reading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read registry config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid registry config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("failed to serialize config schema: {0}")]
    Schema(#[from] serde_json::Error),
}

impl RegistryConfig {
    /// Parse configuration from a TOML document.
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(raw)?)
    }

    /// Read configuration from a TOML file. A leading `~` is expanded.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw_path = path.as_ref().to_string_lossy();
        let path = PathBuf::from(shellexpand::tilde(&raw_path).as_ref());
        let raw = std::fs::read_to_string(&path).map_err(|source| ConfigError::Io {
            path: path.clone(),
            source,
        })?;
        let config = Self::from_toml_str(&raw)?;
        tracing::debug!(
            path = %path.display(),
            plugins = config.plugins.len(),
            "Loaded plugin registry config"
        );
        Ok(config)
    }

    /// JSON schema of the configuration format.
    pub fn json_schema() -> Result<serde_json::Value, ConfigError> {
        Ok(serde_json::to_value(schemars::schema_for!(RegistryConfig))?)
    }

    /// Whether loads for `id` are accepted. Unlisted plugins are enabled.
    pub fn is_enabled(&self, id: &str) -> bool {
        self.plugins.get(id).map_or(true, |plugin| plugin.enabled)
    }

    /// Settings configured for `id`, empty when unlisted.
    pub fn settings_for(&self, id: &str) -> HashMap<String, serde_json::Value> {
        self.plugins
            .get(id)
            .map(|plugin| plugin.settings.clone())
            .unwrap_or_default()
    }

    pub fn unload_timeout(&self) -> Option<Duration> {
        self.unload_timeout_ms.map(Duration::from_millis)
    }
}
