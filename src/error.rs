//! Error types for the plugin registry.
//!
//! Errors are `Clone` so a single failure can be delivered to every waiter
//! observing the same broadcast channel.

use thiserror::Error;

/// Failure surfaced by the registry's load, unload and wait operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PluginError {
    /// The factory resolver failed to produce a factory for the plugin.
    #[error("failed to resolve factory for plugin '{id}': {message}")]
    Resolution { id: String, message: String },

    /// The plugin factory failed, panicked, or finished without exporting.
    #[error("plugin '{id}' factory failed: {message}")]
    Factory { id: String, message: String },

    /// An unload targeted a plugin with no live entry.
    #[error("plugin '{id}' is not loaded")]
    MissingPlugin { id: String },

    /// The plugin is disabled in the registry configuration.
    #[error("plugin '{id}' is disabled by configuration")]
    Disabled { id: String },

    /// Exports could not be downcast to the requested type.
    #[error("plugin '{id}' exports are not of type {expected}")]
    ExportType { id: String, expected: &'static str },

    /// The registry was destroyed or the event channel completed.
    #[error("plugin registry is closed")]
    Closed,
}

impl PluginError {
    /// Plugin id the error refers to, if any.
    pub fn plugin_id(&self) -> Option<&str> {
        match self {
            Self::Resolution { id, .. }
            | Self::Factory { id, .. }
            | Self::MissingPlugin { id }
            | Self::Disabled { id }
            | Self::ExportType { id, .. } => Some(id),
            Self::Closed => None,
        }
    }

    pub(crate) fn resolution(id: &str, error: &anyhow::Error) -> Self {
        Self::Resolution {
            id: id.to_string(),
            message: format!("{error:#}"),
        }
    }

    pub(crate) fn factory(id: &str, message: impl Into<String>) -> Self {
        Self::Factory {
            id: id.to_string(),
            message: message.into(),
        }
    }
}

/// Result alias used across the registry API.
pub type Result<T> = std::result::Result<T, PluginError>;
