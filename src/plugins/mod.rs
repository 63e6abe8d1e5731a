//! Plugin registry.
//!
//! Plugins are units of code that publish exports to the rest of the
//! application. The registry instantiates each submitted plugin exactly once,
//! replays past loads to late observers, and tears plugins down on explicit
//! unload.
//!
//! # Lifecycle
//!
//! - **Load**: `PluginRegistry::load` enqueues a request; the load pipeline
//!   resolves a factory and runs it. The plugin becomes loaded when its
//!   factory calls `PluginScope::export`.
//! - **Wait**: `wait_for` / `wait_for_all` resolve with exports, including
//!   for plugins that loaded before the call.
//! - **Unload**: `PluginRegistry::unload` cancels the plugin's scope and
//!   emits an unloaded event once its activity has finished.
//!
//! # Example Configuration
//!
//! ```toml
//! fault_policy = "broadcast"
//! unload_timeout_ms = 5000
//! preload = ["metrics"]
//!
//! [plugins.metrics]
//! enabled = true
//!
//! [plugins.metrics.settings]
//! flush_interval_secs = 10
//! ```

pub mod events;
pub mod lifecycle;
pub mod loader;
pub mod registry;
pub mod traits;

pub use events::PluginEvents;
pub use lifecycle::PluginState;
pub use loader::{FactoryTable, StandardResolver};
pub use registry::{LoadedPlugin, PluginRegistry, RegistryBuilder};
pub use traits::{
    Exports, FactoryResolver, LoadDescriptor, LoadRequest, PluginDescriptor, PluginFactory,
    PluginScope,
};
