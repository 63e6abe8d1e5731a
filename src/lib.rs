//! Runtime plugin registry.
//!
//! ```rust,no_run
//! use plugin_registry::{LoadDescriptor, PluginRegistry, PluginScope};
//!
//! # async fn demo() -> plugin_registry::Result<()> {
//! let registry = PluginRegistry::new(());
//! let greeter = LoadDescriptor::new("greeter", |scope: PluginScope<()>| async move {
//!     scope.export(String::from("hello"));
//!     scope.cancelled().await;
//!     anyhow::Ok(())
//! });
//!
//! let greeting = registry.load_and_wait_for(greeter).await?;
//! assert_eq!(greeting.downcast_ref::<String>().map(String::as_str), Some("hello"));
//! registry.shutdown().await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod logging;
pub mod plugins;

pub use config::{ConfigError, FaultPolicy, PluginConfig, RegistryConfig};
pub use error::{PluginError, Result};
pub use plugins::{
    Exports, FactoryResolver, FactoryTable, LoadDescriptor, LoadRequest, LoadedPlugin,
    PluginDescriptor, PluginEvents, PluginFactory, PluginRegistry, PluginScope, PluginState,
    RegistryBuilder, StandardResolver,
};
