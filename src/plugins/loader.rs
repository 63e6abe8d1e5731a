//! Factory resolvers.
//!
//! A resolver turns a [`LoadRequest`] into a [`LoadDescriptor`], i.e. finds
//! the code able to instantiate a plugin. Two resolvers ship with the crate:
//!
//! - [`StandardResolver`]: the request must already carry its factory.
//! - [`FactoryTable`]: factories compiled into the host and registered by id
//!   ahead of time.

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

use super::traits::{FactoryResolver, LoadDescriptor, LoadRequest, PluginFactory};

/// Identity resolver: passes through requests that carry a factory.
#[derive(Debug, Default, Clone, Copy)]
pub struct StandardResolver;

#[async_trait]
impl<C: Send + Sync + 'static> FactoryResolver<C> for StandardResolver {
    async fn resolve(&self, request: LoadRequest<C>) -> Result<LoadDescriptor<C>> {
        let LoadRequest { descriptor, factory } = request;
        match factory {
            Some(factory) => Ok(LoadDescriptor {
                descriptor,
                factory,
            }),
            None => anyhow::bail!(
                "plugin '{}' was submitted without a factory and no resolver is configured",
                descriptor.id
            ),
        }
    }
}

/// Resolver backed by factories registered by plugin id.
///
/// A request that already carries a factory keeps it; the table is only
/// consulted for bare ids.
pub struct FactoryTable<C> {
    factories: RwLock<HashMap<String, Arc<dyn PluginFactory<C>>>>,
}

impl<C: Send + Sync + 'static> FactoryTable<C> {
    pub fn new() -> Self {
        Self {
            factories: RwLock::new(HashMap::new()),
        }
    }

    /// Register a factory, builder style.
    pub fn with(self, id: impl Into<String>, factory: impl PluginFactory<C>) -> Self {
        self.register(id, factory);
        self
    }

    /// Register a factory, replacing any previous one for the same id.
    pub fn register(&self, id: impl Into<String>, factory: impl PluginFactory<C>) {
        let id = id.into();
        if self
            .factories
            .write()
            .insert(id.clone(), Arc::new(factory))
            .is_some()
        {
            tracing::debug!(plugin_id = %id, "Replaced registered plugin factory");
        } else {
            tracing::debug!(plugin_id = %id, "Registered plugin factory");
        }
    }

    /// Remove a registered factory. Running instances are unaffected.
    pub fn unregister(&self, id: &str) -> bool {
        self.factories.write().remove(id).is_some()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.factories.read().contains_key(id)
    }

    /// Registered plugin ids, sorted.
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.factories.read().keys().cloned().collect();
        ids.sort();
        ids
    }
}

impl<C: Send + Sync + 'static> Default for FactoryTable<C> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<C: Send + Sync + 'static> FactoryResolver<C> for FactoryTable<C> {
    async fn resolve(&self, request: LoadRequest<C>) -> Result<LoadDescriptor<C>> {
        let LoadRequest { descriptor, factory } = request;
        if let Some(factory) = factory {
            return Ok(LoadDescriptor {
                descriptor,
                factory,
            });
        }

        let factory = self.factories.read().get(&descriptor.id).cloned();
        match factory {
            Some(factory) => Ok(LoadDescriptor {
                descriptor,
                factory,
            }),
            None => anyhow::bail!("no factory registered for plugin '{}'", descriptor.id),
        }
    }
}

impl<C> std::fmt::Debug for FactoryTable<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FactoryTable")
            .field("factory_count", &self.factories.read().len())
            .finish_non_exhaustive()
    }
}
