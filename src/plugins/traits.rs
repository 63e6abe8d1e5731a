//! Plugin contract types.
//!
//! A plugin travels through three shapes: a bare [`PluginDescriptor`], a
//! [`LoadDescriptor`] once a factory has been resolved for it, and finally a
//! [`LoadedPlugin`](super::registry::LoadedPlugin) once its factory has
//! published exports.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use super::registry::PluginRegistry;

/// Value a plugin publishes to the rest of the application.
pub type Exports = Arc<dyn Any + Send + Sync>;

/// Minimal plugin identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PluginDescriptor {
    /// Unique plugin identifier (e.g., "auth", "metrics")
    pub id: String,
}

impl PluginDescriptor {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }

    pub fn id(&self) -> &str {
        &self.id
    }
}

impl From<&str> for PluginDescriptor {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for PluginDescriptor {
    fn from(id: String) -> Self {
        Self { id }
    }
}

impl From<&String> for PluginDescriptor {
    fn from(id: &String) -> Self {
        Self::new(id.as_str())
    }
}

impl From<&PluginDescriptor> for PluginDescriptor {
    fn from(descriptor: &PluginDescriptor) -> Self {
        descriptor.clone()
    }
}

impl std::fmt::Display for PluginDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.id)
    }
}

/// Instantiates a plugin.
///
/// `run` is the plugin's whole activity: it publishes exports through
/// [`PluginScope::export`], keeps running while the plugin is loaded, and
/// releases its resources once [`PluginScope::cancelled`] resolves. Returning
/// before exporting counts as a factory failure.
///
/// Implemented for async closures taking a `PluginScope<C>`:
///
/// ```rust,ignore
/// let factory = |scope: PluginScope<()>| async move {
///     scope.export(Greeter::new());
///     scope.cancelled().await;
///     anyhow::Ok(())
/// };
/// ```
#[async_trait]
pub trait PluginFactory<C>: Send + Sync + 'static {
    async fn run(&self, scope: PluginScope<C>) -> anyhow::Result<()>;
}

#[async_trait]
impl<C, F, Fut> PluginFactory<C> for F
where
    C: Send + Sync + 'static,
    F: Fn(PluginScope<C>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn run(&self, scope: PluginScope<C>) -> anyhow::Result<()> {
        (self)(scope).await
    }
}

/// A descriptor paired with the factory able to instantiate it.
pub struct LoadDescriptor<C> {
    pub descriptor: PluginDescriptor,
    pub factory: Arc<dyn PluginFactory<C>>,
}

impl<C> LoadDescriptor<C> {
    pub fn new(descriptor: impl Into<PluginDescriptor>, factory: impl PluginFactory<C>) -> Self {
        Self {
            descriptor: descriptor.into(),
            factory: Arc::new(factory),
        }
    }

    pub fn from_shared(
        descriptor: impl Into<PluginDescriptor>,
        factory: Arc<dyn PluginFactory<C>>,
    ) -> Self {
        Self {
            descriptor: descriptor.into(),
            factory,
        }
    }

    pub fn id(&self) -> &str {
        &self.descriptor.id
    }
}

impl<C> Clone for LoadDescriptor<C> {
    fn clone(&self) -> Self {
        Self {
            descriptor: self.descriptor.clone(),
            factory: Arc::clone(&self.factory),
        }
    }
}

impl<C> std::fmt::Debug for LoadDescriptor<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadDescriptor")
            .field("id", &self.descriptor.id)
            .finish_non_exhaustive()
    }
}

/// Request accepted by `PluginRegistry::load`.
///
/// Built from a bare id, a [`PluginDescriptor`], or a [`LoadDescriptor`]
/// that already carries its factory.
pub struct LoadRequest<C> {
    pub descriptor: PluginDescriptor,
    pub factory: Option<Arc<dyn PluginFactory<C>>>,
}

impl<C> LoadRequest<C> {
    pub fn id(&self) -> &str {
        &self.descriptor.id
    }
}

impl<C> From<PluginDescriptor> for LoadRequest<C> {
    fn from(descriptor: PluginDescriptor) -> Self {
        Self {
            descriptor,
            factory: None,
        }
    }
}

impl<C> From<&str> for LoadRequest<C> {
    fn from(id: &str) -> Self {
        PluginDescriptor::from(id).into()
    }
}

impl<C> From<String> for LoadRequest<C> {
    fn from(id: String) -> Self {
        PluginDescriptor::from(id).into()
    }
}

impl<C> From<&String> for LoadRequest<C> {
    fn from(id: &String) -> Self {
        PluginDescriptor::from(id).into()
    }
}

impl<C> From<LoadDescriptor<C>> for LoadRequest<C> {
    fn from(load: LoadDescriptor<C>) -> Self {
        Self {
            descriptor: load.descriptor,
            factory: Some(load.factory),
        }
    }
}

impl<C> std::fmt::Debug for LoadRequest<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadRequest")
            .field("id", &self.descriptor.id)
            .field("has_factory", &self.factory.is_some())
            .finish()
    }
}

/// Maps a load request to a loadable factory.
#[async_trait]
pub trait FactoryResolver<C>: Send + Sync {
    async fn resolve(&self, request: LoadRequest<C>) -> anyhow::Result<LoadDescriptor<C>>;
}

#[async_trait]
impl<C, F, Fut> FactoryResolver<C> for F
where
    C: Send + Sync + 'static,
    F: Fn(LoadRequest<C>) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<LoadDescriptor<C>>> + Send + 'static,
{
    async fn resolve(&self, request: LoadRequest<C>) -> anyhow::Result<LoadDescriptor<C>> {
        (self)(request).await
    }
}

/// Handle given to a running plugin activity.
pub struct PluginScope<C> {
    descriptor: PluginDescriptor,
    context: Arc<C>,
    registry: PluginRegistry<C>,
    settings: HashMap<String, serde_json::Value>,
    exporter: Mutex<Option<oneshot::Sender<Exports>>>,
    cancellation: CancellationToken,
}

impl<C> PluginScope<C> {
    pub(crate) fn new(
        descriptor: PluginDescriptor,
        context: Arc<C>,
        registry: PluginRegistry<C>,
        settings: HashMap<String, serde_json::Value>,
        exporter: oneshot::Sender<Exports>,
        cancellation: CancellationToken,
    ) -> Self {
        Self {
            descriptor,
            context,
            registry,
            settings,
            exporter: Mutex::new(Some(exporter)),
            cancellation,
        }
    }

    pub fn id(&self) -> &str {
        &self.descriptor.id
    }

    pub fn descriptor(&self) -> &PluginDescriptor {
        &self.descriptor
    }

    /// Shared context handed to every plugin of the registry.
    pub fn context(&self) -> &Arc<C> {
        &self.context
    }

    /// The registry that instantiated this plugin.
    pub fn registry(&self) -> &PluginRegistry<C> {
        &self.registry
    }

    /// Settings from the `[plugins.<id>.settings]` config table.
    pub fn settings(&self) -> &HashMap<String, serde_json::Value> {
        &self.settings
    }

    /// Deserialize a single setting. `Ok(None)` when the key is absent.
    pub fn setting<T: DeserializeOwned>(&self, key: &str) -> anyhow::Result<Option<T>> {
        self.settings
            .get(key)
            .map(|value| {
                serde_json::from_value(value.clone()).map_err(|e| {
                    anyhow::anyhow!("invalid setting '{key}' for plugin '{}': {e}", self.id())
                })
            })
            .transpose()
    }

    /// Publish the plugin's exports.
    ///
    /// Only the first call has an effect; later calls return `false`.
    pub fn export<T: Any + Send + Sync>(&self, exports: T) -> bool {
        self.export_arc(Arc::new(exports))
    }

    /// Publish already type-erased exports.
    pub fn export_arc(&self, exports: Exports) -> bool {
        match self.exporter.lock().take() {
            Some(tx) => tx.send(exports).is_ok(),
            None => {
                tracing::trace!(plugin_id = %self.descriptor.id, "Ignoring repeated export");
                false
            }
        }
    }

    pub fn is_exported(&self) -> bool {
        self.exporter.lock().is_none()
    }

    /// Token cancelled when the plugin is unloaded.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    /// Resolves once the plugin has been asked to unload.
    pub async fn cancelled(&self) {
        self.cancellation.cancelled().await;
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }
}

impl<C> std::fmt::Debug for PluginScope<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginScope")
            .field("id", &self.descriptor.id)
            .field("exported", &self.is_exported())
            .field("cancelled", &self.is_cancelled())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scope_with_settings(
        settings: HashMap<String, serde_json::Value>,
    ) -> (PluginScope<()>, oneshot::Receiver<Exports>) {
        let (tx, rx) = oneshot::channel();
        let scope = PluginScope::new(
            PluginDescriptor::new("cache"),
            Arc::new(()),
            PluginRegistry::new(()),
            settings,
            tx,
            CancellationToken::new(),
        );
        (scope, rx)
    }

    #[test]
    fn descriptor_conversions_agree() {
        let owned = String::from("auth");
        assert_eq!(PluginDescriptor::from("auth"), PluginDescriptor::new("auth"));
        assert_eq!(PluginDescriptor::from(&owned).id(), "auth");
        assert_eq!(PluginDescriptor::from(owned).to_string(), "auth");
    }

    #[test]
    fn descriptor_serializes_as_object() {
        let json = serde_json::to_string(&PluginDescriptor::new("redis")).unwrap();
        assert_eq!(json, r#"{"id":"redis"}"#);
    }

    #[test]
    fn bare_ids_become_requests_without_factory() {
        let request: LoadRequest<()> = "metrics".into();
        assert_eq!(request.id(), "metrics");
        assert!(request.factory.is_none());
    }

    #[test]
    fn load_descriptors_keep_their_factory() {
        let load = LoadDescriptor::new("metrics", |_scope: PluginScope<()>| async {
            anyhow::Ok(())
        });
        let request: LoadRequest<()> = load.into();
        assert!(request.factory.is_some());
    }

    #[test]
    fn only_first_export_is_delivered() {
        let (scope, mut rx) = scope_with_settings(HashMap::new());
        assert!(!scope.is_exported());
        assert!(scope.export(1u32));
        assert!(!scope.export(2u32));
        assert!(scope.is_exported());

        let exports = rx.try_recv().unwrap();
        assert_eq!(*exports.downcast::<u32>().unwrap(), 1);
    }

    #[test]
    fn typed_settings_lookup() {
        let mut settings = HashMap::new();
        settings.insert("ttl_secs".to_string(), serde_json::json!(60));
        settings.insert("name".to_string(), serde_json::json!(["not", "a", "string"]));
        let (scope, _rx) = scope_with_settings(settings);

        assert_eq!(scope.setting::<u64>("ttl_secs").unwrap(), Some(60));
        assert_eq!(scope.setting::<u64>("missing").unwrap(), None);
        let err = scope.setting::<String>("name").unwrap_err();
        assert!(err.to_string().contains("invalid setting 'name'"));
    }

    #[test]
    fn cancellation_is_observable() {
        let (scope, _rx) = scope_with_settings(HashMap::new());
        assert!(!scope.is_cancelled());
        scope.cancellation().cancel();
        assert!(scope.is_cancelled());
    }
}
