//! Plugin registry: load/unload pipelines, live table and waiting API.
//!
//! `load` and `unload` are fire-and-forget: they enqueue a request and
//! return. Two pipeline tasks drain the request queues once the registry is
//! first used inside a tokio runtime. Outcomes are observed through the
//! replayed loaded/unloaded event channels or the `wait_for*` helpers.

use chrono::{DateTime, Utc};
use futures_util::future::try_join_all;
use futures_util::stream::FuturesUnordered;
use parking_lot::{Mutex, RwLock};
use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinError;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::config::{FaultPolicy, RegistryConfig};
use crate::error::{PluginError, Result};

use super::events::{PluginEvents, ReplayChannel};
use super::lifecycle::PluginState;
use super::loader::StandardResolver;
use super::traits::{
    Exports, FactoryResolver, LoadDescriptor, LoadRequest, PluginDescriptor, PluginFactory,
    PluginScope,
};

/// A plugin whose factory has published exports.
pub struct LoadedPlugin<C> {
    descriptor: PluginDescriptor,
    factory: Arc<dyn PluginFactory<C>>,
    exports: Exports,
    cancellation: CancellationToken,
    instance: u64,
    loaded_at: DateTime<Utc>,
}

impl<C> LoadedPlugin<C> {
    pub fn id(&self) -> &str {
        &self.descriptor.id
    }

    pub fn descriptor(&self) -> &PluginDescriptor {
        &self.descriptor
    }

    pub fn factory(&self) -> &Arc<dyn PluginFactory<C>> {
        &self.factory
    }

    pub fn exports(&self) -> &Exports {
        &self.exports
    }

    /// Exports downcast to their concrete type.
    pub fn exports_as<T: Any + Send + Sync>(&self) -> Result<Arc<T>> {
        Arc::clone(&self.exports)
            .downcast::<T>()
            .map_err(|_| PluginError::ExportType {
                id: self.descriptor.id.clone(),
                expected: std::any::type_name::<T>(),
            })
    }

    /// Cancellation handle; cancelling it stops the plugin activity.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    /// Registry-unique instance number. Reloading an id yields a new one.
    pub fn instance(&self) -> u64 {
        self.instance
    }

    pub fn loaded_at(&self) -> DateTime<Utc> {
        self.loaded_at
    }
}

impl<C> std::fmt::Debug for LoadedPlugin<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadedPlugin")
            .field("id", &self.descriptor.id)
            .field("instance", &self.instance)
            .field("loaded_at", &self.loaded_at)
            .finish_non_exhaustive()
    }
}

type Outcome<C> = std::result::Result<Arc<LoadedPlugin<C>>, PluginError>;

struct PluginSlot<C> {
    state: PluginState,
    instance: u64,
    plugin: Option<Arc<LoadedPlugin<C>>>,
    cancellation: CancellationToken,
    unload_waiters: Vec<oneshot::Sender<Result<()>>>,
    /// Set by `unload` before the request reaches the unload pipeline.
    unload_requested: bool,
    /// Load submitted while this instance was on its way out.
    reload: Option<QueuedLoad<C>>,
}

impl<C> PluginSlot<C> {
    fn pending(queued: &QueuedLoad<C>) -> Self {
        Self {
            state: PluginState::Pending,
            instance: queued.instance,
            plugin: None,
            cancellation: queued.cancellation.clone(),
            unload_waiters: Vec::new(),
            unload_requested: false,
            reload: None,
        }
    }

    /// Live instance with an unload submitted or in progress.
    fn is_leaving(&self) -> bool {
        self.state == PluginState::Unloading
            || (self.state == PluginState::Loaded && self.unload_requested)
    }

    /// Instance number a fresh waiter should accept, counting a queued reload.
    fn latest_instance(&self) -> u64 {
        self.reload
            .as_ref()
            .map_or(self.instance, |queued| queued.instance)
    }

    fn transition(&mut self, id: &str, next: PluginState) -> bool {
        if !self.state.can_transition_to(next) {
            tracing::warn!(
                plugin_id = %id,
                instance = self.instance,
                from = %self.state,
                to = %next,
                "Ignoring invalid plugin state transition"
            );
            return false;
        }
        tracing::trace!(plugin_id = %id, from = %self.state, to = %next, "Plugin state change");
        self.state = next;
        true
    }
}

struct QueuedLoad<C> {
    request: LoadRequest<C>,
    instance: u64,
    cancellation: CancellationToken,
}

struct UnloadRequest {
    descriptor: PluginDescriptor,
    /// Instance that was live when the unload was submitted.
    target: Option<u64>,
    ack: Option<oneshot::Sender<Result<()>>>,
}

struct PipelineInputs<C> {
    loads: mpsc::UnboundedReceiver<QueuedLoad<C>>,
    unloads: mpsc::UnboundedReceiver<UnloadRequest>,
}

struct RegistryInner<C> {
    context: Arc<C>,
    resolver: Arc<dyn FactoryResolver<C>>,
    config: RegistryConfig,
    slots: RwLock<HashMap<String, PluginSlot<C>>>,
    outcomes: Mutex<HashMap<String, watch::Sender<Option<Outcome<C>>>>>,
    loaded: ReplayChannel<Arc<LoadedPlugin<C>>>,
    unloaded: ReplayChannel<PluginDescriptor>,
    load_tx: mpsc::UnboundedSender<QueuedLoad<C>>,
    unload_tx: mpsc::UnboundedSender<UnloadRequest>,
    pipelines: Mutex<Option<PipelineInputs<C>>>,
    shutdown: CancellationToken,
    next_instance: AtomicU64,
}

/// Builder for [`PluginRegistry`].
pub struct RegistryBuilder<C> {
    context: Arc<C>,
    resolver: Option<Arc<dyn FactoryResolver<C>>>,
    config: RegistryConfig,
}

impl<C: Send + Sync + 'static> RegistryBuilder<C> {
    /// Resolver used to find factories for load requests.
    pub fn resolver(mut self, resolver: impl FactoryResolver<C> + 'static) -> Self {
        self.resolver = Some(Arc::new(resolver));
        self
    }

    pub fn shared_resolver(mut self, resolver: Arc<dyn FactoryResolver<C>>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn config(mut self, config: RegistryConfig) -> Self {
        self.config = config;
        self
    }

    pub fn fault_policy(mut self, policy: FaultPolicy) -> Self {
        self.config.fault_policy = policy;
        self
    }

    pub fn build(self) -> PluginRegistry<C> {
        let resolver = self
            .resolver
            .unwrap_or_else(|| Arc::new(StandardResolver) as Arc<dyn FactoryResolver<C>>);
        PluginRegistry::from_parts(self.context, resolver, self.config)
    }
}

impl<C> std::fmt::Debug for RegistryBuilder<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryBuilder")
            .field("config", &self.config)
            .field("custom_resolver", &self.resolver.is_some())
            .finish_non_exhaustive()
    }
}

/// Runtime plugin registry.
///
/// Cheap to clone; clones share the same live table and channels.
pub struct PluginRegistry<C = ()> {
    inner: Arc<RegistryInner<C>>,
}

impl<C> Clone for PluginRegistry<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C: Send + Sync + 'static> PluginRegistry<C> {
    /// Create a registry with the default resolver and configuration.
    pub fn new(context: C) -> Self {
        Self::builder(context).build()
    }

    pub fn builder(context: C) -> RegistryBuilder<C> {
        Self::builder_shared(Arc::new(context))
    }

    /// Builder for a context that is already shared elsewhere.
    pub fn builder_shared(context: Arc<C>) -> RegistryBuilder<C> {
        RegistryBuilder {
            context,
            resolver: None,
            config: RegistryConfig::default(),
        }
    }

    fn from_parts(
        context: Arc<C>,
        resolver: Arc<dyn FactoryResolver<C>>,
        config: RegistryConfig,
    ) -> Self {
        let (load_tx, loads) = mpsc::unbounded_channel();
        let (unload_tx, unloads) = mpsc::unbounded_channel();
        let preload = config.preload.clone();

        let registry = Self {
            inner: Arc::new(RegistryInner {
                context,
                resolver,
                config,
                slots: RwLock::new(HashMap::new()),
                outcomes: Mutex::new(HashMap::new()),
                loaded: ReplayChannel::new("loaded"),
                unloaded: ReplayChannel::new("unloaded"),
                load_tx,
                unload_tx,
                pipelines: Mutex::new(Some(PipelineInputs { loads, unloads })),
                shutdown: CancellationToken::new(),
                next_instance: AtomicU64::new(1),
            }),
        };

        // Queued only; factories run once the pipelines start.
        for id in preload {
            registry.enqueue_load(LoadRequest::from(id));
        }

        registry
    }

    // ── Accessors ──────────────────────────────────────────────────────

    /// Shared context passed to every plugin.
    pub fn context(&self) -> &Arc<C> {
        &self.inner.context
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.inner.config
    }

    /// Live plugin by id.
    pub fn get(&self, id: &str) -> Option<Arc<LoadedPlugin<C>>> {
        self.inner
            .slots
            .read()
            .get(id)
            .and_then(|slot| slot.plugin.clone())
    }

    pub fn is_loaded(&self, id: &str) -> bool {
        self.get(id).is_some()
    }

    /// Ids in the live table, sorted.
    pub fn loaded_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .inner
            .slots
            .read()
            .iter()
            .filter(|(_, slot)| slot.plugin.is_some())
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn loaded_count(&self) -> usize {
        self.inner
            .slots
            .read()
            .values()
            .filter(|slot| slot.plugin.is_some())
            .count()
    }

    /// Lifecycle state of the most recent instance of `id`.
    pub fn state(&self, id: &str) -> Option<PluginState> {
        self.inner.slots.read().get(id).map(|slot| slot.state)
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// The failure that terminated the loaded-events channel, if any.
    pub fn load_failure(&self) -> Option<PluginError> {
        self.inner.loaded.failure()
    }

    /// Subscribe to loaded events. Past loads are replayed first.
    pub fn loaded_events(&self) -> PluginEvents<Arc<LoadedPlugin<C>>> {
        self.ensure_started();
        self.inner.loaded.subscribe()
    }

    /// Subscribe to unloaded events. Past unloads are replayed first.
    pub fn unloaded_events(&self) -> PluginEvents<PluginDescriptor> {
        self.ensure_started();
        self.inner.unloaded.subscribe()
    }

    // ── Load ───────────────────────────────────────────────────────────

    /// Submit a plugin for loading. Returns immediately.
    ///
    /// A load for an id that is already pending or loaded is collapsed into
    /// that instance. If the live instance has an unload submitted, the new
    /// instance starts once the old one has finished.
    pub fn load(&self, plugin: impl Into<LoadRequest<C>>) {
        self.enqueue_load(plugin.into());
        self.ensure_started();
    }

    /// Load a plugin and wait for its exports.
    pub async fn load_and_wait_for(&self, plugin: impl Into<LoadRequest<C>>) -> Result<Exports> {
        let request = plugin.into();
        let descriptor = request.descriptor.clone();
        self.load(request);
        self.wait_for(descriptor).await
    }

    /// Load every plugin, then wait for all of them. Exports follow input order.
    pub async fn load_and_wait_for_all<I, P>(&self, plugins: I) -> Result<Vec<Exports>>
    where
        I: IntoIterator<Item = P>,
        P: Into<LoadRequest<C>>,
    {
        let descriptors: Vec<PluginDescriptor> = plugins
            .into_iter()
            .map(|plugin| {
                let request = plugin.into();
                let descriptor = request.descriptor.clone();
                self.load(request);
                descriptor
            })
            .collect();
        self.wait_for_all(descriptors).await
    }

    fn enqueue_load(&self, request: LoadRequest<C>) {
        let id = request.descriptor.id.clone();

        if self.is_destroyed() {
            tracing::warn!(plugin_id = %id, "Plugin registry destroyed, ignoring load request");
            return;
        }

        if !self.inner.config.is_enabled(&id) {
            tracing::warn!(plugin_id = %id, "Plugin is disabled, ignoring load request");
            self.settle(&id, Err(PluginError::Disabled { id: id.clone() }));
            return;
        }

        let dispatch = {
            let mut slots = self.inner.slots.write();
            let leaving = match slots.get(&id) {
                Some(slot)
                    if slot.reload.is_some()
                        || (slot.state.is_active() && !slot.is_leaving()) =>
                {
                    tracing::debug!(
                        plugin_id = %id,
                        state = %slot.state,
                        instance = slot.latest_instance(),
                        "Plugin already active, collapsing duplicate load"
                    );
                    return;
                }
                Some(slot) => slot.is_leaving(),
                None => false,
            };

            let queued = QueuedLoad {
                request,
                instance: self.inner.next_instance.fetch_add(1, Ordering::Relaxed),
                cancellation: CancellationToken::new(),
            };
            // Under the slot lock: the new instance cannot settle before this.
            self.reset_outcome(&id);
            if leaving {
                if let Some(slot) = slots.get_mut(&id) {
                    tracing::debug!(
                        plugin_id = %id,
                        instance = queued.instance,
                        unloading = slot.instance,
                        "Plugin is unloading, queueing reload behind it"
                    );
                    slot.reload = Some(queued);
                }
                None
            } else {
                slots.insert(id.clone(), PluginSlot::pending(&queued));
                Some(queued)
            }
        };

        if let Some(queued) = dispatch {
            self.dispatch_load(&id, queued);
        }
    }

    fn dispatch_load(&self, id: &str, queued: QueuedLoad<C>) {
        let instance = queued.instance;
        tracing::debug!(plugin_id = %id, instance, "Queued plugin load");
        if self.inner.load_tx.send(queued).is_err() {
            tracing::warn!(plugin_id = %id, "Plugin load pipeline stopped, dropping request");
            self.fail_load(id, instance, PluginError::Closed);
        }
    }

    /// Resolution stage; runs inside the load pipeline task.
    async fn resolve_load(self, queued: QueuedLoad<C>) {
        let QueuedLoad {
            request,
            instance,
            cancellation,
        } = queued;
        let id = request.descriptor.id.clone();

        tracing::debug!(plugin_id = %id, instance, "Resolving plugin factory");
        let load = match self.inner.resolver.resolve(request).await {
            Ok(load) => load,
            Err(e) => {
                self.fail_load(&id, instance, PluginError::resolution(&id, &e));
                return;
            }
        };

        if load.descriptor.id != id {
            tracing::warn!(
                plugin_id = %id,
                resolved_id = %load.descriptor.id,
                "Resolver returned a different plugin id, keeping the requested one"
            );
        }

        tokio::spawn(self.instantiate(id, load, instance, cancellation));
    }

    async fn instantiate(
        self,
        id: String,
        load: LoadDescriptor<C>,
        instance: u64,
        cancellation: CancellationToken,
    ) {
        let (export_tx, export_rx) = oneshot::channel();
        let descriptor = PluginDescriptor::new(id.clone());

        let scope = PluginScope::new(
            descriptor.clone(),
            Arc::clone(&self.inner.context),
            self.clone(),
            self.inner.config.settings_for(&id),
            export_tx,
            cancellation.clone(),
        );

        tracing::debug!(plugin_id = %id, instance, "Starting plugin activity");
        let factory = Arc::clone(&load.factory);
        let mut activity = tokio::spawn(async move { factory.run(scope).await });

        let exports = match export_rx.await {
            Ok(exports) => exports,
            Err(_) => {
                // Scope dropped without exporting: the activity has ended.
                let message = match (&mut activity).await {
                    Ok(Ok(())) => "factory finished without producing exports".to_string(),
                    Ok(Err(e)) => format!("{e:#}"),
                    Err(join) => describe_join_error(&join),
                };
                self.fail_load(&id, instance, PluginError::factory(&id, message));
                return;
            }
        };

        let plugin = Arc::new(LoadedPlugin {
            descriptor,
            factory: load.factory,
            exports,
            cancellation: cancellation.clone(),
            instance,
            loaded_at: Utc::now(),
        });

        {
            let mut slots = self.inner.slots.write();
            if let Some(slot) = slots.get_mut(&id).filter(|slot| slot.instance == instance) {
                if slot.transition(&id, PluginState::Loaded) {
                    slot.plugin = Some(Arc::clone(&plugin));
                }
            }
        }

        tracing::info!(plugin_id = %id, instance, "Plugin loaded");
        self.settle(&id, Ok(Arc::clone(&plugin)));
        self.inner.loaded.publish(plugin);

        let grace = self.inner.config.unload_timeout();
        let result = tokio::select! {
            result = &mut activity => result,
            () = force_deadline(&cancellation, grace) => {
                tracing::warn!(plugin_id = %id, instance, "Plugin did not stop in time, aborting");
                activity.abort();
                activity.await
            }
        };

        self.finish_activity(&id, instance, result);
    }

    fn fail_load(&self, id: &str, instance: u64, error: PluginError) {
        {
            let mut slots = self.inner.slots.write();
            if let Some(slot) = slots.get_mut(id).filter(|slot| slot.instance == instance) {
                slot.transition(id, PluginState::Failed);
                slot.plugin = None;
            }
        }

        tracing::error!(plugin_id = %id, instance, error = %error, "Plugin failed to load");
        self.settle(id, Err(error.clone()));

        if self.inner.config.fault_policy == FaultPolicy::Broadcast {
            self.inner.loaded.fail(error);
        }
    }

    fn finish_activity(
        &self,
        id: &str,
        instance: u64,
        result: std::result::Result<anyhow::Result<()>, JoinError>,
    ) {
        let (unloading, waiters, reload) = {
            let mut slots = self.inner.slots.write();
            let Some(slot) = slots.get_mut(id).filter(|slot| slot.instance == instance) else {
                return;
            };
            let unloading = slot.state == PluginState::Unloading;
            let next = match (&result, unloading) {
                (_, true) | (Ok(Ok(())), false) => PluginState::Unloaded,
                _ => PluginState::Failed,
            };
            slot.transition(id, next);
            slot.plugin = None;
            let waiters = std::mem::take(&mut slot.unload_waiters);
            let reload = slot.reload.take();
            if let Some(queued) = &reload {
                *slot = PluginSlot::pending(queued);
            }
            (unloading, waiters, reload)
        };

        match &result {
            Ok(Ok(())) => tracing::debug!(plugin_id = %id, instance, "Plugin activity finished"),
            Ok(Err(e)) => tracing::error!(
                plugin_id = %id,
                instance,
                error = %format!("{e:#}"),
                "Plugin activity failed"
            ),
            Err(join) => tracing::warn!(
                plugin_id = %id,
                instance,
                reason = %describe_join_error(join),
                "Plugin activity did not complete"
            ),
        }

        if unloading {
            tracing::info!(plugin_id = %id, instance, "Plugin unloaded");
            self.inner.unloaded.publish(PluginDescriptor::new(id));
            for waiter in waiters {
                let _ = waiter.send(Ok(()));
            }
        } else {
            tracing::info!(plugin_id = %id, instance, "Plugin left the live table on its own");
        }

        if let Some(queued) = reload {
            self.dispatch_load(id, queued);
        }
    }

    // ── Unload ─────────────────────────────────────────────────────────

    /// Submit a plugin for unloading. Returns immediately.
    pub fn unload(&self, plugin: impl Into<PluginDescriptor>) {
        self.submit_unload(plugin.into(), None);
    }

    /// Unload a plugin and wait until its activity has ended.
    pub async fn unload_and_wait(&self, plugin: impl Into<PluginDescriptor>) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.submit_unload(plugin.into(), Some(tx));
        rx.await.unwrap_or(Err(PluginError::Closed))
    }

    /// Submit an unload for every live plugin.
    pub fn unload_all(&self) {
        for id in self.loaded_ids() {
            self.unload(id);
        }
    }

    /// Unload every live plugin, wait for their cleanup, then destroy.
    ///
    /// Plugins still loading are cancelled rather than awaited: their
    /// factories observe `PluginScope::cancelled()` and are not tracked
    /// further. Reloads queued behind an unload are dropped.
    pub async fn shutdown(&self) -> Result<()> {
        let abandoned = self.abandon_pending();
        let ids = self.loaded_ids();
        tracing::info!(
            plugins = ids.len(),
            abandoned,
            "Shutting down plugin registry"
        );

        let results = futures_util::future::join_all(
            ids.iter().map(|id| self.unload_and_wait(id.as_str())),
        )
        .await;
        self.destroy();

        // A plugin that ended on its own while we were unloading is fine.
        results
            .into_iter()
            .filter(|result| !matches!(result, Err(PluginError::MissingPlugin { .. })))
            .collect::<Result<Vec<()>>>()
            .map(|_| ())
    }

    /// Cancel pending instances and drop queued reloads.
    fn abandon_pending(&self) -> usize {
        let mut abandoned = 0;
        for (id, slot) in self.inner.slots.write().iter_mut() {
            if let Some(queued) = slot.reload.take() {
                tracing::debug!(plugin_id = %id, instance = queued.instance, "Dropping queued reload");
                queued.cancellation.cancel();
                abandoned += 1;
            }
            if slot.state == PluginState::Pending {
                tracing::debug!(plugin_id = %id, instance = slot.instance, "Cancelling pending plugin");
                slot.cancellation.cancel();
                abandoned += 1;
            }
        }
        abandoned
    }

    fn submit_unload(
        &self,
        descriptor: PluginDescriptor,
        ack: Option<oneshot::Sender<Result<()>>>,
    ) {
        if self.is_destroyed() {
            tracing::warn!(plugin_id = %descriptor.id, "Plugin registry destroyed, ignoring unload request");
            if let Some(ack) = ack {
                let _ = ack.send(Err(PluginError::Closed));
            }
            return;
        }

        // Marked before queueing so a load submitted right after starts a
        // fresh instance instead of collapsing into this one.
        let target = self
            .inner
            .slots
            .write()
            .get_mut(&descriptor.id)
            .filter(|slot| slot.state.is_live())
            .map(|slot| {
                slot.unload_requested = true;
                slot.instance
            });

        if let Err(mpsc::error::SendError(request)) = self.inner.unload_tx.send(UnloadRequest {
            descriptor,
            target,
            ack,
        })
        {
            tracing::warn!(plugin_id = %request.descriptor.id, "Plugin unload pipeline stopped, dropping request");
            if let Some(ack) = request.ack {
                let _ = ack.send(Err(PluginError::Closed));
            }
            return;
        }
        self.ensure_started();
    }

    fn begin_unload(&self, request: UnloadRequest) {
        let UnloadRequest {
            descriptor,
            target,
            ack,
        } = request;
        let id = descriptor.id;

        let plugin = {
            let mut slots = self.inner.slots.write();
            let live = slots.get_mut(&id).filter(|slot| {
                slot.state.is_live() && target.map_or(true, |instance| instance == slot.instance)
            });
            match live {
                Some(slot) => {
                    if let Some(ack) = ack {
                        slot.unload_waiters.push(ack);
                    }
                    if slot.state == PluginState::Unloading {
                        tracing::debug!(plugin_id = %id, "Plugin already unloading");
                        return;
                    }
                    slot.transition(&id, PluginState::Unloading);
                    slot.plugin.clone()
                }
                None => {
                    let error = PluginError::MissingPlugin { id: id.clone() };
                    tracing::warn!(plugin_id = %id, "Cannot unload plugin: not loaded");
                    if let Some(ack) = ack {
                        let _ = ack.send(Err(error));
                    }
                    return;
                }
            }
        };

        if let Some(plugin) = plugin {
            tracing::info!(plugin_id = %id, instance = plugin.instance, "Unloading plugin");
            plugin.cancellation.cancel();
        }
    }

    // ── Waiting ────────────────────────────────────────────────────────

    /// Wait until `plugin` has loaded and return its exports.
    ///
    /// Plugins that loaded before the call are returned straight away.
    pub async fn wait_for(&self, plugin: impl Into<PluginDescriptor>) -> Result<Exports> {
        let plugin = self.wait_for_plugin(plugin).await?;
        Ok(Arc::clone(plugin.exports()))
    }

    /// Like [`wait_for`](Self::wait_for), downcasting exports to `T`.
    pub async fn wait_for_as<T: Any + Send + Sync>(
        &self,
        plugin: impl Into<PluginDescriptor>,
    ) -> Result<Arc<T>> {
        self.wait_for_plugin(plugin).await?.exports_as::<T>()
    }

    /// Wait until `plugin` has loaded and return the whole entry.
    pub async fn wait_for_plugin(
        &self,
        plugin: impl Into<PluginDescriptor>,
    ) -> Result<Arc<LoadedPlugin<C>>> {
        self.ensure_started();
        let descriptor = plugin.into();
        if !self.inner.config.is_enabled(&descriptor.id) {
            return Err(PluginError::Disabled { id: descriptor.id });
        }
        match self.inner.config.fault_policy {
            FaultPolicy::Broadcast => self.wait_on_broadcast(&descriptor.id).await,
            FaultPolicy::Isolated => self.wait_on_outcome(&descriptor.id).await,
        }
    }

    /// Wait for every plugin. Exports follow input order, not load order.
    pub async fn wait_for_all<I, P>(&self, plugins: I) -> Result<Vec<Exports>>
    where
        I: IntoIterator<Item = P>,
        P: Into<PluginDescriptor>,
    {
        try_join_all(plugins.into_iter().map(|plugin| self.wait_for(plugin))).await
    }

    async fn wait_on_broadcast(&self, id: &str) -> Result<Arc<LoadedPlugin<C>>> {
        let mut events = self.inner.loaded.subscribe();
        while let Some(event) = events.next().await {
            let plugin = event?;
            if plugin.id() == id && !self.is_superseded(&plugin) {
                return Ok(plugin);
            }
        }
        Err(PluginError::Closed)
    }

    async fn wait_on_outcome(&self, id: &str) -> Result<Arc<LoadedPlugin<C>>> {
        let mut outcome = self.outcome_receiver(id);
        let shutdown = self.inner.shutdown.clone();

        tokio::select! {
            biased;
            _ = outcome.wait_for(Option::is_some) => {}
            () = shutdown.cancelled() => {}
        }

        let settled = outcome.borrow().clone();
        settled.unwrap_or(Err(PluginError::Closed))
    }

    /// A replayed event belongs to an older instance than the current slot.
    fn is_superseded(&self, plugin: &LoadedPlugin<C>) -> bool {
        self.inner
            .slots
            .read()
            .get(plugin.id())
            .is_some_and(|slot| slot.latest_instance() > plugin.instance)
    }

    fn outcome_receiver(&self, id: &str) -> watch::Receiver<Option<Outcome<C>>> {
        self.inner
            .outcomes
            .lock()
            .entry(id.to_string())
            .or_insert_with(|| watch::channel(None).0)
            .subscribe()
    }

    fn reset_outcome(&self, id: &str) {
        if let Some(outcome) = self.inner.outcomes.lock().get(id) {
            outcome.send_replace(None);
        }
    }

    fn settle(&self, id: &str, result: Outcome<C>) {
        if self.is_destroyed() {
            return;
        }
        self.inner
            .outcomes
            .lock()
            .entry(id.to_string())
            .or_insert_with(|| watch::channel(None).0)
            .send_replace(Some(result));
    }

    // ── Teardown ───────────────────────────────────────────────────────

    /// Stop the registry's pipelines and complete its event channels.
    ///
    /// Running plugins are left alone; unload them first (or use
    /// [`shutdown`](Self::shutdown)) to stop their activities.
    pub fn destroy(&self) {
        if self.inner.shutdown.is_cancelled() {
            return;
        }

        self.inner.shutdown.cancel();
        self.inner.pipelines.lock().take();
        self.inner.loaded.close();
        self.inner.unloaded.close();
        self.inner.outcomes.lock().clear();

        tracing::info!(
            still_loaded = self.loaded_count(),
            "Plugin registry destroyed"
        );
    }

    // ── Pipelines ──────────────────────────────────────────────────────

    /// Spawn the pipelines on first use inside a runtime.
    fn ensure_started(&self) {
        if self.is_destroyed() {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let Some(inputs) = self.inner.pipelines.lock().take() else {
            return;
        };

        tracing::debug!("Starting plugin registry pipelines");
        let weak = Arc::downgrade(&self.inner);
        let shutdown = self.inner.shutdown.clone();

        handle.spawn(load_pipeline(weak.clone(), inputs.loads, shutdown.clone()));
        handle.spawn(unload_pipeline(weak, inputs.unloads, shutdown.clone()));
        handle.spawn(monitor(
            self.inner.loaded.subscribe(),
            self.inner.unloaded.subscribe(),
            shutdown,
        ));
    }
}

impl<C> std::fmt::Debug for PluginRegistry<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let slots = self.inner.slots.read();
        f.debug_struct("PluginRegistry")
            .field("fault_policy", &self.inner.config.fault_policy)
            .field(
                "loaded",
                &slots.values().filter(|slot| slot.plugin.is_some()).count(),
            )
            .field("slots", &slots.len())
            .field("load_events", &self.inner.loaded.history_len())
            .field("subscribers", &self.inner.loaded.listener_count())
            .field("destroyed", &self.inner.shutdown.is_cancelled())
            .finish_non_exhaustive()
    }
}

async fn load_pipeline<C: Send + Sync + 'static>(
    registry: Weak<RegistryInner<C>>,
    mut requests: mpsc::UnboundedReceiver<QueuedLoad<C>>,
    shutdown: CancellationToken,
) {
    // Resolutions are polled by this task so they start in submission order;
    // each resolved plugin is then instantiated on its own task.
    let mut resolving = FuturesUnordered::new();
    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            queued = requests.recv() => {
                let Some(queued) = queued else {
                    break;
                };
                let Some(inner) = registry.upgrade() else {
                    break;
                };
                resolving.push(PluginRegistry { inner }.resolve_load(queued));
            }
            Some(()) = resolving.next(), if !resolving.is_empty() => {}
        }
    }
    tracing::debug!("Plugin load pipeline stopped");
}

async fn unload_pipeline<C: Send + Sync + 'static>(
    registry: Weak<RegistryInner<C>>,
    mut requests: mpsc::UnboundedReceiver<UnloadRequest>,
    shutdown: CancellationToken,
) {
    loop {
        let request = tokio::select! {
            () = shutdown.cancelled() => break,
            request = requests.recv() => match request {
                Some(request) => request,
                None => break,
            },
        };
        let Some(inner) = registry.upgrade() else {
            break;
        };
        PluginRegistry { inner }.begin_unload(request);
    }
    tracing::debug!("Plugin unload pipeline stopped");
}

/// The registry's own subscriptions: keeps failures from going unreported.
async fn monitor<C>(
    mut loaded: PluginEvents<Arc<LoadedPlugin<C>>>,
    mut unloaded: PluginEvents<PluginDescriptor>,
    shutdown: CancellationToken,
) {
    let mut loaded_open = true;
    let mut unloaded_open = true;

    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            event = loaded.next(), if loaded_open => match event {
                Some(Ok(plugin)) => {
                    tracing::trace!(plugin_id = %plugin.id(), instance = plugin.instance(), "Observed plugin load");
                }
                Some(Err(error)) => {
                    tracing::error!(error = %error, "Plugin load events terminated by failure");
                    loaded_open = false;
                }
                None => loaded_open = false,
            },
            event = unloaded.next(), if unloaded_open => match event {
                Some(Ok(descriptor)) => {
                    tracing::trace!(plugin_id = %descriptor.id, "Observed plugin unload");
                }
                Some(Err(error)) => {
                    tracing::error!(error = %error, "Plugin unload events terminated by failure");
                    unloaded_open = false;
                }
                None => unloaded_open = false,
            },
            else => break,
        }
    }
}

/// Resolves `grace` after cancellation; never when no grace is configured.
async fn force_deadline(cancellation: &CancellationToken, grace: Option<std::time::Duration>) {
    cancellation.cancelled().await;
    match grace {
        Some(grace) => tokio::time::sleep(grace).await,
        None => std::future::pending::<()>().await,
    }
}

fn describe_join_error(error: &JoinError) -> String {
    if error.is_panic() {
        "factory panicked".to_string()
    } else {
        "factory task was aborted".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::FactoryTable;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn exporting(id: &str, value: u32) -> LoadDescriptor<()> {
        LoadDescriptor::new(id, move |scope: PluginScope<()>| async move {
            scope.export(value);
            scope.cancelled().await;
            anyhow::Ok(())
        })
    }

    fn unload_waiters(registry: &PluginRegistry<()>, id: &str) -> usize {
        registry
            .inner
            .slots
            .read()
            .get(id)
            .map_or(0, |slot| slot.unload_waiters.len())
    }

    #[test]
    fn construction_outside_runtime_does_not_start_pipelines() {
        let registry = PluginRegistry::new(());
        registry.load(exporting("a", 1));
        assert_eq!(registry.state("a"), Some(PluginState::Pending));
        assert!(registry.inner.pipelines.lock().is_some());
    }

    #[tokio::test]
    async fn preloaded_ids_run_once_the_registry_is_used() {
        let table = FactoryTable::new().with("a", |scope: PluginScope<()>| async move {
            scope.export(5u32);
            scope.cancelled().await;
            anyhow::Ok(())
        });
        let registry = PluginRegistry::builder(())
            .config(RegistryConfig {
                preload: vec!["a".into()],
                ..RegistryConfig::default()
            })
            .resolver(table)
            .build();
        assert_eq!(registry.state("a"), Some(PluginState::Pending));

        let exports = registry.wait_for_as::<u32>("a").await.unwrap();
        assert_eq!(*exports, 5);
    }

    #[tokio::test]
    async fn duplicate_loads_collapse_into_one_instance() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let load = LoadDescriptor::new("dup", move |scope: PluginScope<()>| {
            counter.fetch_add(1, Ordering::SeqCst);
            async move {
                scope.export("ready");
                scope.cancelled().await;
                anyhow::Ok(())
            }
        });

        let registry = PluginRegistry::new(());
        registry.load(load.clone());
        registry.load(load.clone());
        registry.load_and_wait_for(load).await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(registry.loaded_ids(), vec!["dup".to_string()]);
    }

    #[tokio::test]
    async fn stale_replay_is_skipped_after_reload() {
        let registry = PluginRegistry::new(());
        let first = registry.load_and_wait_for(exporting("a", 1)).await.unwrap();
        assert_eq!(*first.downcast::<u32>().unwrap(), 1);
        let first_instance = registry.get("a").unwrap().instance();

        registry.unload_and_wait("a").await.unwrap();
        registry.load(exporting("a", 2));

        let second = registry.wait_for_plugin("a").await.unwrap();
        assert_eq!(*second.exports_as::<u32>().unwrap(), 2);
        assert!(second.instance() > first_instance);
    }

    #[tokio::test]
    async fn wrong_export_type_is_reported() {
        let registry = PluginRegistry::new(());
        registry.load(exporting("a", 1));
        let err = registry.wait_for_as::<String>("a").await.unwrap_err();
        assert!(matches!(err, PluginError::ExportType { ref id, .. } if id == "a"));
    }

    #[tokio::test]
    async fn disabled_plugins_are_rejected() {
        let mut config = RegistryConfig {
            fault_policy: FaultPolicy::Isolated,
            ..RegistryConfig::default()
        };
        config.plugins.insert(
            "off".into(),
            crate::config::PluginConfig {
                enabled: false,
                ..Default::default()
            },
        );
        let registry = PluginRegistry::builder(()).config(config).build();

        registry.load(exporting("off", 1));
        assert_eq!(registry.state("off"), None);
        let err = registry.wait_for("off").await.unwrap_err();
        assert_eq!(err, PluginError::Disabled { id: "off".into() });
    }

    #[tokio::test]
    async fn disabled_plugins_fail_waits_under_broadcast() {
        let mut config = RegistryConfig::default();
        config.plugins.insert(
            "off".into(),
            crate::config::PluginConfig {
                enabled: false,
                ..Default::default()
            },
        );
        let registry = PluginRegistry::builder(()).config(config).build();

        let err = tokio::time::timeout(
            Duration::from_secs(5),
            registry.load_and_wait_for(exporting("off", 1)),
        )
        .await
        .expect("a disabled plugin must not leave the wait pending")
        .unwrap_err();
        assert_eq!(err, PluginError::Disabled { id: "off".into() });
        assert!(registry.load_failure().is_none());

        // Other plugins are unaffected.
        let on = registry.load_and_wait_for(exporting("on", 2)).await.unwrap();
        assert_eq!(*on.downcast::<u32>().unwrap(), 2);
    }

    #[tokio::test]
    async fn reload_behind_unload_waits_for_old_instance() {
        let registry = PluginRegistry::new(());
        registry.load_and_wait_for(exporting("a", 1)).await.unwrap();
        let first = registry.get("a").unwrap().instance();

        registry.unload("a");
        registry.load(exporting("a", 2));
        registry.load(exporting("a", 3));

        let queued = registry
            .inner
            .slots
            .read()
            .get("a")
            .and_then(|slot| slot.reload.as_ref().map(|queued| queued.instance));
        assert!(queued.is_some_and(|instance| instance > first));

        let second = registry.wait_for_plugin("a").await.unwrap();
        assert_eq!(*second.exports_as::<u32>().unwrap(), 2);
        assert_eq!(Some(second.instance()), queued);
    }

    #[tokio::test]
    async fn plugin_settings_reach_the_scope() {
        let mut config = RegistryConfig::default();
        config.plugins.insert(
            "cfg".into(),
            crate::config::PluginConfig {
                enabled: true,
                settings: [("greeting".to_string(), serde_json::json!("hi"))]
                    .into_iter()
                    .collect(),
            },
        );
        let registry = PluginRegistry::builder(()).config(config).build();

        let load = LoadDescriptor::new("cfg", |scope: PluginScope<()>| async move {
            let greeting: String = scope.setting("greeting")?.unwrap_or_default();
            scope.export(greeting);
            scope.cancelled().await;
            anyhow::Ok(())
        });
        let greeting = registry.load_and_wait_for(load).await.unwrap();
        assert_eq!(greeting.downcast::<String>().unwrap().as_str(), "hi");
    }

    #[tokio::test]
    async fn activity_ending_on_its_own_leaves_live_table() {
        let registry = PluginRegistry::new(());
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let stop_rx = Mutex::new(Some(stop_rx));
        let load = LoadDescriptor::new("short", move |scope: PluginScope<()>| {
            let stop = stop_rx.lock().take();
            async move {
                scope.export(());
                if let Some(stop) = stop {
                    let _ = stop.await;
                }
                anyhow::Ok(())
            }
        });

        registry.load_and_wait_for(load).await.unwrap();
        assert!(registry.is_loaded("short"));

        let mut unloaded = registry.unloaded_events();
        stop_tx.send(()).unwrap();
        while registry.is_loaded("short") {
            tokio::task::yield_now().await;
        }
        assert_eq!(registry.state("short"), Some(PluginState::Unloaded));

        // Only explicit unloads are broadcast.
        registry.destroy();
        assert!(unloaded.next().await.is_none());
    }

    #[tokio::test]
    async fn unload_timeout_aborts_stuck_activity() {
        let registry = PluginRegistry::builder(())
            .config(RegistryConfig {
                unload_timeout_ms: Some(20),
                ..RegistryConfig::default()
            })
            .build();

        let load = LoadDescriptor::new("stuck", |scope: PluginScope<()>| async move {
            scope.export(());
            std::future::pending::<()>().await;
            anyhow::Ok(())
        });
        registry.load_and_wait_for(load).await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), registry.unload_and_wait("stuck"))
            .await
            .expect("unload should complete once the activity is aborted")
            .unwrap();
        assert_eq!(registry.state("stuck"), Some(PluginState::Unloaded));
    }

    #[tokio::test]
    async fn second_unload_joins_the_first() {
        let registry = PluginRegistry::new(());
        let (release_tx, release_rx) = oneshot::channel::<()>();
        let release_rx = Mutex::new(Some(release_rx));
        let load = LoadDescriptor::new("slow", move |scope: PluginScope<()>| {
            let release = release_rx.lock().take();
            async move {
                scope.export(());
                scope.cancelled().await;
                if let Some(release) = release {
                    let _ = release.await;
                }
                anyhow::Ok(())
            }
        });
        registry.load_and_wait_for(load).await.unwrap();

        let first = tokio::spawn({
            let registry = registry.clone();
            async move { registry.unload_and_wait("slow").await }
        });
        let second = tokio::spawn({
            let registry = registry.clone();
            async move { registry.unload_and_wait("slow").await }
        });
        while unload_waiters(&registry, "slow") < 2 {
            tokio::task::yield_now().await;
        }
        assert_eq!(registry.state("slow"), Some(PluginState::Unloading));

        release_tx.send(()).unwrap();
        first.await.unwrap().unwrap();
        second.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn panicking_factory_is_a_factory_failure() {
        let registry = PluginRegistry::builder(())
            .fault_policy(FaultPolicy::Isolated)
            .build();
        let load = LoadDescriptor::new("boom", |_scope: PluginScope<()>| async move {
            if true {
                panic!("factory exploded");
            }
            anyhow::Ok(())
        });

        let err = registry.load_and_wait_for(load).await.unwrap_err();
        assert_eq!(
            err,
            PluginError::Factory {
                id: "boom".into(),
                message: "factory panicked".into()
            }
        );
        assert_eq!(registry.state("boom"), Some(PluginState::Failed));
        assert!(registry.load_failure().is_none());
    }

    #[tokio::test]
    async fn debug_output_summarises_registry() {
        let registry = PluginRegistry::new(());
        registry.load_and_wait_for(exporting("a", 1)).await.unwrap();
        let rendered = format!("{registry:?}");
        assert!(rendered.contains("loaded: 1"));
        let plugin = registry.get("a").unwrap();
        assert!(format!("{plugin:?}").contains("\"a\""));
    }
}
