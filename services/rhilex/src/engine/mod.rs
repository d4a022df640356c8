//! Rule engine
//!
//! Owns the four resource collections (sources, devices, targets, cecollas)
//! and the rules bound to them. Producers push payloads through
//! [`EngineHandle::work_in_end`] / [`EngineHandle::work_device`] into two
//! bounded queues; one drainer per queue runs every running rule bound to the
//! producing resource, in rule registration order.

mod collection;
mod queue;
mod registry;
mod rules;
mod runner;
mod snapshot;
mod stats;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use errors::RhilexResult;
use parking_lot::RwLock;
use rhilex_cache::{DEFAULT_RULE_ENGINE_SLOT, DEVICE_CONFIG_MAP_SLOT};
use rhilex_core::{
    AppletDef, EngineHandle, ResourceDef, ResourceKind, ResourceState, RuntimeContext, XCecolla,
    XDevice, XSource, XTarget,
};
use rhilex_script::{AppletRuntime, ScriptEnv};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::plugins::PluginManager;
use crate::store::ConfigStore;

pub use collection::{Collection, Entry};
pub use queue::{InternalQueue, QueueItem, DEVICE_QUEUE, INEND_QUEUE};
pub use registry::{EngineRef, Factories, Factory, TypeRegistry};
pub use rules::RuleEntry;
pub use stats::{Statistics, StatisticsSnapshot};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Reload locks, one per resource kind, held across Init/Start
#[derive(Default)]
struct ReloadLocks {
    source: tokio::sync::Mutex<()>,
    device: tokio::sync::Mutex<()>,
    target: tokio::sync::Mutex<()>,
    cecolla: tokio::sync::Mutex<()>,
    multimedia: tokio::sync::Mutex<()>,
}

impl ReloadLocks {
    fn get(&self, kind: ResourceKind) -> &tokio::sync::Mutex<()> {
        match kind {
            ResourceKind::Source => &self.source,
            ResourceKind::Device => &self.device,
            ResourceKind::Target => &self.target,
            ResourceKind::Cecolla => &self.cecolla,
            ResourceKind::Multimedia => &self.multimedia,
        }
    }
}

pub struct RuleEngine {
    runtime: RuntimeContext,
    store: Arc<dyn ConfigStore>,
    registry: TypeRegistry,
    sources: Collection<dyn XSource>,
    devices: Collection<dyn XDevice>,
    targets: Collection<dyn XTarget>,
    cecollas: Collection<dyn XCecolla>,
    rules: RwLock<Vec<Arc<RuleEntry>>>,
    applets: Arc<AppletRuntime>,
    plugins: PluginManager,
    in_queue: InternalQueue,
    device_queue: InternalQueue,
    stats: Statistics,
    reload_locks: ReloadLocks,
    /// Cancels the queue drainers
    token: CancellationToken,
    started: AtomicBool,
    me: Weak<RuleEngine>,
}

impl RuleEngine {
    pub fn new(runtime: RuntimeContext, store: Arc<dyn ConfigStore>) -> Arc<Self> {
        Self::with_registry(runtime, store, TypeRegistry::with_builtin())
    }

    pub fn with_registry(
        runtime: RuntimeContext,
        store: Arc<dyn ConfigStore>,
        registry: TypeRegistry,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me: &Weak<RuleEngine>| {
            let handle: Weak<dyn EngineHandle> = me.clone();
            let applets = AppletRuntime::new(ScriptEnv::new(runtime.clone(), handle));
            let capacity = runtime.config.max_queue_size;
            let token = runtime.root.child_token();
            Self {
                store,
                registry,
                sources: Collection::new(),
                devices: Collection::new(),
                targets: Collection::new(),
                cecollas: Collection::new(),
                rules: RwLock::new(Vec::new()),
                applets,
                plugins: PluginManager::new(),
                in_queue: InternalQueue::new(INEND_QUEUE, capacity),
                device_queue: InternalQueue::new(DEVICE_QUEUE, capacity),
                stats: Statistics::default(),
                reload_locks: ReloadLocks::default(),
                token,
                started: AtomicBool::new(false),
                me: me.clone(),
                runtime,
            }
        })
    }

    pub fn version(&self) -> &'static str {
        VERSION
    }

    pub fn registry(&self) -> &TypeRegistry {
        &self.registry
    }

    pub fn store(&self) -> &Arc<dyn ConfigStore> {
        &self.store
    }

    pub fn applets(&self) -> &Arc<AppletRuntime> {
        &self.applets
    }

    pub fn plugins(&self) -> &PluginManager {
        &self.plugins
    }

    pub fn statistics(&self) -> StatisticsSnapshot {
        self.stats.snapshot()
    }

    pub fn engine_ref(&self) -> EngineRef {
        let handle: Weak<dyn EngineHandle> = self.me.clone();
        EngineRef::new(handle)
    }

    pub(crate) fn script_env(&self) -> ScriptEnv {
        let handle: Weak<dyn EngineHandle> = self.me.clone();
        ScriptEnv::new(self.runtime.clone(), handle)
    }

    /// Register the engine's cache slots and start the queue drainers.
    /// Calling it again is a no-op.
    pub fn start(self: &Arc<Self>) {
        if self.started.swap(true, Ordering::AcqRel) {
            return;
        }
        let cache = &self.runtime.cache;
        for slot in [DEFAULT_RULE_ENGINE_SLOT, DEVICE_CONFIG_MAP_SLOT] {
            if !cache.contains_slot(slot) {
                cache.register_slot(slot);
            }
        }
        if let Some(rx) = self.in_queue.take_receiver() {
            self.spawn_drainer(ResourceKind::Source, rx);
        }
        if let Some(rx) = self.device_queue.take_receiver() {
            self.spawn_drainer(ResourceKind::Device, rx);
        }
        info!("Rule engine {} started", VERSION);
    }

    fn spawn_drainer(self: &Arc<Self>, kind: ResourceKind, mut rx: mpsc::Receiver<QueueItem>) {
        let engine = Arc::downgrade(self);
        let token = self.token.clone();
        tokio::spawn(async move {
            loop {
                let item = tokio::select! {
                    _ = token.cancelled() => break,
                    item = rx.recv() => match item {
                        Some(item) => item,
                        None => break,
                    },
                };
                let Some(engine) = engine.upgrade() else { break };
                match kind {
                    ResourceKind::Device => {
                        engine.run_device_callbacks(&item.resource_id, &item.data).await
                    },
                    _ => engine.run_source_callbacks(&item.resource_id, &item.data).await,
                }
            }
            debug!("{} queue drainer stopped", kind);
        });
    }

    /// Load everything the store holds: resources first, then rules, then
    /// applets. Individual failures are logged and skipped.
    pub async fn boot(self: &Arc<Self>) -> RhilexResult<()> {
        for def in self.store.list_resources(ResourceKind::Source).await? {
            if let Err(e) = self.load_source(def.clone()).await {
                warn!("Load source {} failed: {}", def.uuid, e);
            }
        }
        for def in self.store.list_resources(ResourceKind::Device).await? {
            if let Err(e) = self.load_device(def.clone()).await {
                warn!("Load device {} failed: {}", def.uuid, e);
            }
        }
        for def in self.store.list_resources(ResourceKind::Target).await? {
            if let Err(e) = self.load_target(def.clone()).await {
                warn!("Load target {} failed: {}", def.uuid, e);
            }
        }
        for def in self.store.list_resources(ResourceKind::Cecolla).await? {
            if let Err(e) = self.load_cecolla(def.clone()).await {
                warn!("Load cecolla {} failed: {}", def.uuid, e);
            }
        }
        for def in self.store.list_rules().await? {
            let id = def.uuid.clone();
            if let Err(e) = self.load_rule(def) {
                warn!("Load rule {} failed: {}", id, e);
            }
        }
        for def in self.store.list_applets().await? {
            let id = def.uuid.clone();
            if let Err(e) = self.applets.load(def) {
                warn!("Load applet {} failed: {}", id, e);
            }
        }
        self.applets.start_auto();
        Ok(())
    }

    /// Shut everything down: applets, plugins, resources, rules, then the
    /// engine's cache slots
    pub async fn stop(&self) {
        info!("Ready to stop rhilex");
        self.applets.stop_all();
        self.plugins.stop_all().await;
        self.token.cancel();
        self.runtime.supervisors.stop_all();

        for entry in self.sources.drain() {
            entry.instance.set_state(ResourceState::Stop);
            entry.instance.stop().await;
            info!("Stop source: {}", entry.def.uuid);
        }
        for entry in self.targets.drain() {
            entry.instance.set_state(ResourceState::Stop);
            entry.instance.stop().await;
            info!("Stop target: {}", entry.def.uuid);
        }
        for entry in self.devices.drain() {
            entry.instance.set_state(ResourceState::Stop);
            entry.instance.stop().await;
            info!("Stop device: {}", entry.def.uuid);
        }
        for entry in self.cecollas.drain() {
            entry.instance.set_state(ResourceState::Stop);
            entry.instance.stop().await;
            info!("Stop cecolla: {}", entry.def.uuid);
        }
        for rule in std::mem::take(&mut *self.rules.write()) {
            rule.vm.stop();
        }

        let cache = &self.runtime.cache;
        cache.flush();
        cache.unregister_slot(DEFAULT_RULE_ENGINE_SLOT);
        cache.unregister_slot(DEVICE_CONFIG_MAP_SLOT);
        info!("Stop rhilex successfully");
    }
}

impl EngineHandle for RuleEngine {
    fn runtime(&self) -> &RuntimeContext {
        &self.runtime
    }

    fn work_in_end(&self, source_id: &str, data: &str) -> RhilexResult<()> {
        let pushed = self.in_queue.push(source_id, data);
        self.stats.inc_in(pushed.is_ok());
        pushed
    }

    fn work_device(&self, device_id: &str, data: &str) -> RhilexResult<()> {
        let pushed = self.device_queue.push(device_id, data);
        self.stats.inc_in(pushed.is_ok());
        pushed
    }

    fn get_source(&self, id: &str) -> Option<Arc<dyn XSource>> {
        self.sources.get(id)
    }

    fn get_device(&self, id: &str) -> Option<Arc<dyn XDevice>> {
        self.devices.get(id)
    }

    fn get_target(&self, id: &str) -> Option<Arc<dyn XTarget>> {
        self.targets.get(id)
    }

    fn get_cecolla(&self, id: &str) -> Option<Arc<dyn XCecolla>> {
        self.cecollas.get(id)
    }

    fn resource_def(&self, kind: ResourceKind, id: &str) -> Option<ResourceDef> {
        match kind {
            ResourceKind::Source => self.sources.def(id),
            ResourceKind::Device => self.devices.def(id),
            ResourceKind::Target => self.targets.def(id),
            ResourceKind::Cecolla => self.cecollas.def(id),
            ResourceKind::Multimedia => None,
        }
    }

    fn set_device_status(&self, id: &str, state: ResourceState) {
        if let Some(device) = self.devices.get(id) {
            device.set_state(state);
        }
    }

    fn set_source_status(&self, id: &str, state: ResourceState) {
        if let Some(source) = self.sources.get(id) {
            source.set_state(state);
        }
    }

    fn load_applet(&self, def: AppletDef) -> RhilexResult<()> {
        self.applets.load(def)
    }

    fn start_applet(&self, id: &str, env: serde_json::Value) -> RhilexResult<()> {
        self.applets.start(id, env)
    }

    fn stop_applet(&self, id: &str) -> RhilexResult<()> {
        self.applets.stop(id)
    }

    fn remove_applet(&self, id: &str) -> RhilexResult<()> {
        self.applets.remove(id)
    }
}

impl std::fmt::Debug for RuleEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuleEngine")
            .field("sources", &self.sources.len())
            .field("devices", &self.devices.len())
            .field("targets", &self.targets.len())
            .field("cecollas", &self.cecollas.len())
            .field("rules", &self.rules.read().len())
            .finish()
    }
}
