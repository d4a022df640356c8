//! Lifecycle runner: Init -> Start -> supervise -> reload
//!
//! Every resource kind goes through the same path; [`Kind`] maps a marker
//! type onto the engine's collection and factory table for that kind.

use std::sync::{Arc, Weak};

use errors::{ErrorCategory, RhilexError, RhilexResult};
use futures::future::{BoxFuture, FutureExt};
use rhilex_bus::EventMessage;
use rhilex_cache::{CacheValue, DEFAULT_RULE_ENGINE_SLOT, DEVICE_CONFIG_MAP_SLOT};
use rhilex_core::{
    ResourceDef, ResourceKind, ResourceState, Supervisor, XCecolla, XDevice, XSource, XStatus,
    XTarget,
};
use serde_json::{json, Value};
use tracing::{debug, error, info, warn};

use super::collection::{Collection, Entry};
use super::registry::Factories;
use super::RuleEngine;

pub(crate) trait Kind: Send + Sync + 'static {
    type Res: ?Sized + XStatus + 'static;
    const KIND: ResourceKind;

    fn collection(engine: &RuleEngine) -> &Collection<Self::Res>;
    fn factories(engine: &RuleEngine) -> &Factories<Self::Res>;
}

pub(crate) struct SourceKind;
pub(crate) struct DeviceKind;
pub(crate) struct TargetKind;
pub(crate) struct CecollaKind;

impl Kind for SourceKind {
    type Res = dyn XSource;
    const KIND: ResourceKind = ResourceKind::Source;

    fn collection(engine: &RuleEngine) -> &Collection<Self::Res> {
        &engine.sources
    }

    fn factories(engine: &RuleEngine) -> &Factories<Self::Res> {
        &engine.registry.sources
    }
}

impl Kind for DeviceKind {
    type Res = dyn XDevice;
    const KIND: ResourceKind = ResourceKind::Device;

    fn collection(engine: &RuleEngine) -> &Collection<Self::Res> {
        &engine.devices
    }

    fn factories(engine: &RuleEngine) -> &Factories<Self::Res> {
        &engine.registry.devices
    }
}

impl Kind for TargetKind {
    type Res = dyn XTarget;
    const KIND: ResourceKind = ResourceKind::Target;

    fn collection(engine: &RuleEngine) -> &Collection<Self::Res> {
        &engine.targets
    }

    fn factories(engine: &RuleEngine) -> &Factories<Self::Res> {
        &engine.registry.targets
    }
}

impl Kind for CecollaKind {
    type Res = dyn XCecolla;
    const KIND: ResourceKind = ResourceKind::Cecolla;

    fn collection(engine: &RuleEngine) -> &Collection<Self::Res> {
        &engine.cecollas
    }

    fn factories(engine: &RuleEngine) -> &Factories<Self::Res> {
        &engine.registry.cecollas
    }
}

/// Errors that no amount of retrying will fix
fn is_permanent(e: &RhilexError) -> bool {
    matches!(
        e.category(),
        ErrorCategory::Configuration | ErrorCategory::Validation
    )
}

impl RuleEngine {
    async fn load<K: Kind>(self: &Arc<Self>, mut def: ResourceDef) -> RhilexResult<()> {
        K::factories(self).check(&def.type_tag)?;
        if K::KIND == ResourceKind::Device {
            self.merge_points(&mut def).await;
        }
        let instance = K::factories(self).create(
            &def.type_tag,
            self.runtime.clone(),
            self.engine_ref(),
        )?;

        if let Some(old) = K::collection(self).insert(def.clone(), Arc::clone(&instance)) {
            debug!("Replacing {} {}", K::KIND, def.uuid);
            old.instance.set_state(ResourceState::Stop);
            old.instance.stop().await;
        }
        if K::KIND == ResourceKind::Device {
            let config = serde_json::to_string(&def)?;
            self.runtime.cache.set(
                DEVICE_CONFIG_MAP_SLOT,
                &def.uuid,
                CacheValue::ok(def.uuid.clone(), config),
            );
        }
        self.launch::<K>(&def, instance).await
    }

    /// Fill `config.points` from the store's point table when the config
    /// carries none
    async fn merge_points(&self, def: &mut ResourceDef) {
        let has_points = def
            .config
            .get("points")
            .and_then(Value::as_array)
            .is_some_and(|p| !p.is_empty());
        if has_points {
            return;
        }
        match self.store.device_points(&def.uuid).await {
            Ok(rows) if !rows.is_empty() => {
                if let (Some(config), Ok(points)) =
                    (def.config.as_object_mut(), serde_json::to_value(rows))
                {
                    config.insert("points".to_string(), points);
                }
            },
            Ok(_) => {},
            Err(e) => warn!("Load points of {} failed: {}", def.uuid, e),
        }
    }

    async fn launch<K: Kind>(
        self: &Arc<Self>,
        def: &ResourceDef,
        instance: Arc<K::Res>,
    ) -> RhilexResult<()> {
        let id = def.uuid.as_str();
        if let Err(e) = instance.init(id, &def.config).await {
            error!("{} {} init failed: {}", K::KIND, id, e);
            self.record_failure(id, &e);
            instance.set_state(ResourceState::Down);
            if !is_permanent(&e) {
                let sv = self.runtime.supervisors.register(id);
                self.spawn_supervisor::<K>(sv, instance);
            }
            return Err(e);
        }

        let sv = self.runtime.supervisors.register(id);
        match instance.start(sv.token.clone()).await {
            Ok(()) => {
                self.runtime.cache.delete(DEFAULT_RULE_ENGINE_SLOT, id);
                if instance.status() == ResourceState::Pending {
                    instance.set_state(ResourceState::Up);
                }
                info!("{} {} started", K::KIND, id);
                self.spawn_supervisor::<K>(sv, instance);
                Ok(())
            },
            Err(e) => {
                error!("{} {} start failed: {}", K::KIND, id, e);
                self.record_failure(id, &e);
                instance.set_state(ResourceState::Down);
                self.spawn_supervisor::<K>(sv, instance);
                Err(e)
            },
        }
    }

    fn record_failure(&self, id: &str, e: &RhilexError) {
        self.runtime.cache.set(
            DEFAULT_RULE_ENGINE_SLOT,
            id,
            CacheValue::error(id, e.to_string()),
        );
    }

    fn spawn_supervisor<K: Kind>(self: &Arc<Self>, sv: Supervisor, instance: Arc<K::Res>) {
        let engine = Arc::downgrade(self);
        let runtime = self.runtime.clone();
        tokio::spawn(async move {
            let timing = runtime.timing;
            let mut ticker = tokio::time::interval(timing.tick);
            ticker.tick().await;
            let mut reload = false;
            loop {
                tokio::select! {
                    _ = runtime.root.cancelled() => break,
                    _ = sv.token.cancelled() => break,
                    _ = ticker.tick() => {},
                }
                let Some(strong) = engine.upgrade() else { break };
                let current = K::collection(&strong).get(&sv.id);
                drop(strong);
                match current {
                    Some(current) if Arc::ptr_eq(&current, &instance) => {},
                    _ => break,
                }
                if instance.status() != ResourceState::Down {
                    continue;
                }

                let err_msg = runtime.cache.get(DEFAULT_RULE_ENGINE_SLOT, &sv.id).err_msg;
                warn!("{} {} is down: {}", K::KIND, sv.id, err_msg);
                let topic = K::KIND.down_topic(&sv.id);
                runtime.bus.publish(
                    &topic,
                    EventMessage::new(
                        topic.as_str(),
                        sv.id.as_str(),
                        K::KIND.as_str(),
                        json!({ "uuid": sv.id, "error": err_msg }),
                    ),
                );
                tokio::select! {
                    _ = runtime.root.cancelled() => break,
                    _ = sv.token.cancelled() => break,
                    _ = tokio::time::sleep(timing.reload_delay) => {},
                }
                reload = true;
                break;
            }
            drop(instance);
            if reload {
                spawn_reload::<K>(engine, sv.id.clone());
            } else {
                runtime.supervisors.unregister_if_current(&sv.id, sv.generation);
                debug!("Supervisor {} exited", sv.id);
            }
        });
    }

    async fn reload<K: Kind>(self: &Arc<Self>, id: &str) {
        let _guard = self.reload_locks.get(K::KIND).lock().await;
        if self.runtime.root.is_cancelled() {
            return;
        }
        let Some(current) = K::collection(self).def(id) else {
            debug!("{} {} removed before reload", K::KIND, id);
            return;
        };
        let def = match self.store.fetch(K::KIND, id).await {
            Ok(Some(def)) => def,
            Ok(None) => current,
            Err(e) => {
                warn!("Fetch {} {} failed, reloading last config: {}", K::KIND, id, e);
                current
            },
        };
        info!("Reloading {} {}", K::KIND, id);
        if let Err(e) = self.load::<K>(def).await {
            warn!("Reload {} {} failed: {}", K::KIND, id, e);
        }
    }

    async fn remove<K: Kind>(&self, id: &str) -> RhilexResult<()> {
        let Entry { instance, .. } = K::collection(self)
            .remove(id)
            .ok_or_else(|| RhilexError::not_found(K::KIND.as_str(), id))?;
        let _ = self.runtime.supervisors.unregister(id);
        instance.set_state(ResourceState::Stop);
        instance.stop().await;
        let cache = &self.runtime.cache;
        cache.delete(DEVICE_CONFIG_MAP_SLOT, id);
        cache.delete(DEFAULT_RULE_ENGINE_SLOT, id);
        info!("{} removed: {}", K::KIND, id);
        Ok(())
    }

    fn restart<K: Kind>(self: &Arc<Self>, id: &str) -> RhilexResult<()> {
        let instance = K::collection(self)
            .get(id)
            .ok_or_else(|| RhilexError::not_found(K::KIND.as_str(), id))?;
        instance.set_state(ResourceState::Down);
        if !self.runtime.supervisors.contains(id) {
            spawn_reload::<K>(Arc::downgrade(self), id.to_string());
        }
        Ok(())
    }

    // sources

    pub async fn load_source(self: &Arc<Self>, def: ResourceDef) -> RhilexResult<()> {
        self.load::<SourceKind>(def).await
    }

    pub fn get_source_entry(&self, id: &str) -> Option<Entry<dyn XSource>> {
        self.sources.entry(id)
    }

    /// Store without starting
    pub async fn save_source(&self, def: ResourceDef) -> RhilexResult<()> {
        self.save::<SourceKind>(def).await
    }

    pub async fn remove_source(&self, id: &str) -> RhilexResult<()> {
        self.remove::<SourceKind>(id).await
    }

    pub fn all_sources(&self) -> Vec<Entry<dyn XSource>> {
        self.sources.all()
    }

    pub fn restart_source(self: &Arc<Self>, id: &str) -> RhilexResult<()> {
        self.restart::<SourceKind>(id)
    }

    pub fn check_source_type(&self, type_tag: &str) -> RhilexResult<()> {
        self.registry.sources.check(type_tag)
    }

    // devices

    pub async fn load_device(self: &Arc<Self>, def: ResourceDef) -> RhilexResult<()> {
        self.load::<DeviceKind>(def).await
    }

    pub fn get_device_entry(&self, id: &str) -> Option<Entry<dyn XDevice>> {
        self.devices.entry(id)
    }

    pub async fn save_device(&self, def: ResourceDef) -> RhilexResult<()> {
        self.save::<DeviceKind>(def).await
    }

    pub async fn remove_device(&self, id: &str) -> RhilexResult<()> {
        self.remove::<DeviceKind>(id).await
    }

    pub fn all_devices(&self) -> Vec<Entry<dyn XDevice>> {
        self.devices.all()
    }

    pub fn restart_device(self: &Arc<Self>, id: &str) -> RhilexResult<()> {
        self.restart::<DeviceKind>(id)
    }

    pub fn check_device_type(&self, type_tag: &str) -> RhilexResult<()> {
        self.registry.devices.check(type_tag)
    }

    // targets

    pub async fn load_target(self: &Arc<Self>, def: ResourceDef) -> RhilexResult<()> {
        self.load::<TargetKind>(def).await
    }

    pub fn get_target_entry(&self, id: &str) -> Option<Entry<dyn XTarget>> {
        self.targets.entry(id)
    }

    pub async fn save_target(&self, def: ResourceDef) -> RhilexResult<()> {
        self.save::<TargetKind>(def).await
    }

    pub async fn remove_target(&self, id: &str) -> RhilexResult<()> {
        self.remove::<TargetKind>(id).await
    }

    pub fn all_targets(&self) -> Vec<Entry<dyn XTarget>> {
        self.targets.all()
    }

    pub fn restart_target(self: &Arc<Self>, id: &str) -> RhilexResult<()> {
        self.restart::<TargetKind>(id)
    }

    pub fn check_target_type(&self, type_tag: &str) -> RhilexResult<()> {
        self.registry.targets.check(type_tag)
    }

    // cecollas

    pub async fn load_cecolla(self: &Arc<Self>, def: ResourceDef) -> RhilexResult<()> {
        self.load::<CecollaKind>(def).await
    }

    pub fn get_cecolla_entry(&self, id: &str) -> Option<Entry<dyn XCecolla>> {
        self.cecollas.entry(id)
    }

    pub async fn save_cecolla(&self, def: ResourceDef) -> RhilexResult<()> {
        self.save::<CecollaKind>(def).await
    }

    pub async fn remove_cecolla(&self, id: &str) -> RhilexResult<()> {
        self.remove::<CecollaKind>(id).await
    }

    pub fn all_cecollas(&self) -> Vec<Entry<dyn XCecolla>> {
        self.cecollas.all()
    }

    pub fn restart_cecolla(self: &Arc<Self>, id: &str) -> RhilexResult<()> {
        self.restart::<CecollaKind>(id)
    }

    pub fn check_cecolla_type(&self, type_tag: &str) -> RhilexResult<()> {
        self.registry.cecollas.check(type_tag)
    }

    /// Store without starting; a replaced instance is stopped and loses its
    /// supervisor
    async fn save<K: Kind>(&self, def: ResourceDef) -> RhilexResult<()> {
        let instance = K::factories(self).create(
            &def.type_tag,
            self.runtime.clone(),
            self.engine_ref(),
        )?;
        let id = def.uuid.clone();
        if let Some(old) = K::collection(self).insert(def, instance) {
            debug!("Saved {} {} over a live instance", K::KIND, id);
            let _ = self.runtime.supervisors.unregister(&id);
            old.instance.set_state(ResourceState::Stop);
            old.instance.stop().await;
        }
        Ok(())
    }
}

/// Reload on a fresh task
///
/// Boxed so the reload future has a nameable type; it eventually spawns
/// another supervisor, which would otherwise make the future types recursive.
fn spawn_reload<K: Kind>(engine: Weak<RuleEngine>, id: String) {
    tokio::spawn(reload_task::<K>(engine, id));
}

fn reload_task<K: Kind>(engine: Weak<RuleEngine>, id: String) -> BoxFuture<'static, ()> {
    async move {
        if let Some(engine) = engine.upgrade() {
            engine.reload::<K>(&id).await;
        }
    }
    .boxed()
}
