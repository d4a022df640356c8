//! Type tag -> factory tables
//!
//! One table per resource kind so a device tag can never instantiate a
//! source. Built-in types are registered by [`TypeRegistry::with_builtin`];
//! tests add their own fakes through the `register_*` methods.

use std::collections::BTreeMap;
use std::sync::{Arc, Weak};

use errors::{RhilexError, RhilexResult};
use parking_lot::RwLock;
use rhilex_core::types::{cecolla_types, device_types, source_types, target_types};
use rhilex_core::{EngineHandle, ResourceKind, RuntimeContext, XCecolla, XDevice, XSource, XTarget};

use crate::{cecolla, devices, sources, targets};

use super::RuleEngine;

/// Weak back-reference handed to every resource
///
/// Resources live inside the engine, so they must not keep it alive.
#[derive(Clone)]
pub struct EngineRef(Weak<dyn EngineHandle>);

impl EngineRef {
    pub fn new(engine: Weak<dyn EngineHandle>) -> Self {
        Self(engine)
    }

    /// A reference that never upgrades; for resources built outside an engine
    pub fn detached() -> Self {
        let engine: Weak<dyn EngineHandle> = Weak::<RuleEngine>::new();
        Self(engine)
    }

    pub fn get(&self) -> RhilexResult<Arc<dyn EngineHandle>> {
        self.0
            .upgrade()
            .ok_or_else(|| RhilexError::runtime("rule engine not available"))
    }
}

impl std::fmt::Debug for EngineRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineRef")
            .field("alive", &(self.0.strong_count() > 0))
            .finish()
    }
}

pub type Factory<T> = Arc<dyn Fn(RuntimeContext, EngineRef) -> Arc<T> + Send + Sync>;

pub struct Factories<T: ?Sized> {
    kind: ResourceKind,
    table: RwLock<BTreeMap<String, Factory<T>>>,
}

impl<T: ?Sized> Factories<T> {
    fn new(kind: ResourceKind) -> Self {
        Self {
            kind,
            table: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn register<F>(&self, type_tag: &str, factory: F)
    where
        F: Fn(RuntimeContext, EngineRef) -> Arc<T> + Send + Sync + 'static,
    {
        self.table
            .write()
            .insert(type_tag.to_string(), Arc::new(factory));
    }

    pub fn contains(&self, type_tag: &str) -> bool {
        self.table.read().contains_key(type_tag)
    }

    pub fn check(&self, type_tag: &str) -> RhilexResult<()> {
        if self.contains(type_tag) {
            Ok(())
        } else {
            Err(RhilexError::unsupported_type(self.kind.as_str(), type_tag))
        }
    }

    pub fn create(
        &self,
        type_tag: &str,
        runtime: RuntimeContext,
        engine: EngineRef,
    ) -> RhilexResult<Arc<T>> {
        let factory = self
            .table
            .read()
            .get(type_tag)
            .cloned()
            .ok_or_else(|| RhilexError::unsupported_type(self.kind.as_str(), type_tag))?;
        Ok(factory(runtime, engine))
    }

    pub fn tags(&self) -> Vec<String> {
        self.table.read().keys().cloned().collect()
    }
}

pub struct TypeRegistry {
    pub sources: Factories<dyn XSource>,
    pub devices: Factories<dyn XDevice>,
    pub targets: Factories<dyn XTarget>,
    pub cecollas: Factories<dyn XCecolla>,
}

impl TypeRegistry {
    /// Empty tables
    pub fn new() -> Self {
        Self {
            sources: Factories::new(ResourceKind::Source),
            devices: Factories::new(ResourceKind::Device),
            targets: Factories::new(ResourceKind::Target),
            cecollas: Factories::new(ResourceKind::Cecolla),
        }
    }

    /// Tables holding every type shipped with the gateway
    pub fn with_builtin() -> Self {
        let registry = Self::new();

        registry
            .sources
            .register(source_types::GENERIC_MQTT_SERVER, |rt, engine| {
                Arc::new(sources::MqttServerSource::new(rt, engine))
            });
        registry.sources.register(source_types::GENERIC_MQTT, |rt, engine| {
            Arc::new(sources::MqttSource::new(rt, engine))
        });
        registry.sources.register(source_types::INTERNAL_EVENT, |rt, engine| {
            Arc::new(sources::InternalEventSource::new(rt, engine))
        });
        registry.sources.register(source_types::RHILEX_UDP, |rt, engine| {
            Arc::new(sources::UdpSource::new(rt, engine))
        });
        registry.sources.register(source_types::HTTP, |rt, engine| {
            Arc::new(sources::HttpSource::new(rt, engine))
        });

        registry
            .devices
            .register(device_types::GENERIC_MODBUS_MASTER, |rt, engine| {
                Arc::new(devices::ModbusMaster::new(rt, engine))
            });
        registry
            .devices
            .register(device_types::GENERIC_MODBUS_SLAVER, |rt, engine| {
                Arc::new(devices::ModbusSlaver::new(rt, engine))
            });

        registry.targets.register(target_types::MQTT, |rt, _| {
            Arc::new(targets::MqttTarget::new(rt))
        });
        registry.targets.register(target_types::HTTP, |rt, _| {
            Arc::new(targets::HttpTarget::new(rt))
        });
        registry.targets.register(target_types::UDP_TARGET, |rt, _| {
            Arc::new(targets::UdpTarget::new(rt))
        });
        registry.targets.register(target_types::TCP_TRANSPORT, |rt, _| {
            Arc::new(targets::TcpTarget::new(rt))
        });

        registry
            .cecollas
            .register(cecolla_types::ITHINGS_IOTHUB_CEC, |rt, engine| {
                Arc::new(cecolla::IthingsCecolla::new(rt, engine))
            });
        registry
            .cecollas
            .register(cecolla_types::TENCENT_IOTHUB_CEC, |rt, engine| {
                Arc::new(cecolla::TencentCecolla::new(rt, engine))
            });

        registry
    }
}

impl Default for TypeRegistry {
    fn default() -> Self {
        Self::with_builtin()
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_tables_refuse_cross_wiring() {
        let registry = TypeRegistry::with_builtin();
        assert!(registry.devices.check(device_types::GENERIC_MODBUS_MASTER).is_ok());

        let err = registry
            .sources
            .check(device_types::GENERIC_MODBUS_MASTER)
            .unwrap_err();
        assert_eq!(err.to_string(), "unsupported source type:GENERIC_MODBUS_MASTER");
        assert!(registry.targets.check(source_types::GENERIC_MQTT).is_err());
        assert_eq!(registry.cecollas.tags().len(), 2);
    }

    #[test]
    fn test_detached_ref_never_upgrades() {
        let engine = EngineRef::detached();
        assert!(engine.get().is_err());
    }
}
