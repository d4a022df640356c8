//! Process-level plugins declared as `[plugin.<name>]` INI sections
//!
//! Plugins live for the whole process. They are loaded once at boot, can be
//! queried through named services and are stopped with the engine.

mod mqtt_server;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use common::{IniSection, PluginSection};
use errors::{RhilexError, RhilexResult};
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{info, warn};

use crate::engine::EngineRef;

pub use mqtt_server::MqttServerPlugin;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginMeta {
    pub uuid: String,
    pub name: String,
    pub version: String,
    pub description: String,
}

#[async_trait]
pub trait XPlugin: Send + Sync {
    /// Read the plugin's INI section
    fn init(&self, section: &IniSection) -> RhilexResult<()>;

    async fn start(&self, engine: EngineRef) -> RhilexResult<()>;

    /// Run the named service with JSON arguments
    fn service(&self, name: &str, args: &serde_json::Value) -> RhilexResult<serde_json::Value>;

    async fn stop(&self);

    fn meta(&self) -> PluginMeta;
}

/// Build a plugin from its section name
fn create(name: &str) -> RhilexResult<Arc<dyn XPlugin>> {
    match name {
        "mqtt_server" => Ok(Arc::new(MqttServerPlugin::new())),
        other => Err(RhilexError::unsupported_type("plugin", other)),
    }
}

/// Running plugins keyed by their meta uuid
#[derive(Default)]
pub struct PluginManager {
    plugins: RwLock<BTreeMap<String, Arc<dyn XPlugin>>>,
}

impl PluginManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create, init and start the plugin a section declares; disabled
    /// sections are skipped
    pub async fn load(&self, section: &PluginSection, engine: EngineRef) -> RhilexResult<()> {
        if !section.enable {
            info!("Plugin {} disabled", section.name);
            return Ok(());
        }
        let plugin = create(&section.name)?;
        let meta = plugin.meta();
        if self.plugins.read().contains_key(&meta.uuid) {
            return Err(RhilexError::AlreadyExists {
                kind: "plugin".to_string(),
                id: meta.uuid,
            });
        }
        plugin.init(&section.section)?;
        plugin.start(engine).await?;
        info!("Plugin started: {} ({})", meta.name, meta.uuid);
        self.plugins.write().insert(meta.uuid, plugin);
        Ok(())
    }

    /// Load every declared plugin, logging the ones that fail
    pub async fn load_all(&self, sections: &[PluginSection], engine: &EngineRef) {
        for section in sections {
            if let Err(e) = self.load(section, engine.clone()).await {
                warn!("Load plugin {} failed: {}", section.name, e);
            }
        }
    }

    pub fn get(&self, uuid: &str) -> Option<Arc<dyn XPlugin>> {
        self.plugins.read().get(uuid).cloned()
    }

    pub fn service(
        &self,
        uuid: &str,
        name: &str,
        args: &serde_json::Value,
    ) -> RhilexResult<serde_json::Value> {
        self.get(uuid)
            .ok_or_else(|| RhilexError::not_found("plugin", uuid))?
            .service(name, args)
    }

    pub async fn stop_all(&self) {
        let plugins: Vec<_> = std::mem::take(&mut *self.plugins.write()).into_values().collect();
        for plugin in plugins {
            plugin.stop().await;
            info!("Stop plugin: {}", plugin.meta().name);
        }
    }

    pub fn metas(&self) -> serde_json::Value {
        let metas: Vec<PluginMeta> = self.plugins.read().values().map(|p| p.meta()).collect();
        serde_json::to_value(metas).unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.plugins.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.read().is_empty()
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use super::*;

    fn section(name: &str, enable: bool, entries: &[(&str, &str)]) -> PluginSection {
        let mut section = IniSection::new(format!("plugin.{}", name));
        for (k, v) in entries {
            section.insert(*k, *v);
        }
        PluginSection {
            name: name.to_string(),
            enable,
            section,
        }
    }

    #[tokio::test]
    async fn test_load_and_stop() {
        let manager = PluginManager::new();
        let mqtt = section("mqtt_server", true, &[("host", "127.0.0.1"), ("port", "0")]);
        manager.load(&mqtt, EngineRef::detached()).await.unwrap();
        assert_eq!(manager.len(), 1);
        assert!(manager.load(&mqtt, EngineRef::detached()).await.is_err());

        let metas = manager.metas();
        assert_eq!(metas[0]["uuid"], "RHILEX-MqttServer");

        manager.stop_all().await;
        assert!(manager.is_empty());
    }

    #[tokio::test]
    async fn test_disabled_and_unknown_sections() {
        let manager = PluginManager::new();
        manager
            .load(&section("mqtt_server", false, &[]), EngineRef::detached())
            .await
            .unwrap();
        assert!(manager.is_empty());

        let err = manager
            .load(&section("ngrokc", true, &[]), EngineRef::detached())
            .await
            .unwrap_err();
        assert!(matches!(err, RhilexError::UnsupportedType { .. }));
        assert!(manager.service("nope", "clients", &serde_json::Value::Null).is_err());
    }
}
