//! Persisted resource, rule and applet definitions
//!
//! The engine reads definitions at boot and again whenever the supervisor
//! reloads a resource, so an edited config takes effect on the next reload.

mod memory;
mod sqlite;

use async_trait::async_trait;
use errors::RhilexResult;
use rhilex_core::{AppletDef, ResourceDef, ResourceKind, RuleDef};
use serde::{Deserialize, Serialize};

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// One row of `m_modbus_data_points`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModbusPointRow {
    pub uuid: String,
    pub device_uuid: String,
    pub tag: String,
    pub alias: String,
    pub function: u8,
    pub slaver_id: u8,
    pub address: u16,
    pub frequency: u64,
    pub quantity: u16,
    pub data_type: String,
    pub data_order: String,
    pub weight: f32,
}

#[async_trait]
pub trait ConfigStore: Send + Sync {
    async fn get_source(&self, id: &str) -> RhilexResult<Option<ResourceDef>>;
    async fn get_device(&self, id: &str) -> RhilexResult<Option<ResourceDef>>;
    async fn get_target(&self, id: &str) -> RhilexResult<Option<ResourceDef>>;
    async fn get_cecolla(&self, id: &str) -> RhilexResult<Option<ResourceDef>>;
    async fn get_rule(&self, id: &str) -> RhilexResult<Option<RuleDef>>;
    async fn get_applet(&self, id: &str) -> RhilexResult<Option<AppletDef>>;

    /// Every stored resource of `kind`, in insertion order
    async fn list_resources(&self, kind: ResourceKind) -> RhilexResult<Vec<ResourceDef>>;
    async fn list_rules(&self) -> RhilexResult<Vec<RuleDef>>;
    async fn list_applets(&self) -> RhilexResult<Vec<AppletDef>>;

    /// Modbus point table rows of one device
    async fn device_points(&self, device_id: &str) -> RhilexResult<Vec<ModbusPointRow>>;

    /// Latest definition of a resource of any kind
    async fn fetch(&self, kind: ResourceKind, id: &str) -> RhilexResult<Option<ResourceDef>> {
        match kind {
            ResourceKind::Source => self.get_source(id).await,
            ResourceKind::Device => self.get_device(id).await,
            ResourceKind::Target => self.get_target(id).await,
            ResourceKind::Cecolla => self.get_cecolla(id).await,
            ResourceKind::Multimedia => Ok(None),
        }
    }
}
