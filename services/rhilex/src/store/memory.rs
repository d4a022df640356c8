//! In-process store used by tests and when no database is configured

use async_trait::async_trait;
use errors::RhilexResult;
use parking_lot::RwLock;
use rhilex_core::{AppletDef, ResourceDef, ResourceKind, RuleDef};

use super::{ConfigStore, ModbusPointRow};

#[derive(Default)]
struct Tables {
    sources: Vec<ResourceDef>,
    devices: Vec<ResourceDef>,
    targets: Vec<ResourceDef>,
    cecollas: Vec<ResourceDef>,
    rules: Vec<RuleDef>,
    applets: Vec<AppletDef>,
    points: Vec<ModbusPointRow>,
}

impl Tables {
    fn resources(&self, kind: ResourceKind) -> &[ResourceDef] {
        match kind {
            ResourceKind::Source => &self.sources,
            ResourceKind::Device => &self.devices,
            ResourceKind::Target => &self.targets,
            ResourceKind::Cecolla => &self.cecollas,
            ResourceKind::Multimedia => &[],
        }
    }

    fn resources_mut(&mut self, kind: ResourceKind) -> Option<&mut Vec<ResourceDef>> {
        match kind {
            ResourceKind::Source => Some(&mut self.sources),
            ResourceKind::Device => Some(&mut self.devices),
            ResourceKind::Target => Some(&mut self.targets),
            ResourceKind::Cecolla => Some(&mut self.cecollas),
            ResourceKind::Multimedia => None,
        }
    }
}

fn upsert<T>(rows: &mut Vec<T>, row: T, same: impl Fn(&T) -> bool) {
    match rows.iter_mut().find(|r| same(r)) {
        Some(slot) => *slot = row,
        None => rows.push(row),
    }
}

#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_resource(&self, kind: ResourceKind, def: ResourceDef) {
        let mut tables = self.tables.write();
        if let Some(rows) = tables.resources_mut(kind) {
            let id = def.uuid.clone();
            upsert(rows, def, |r| r.uuid == id);
        }
    }

    pub fn delete_resource(&self, kind: ResourceKind, id: &str) {
        if let Some(rows) = self.tables.write().resources_mut(kind) {
            rows.retain(|r| r.uuid != id);
        }
    }

    pub fn put_rule(&self, def: RuleDef) {
        let id = def.uuid.clone();
        upsert(&mut self.tables.write().rules, def, |r| r.uuid == id);
    }

    pub fn put_applet(&self, def: AppletDef) {
        let id = def.uuid.clone();
        upsert(&mut self.tables.write().applets, def, |r| r.uuid == id);
    }

    pub fn put_point(&self, row: ModbusPointRow) {
        let id = row.uuid.clone();
        upsert(&mut self.tables.write().points, row, |r| r.uuid == id);
    }

    fn find(&self, kind: ResourceKind, id: &str) -> Option<ResourceDef> {
        self.tables
            .read()
            .resources(kind)
            .iter()
            .find(|r| r.uuid == id)
            .cloned()
    }
}

#[async_trait]
impl ConfigStore for MemoryStore {
    async fn get_source(&self, id: &str) -> RhilexResult<Option<ResourceDef>> {
        Ok(self.find(ResourceKind::Source, id))
    }

    async fn get_device(&self, id: &str) -> RhilexResult<Option<ResourceDef>> {
        Ok(self.find(ResourceKind::Device, id))
    }

    async fn get_target(&self, id: &str) -> RhilexResult<Option<ResourceDef>> {
        Ok(self.find(ResourceKind::Target, id))
    }

    async fn get_cecolla(&self, id: &str) -> RhilexResult<Option<ResourceDef>> {
        Ok(self.find(ResourceKind::Cecolla, id))
    }

    async fn get_rule(&self, id: &str) -> RhilexResult<Option<RuleDef>> {
        Ok(self.tables.read().rules.iter().find(|r| r.uuid == id).cloned())
    }

    async fn get_applet(&self, id: &str) -> RhilexResult<Option<AppletDef>> {
        Ok(self.tables.read().applets.iter().find(|a| a.uuid == id).cloned())
    }

    async fn list_resources(&self, kind: ResourceKind) -> RhilexResult<Vec<ResourceDef>> {
        Ok(self.tables.read().resources(kind).to_vec())
    }

    async fn list_rules(&self) -> RhilexResult<Vec<RuleDef>> {
        Ok(self.tables.read().rules.clone())
    }

    async fn list_applets(&self) -> RhilexResult<Vec<AppletDef>> {
        Ok(self.tables.read().applets.clone())
    }

    async fn device_points(&self, device_id: &str) -> RhilexResult<Vec<ModbusPointRow>> {
        Ok(self
            .tables
            .read()
            .points
            .iter()
            .filter(|p| p.device_uuid == device_id)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use super::*;
    use rhilex_core::types::device_types;

    #[tokio::test]
    async fn test_put_replaces_by_uuid() {
        let store = MemoryStore::new();
        let mut def = ResourceDef::new(
            "d1",
            "meter",
            device_types::GENERIC_MODBUS_MASTER,
            serde_json::json!({}),
        );
        store.put_resource(ResourceKind::Device, def.clone());
        def.name = "meter-2".into();
        store.put_resource(ResourceKind::Device, def);

        let all = store.list_resources(ResourceKind::Device).await.unwrap();
        assert_eq!(all.len(), 1);
        let fetched = store.fetch(ResourceKind::Device, "d1").await.unwrap().unwrap();
        assert_eq!(fetched.name, "meter-2");
        assert!(store.get_source("d1").await.unwrap().is_none());

        store.delete_resource(ResourceKind::Device, "d1");
        assert!(store.get_device("d1").await.unwrap().is_none());
    }
}
