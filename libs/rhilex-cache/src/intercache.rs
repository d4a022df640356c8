//! Point cache
//!
//! Two-level mapping `slot -> (point_id -> CacheValue)`. Every slot carries its
//! own lock so writers on different resources never contend, and slot
//! registration order is kept for listing.

use std::collections::BTreeMap;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// Slot holding the last Init/Start failure of each resource, keyed by resource id
pub const DEFAULT_RULE_ENGINE_SLOT: &str = "__DefaultRuleEngine";
/// Slot holding serialized device configs for script lookups
pub const DEVICE_CONFIG_MAP_SLOT: &str = "__DeviceConfigMap";
/// Slot mapping cecolla id to the device that owns it
pub const CECOLLA_BINDING_SLOT: &str = "__CecollaBinding";

pub const STATUS_ERROR: u8 = 0;
pub const STATUS_OK: u8 = 1;

/// One row of the point cache
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheValue {
    pub uuid: String,
    /// 1 ok, 0 error (see `err_msg`)
    pub status: u8,
    pub err_msg: String,
    /// Milliseconds since the UNIX epoch
    pub last_fetch_time: u64,
    pub value: String,
}

impl CacheValue {
    pub fn ok(uuid: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            uuid: uuid.into(),
            status: STATUS_OK,
            err_msg: String::new(),
            last_fetch_time: common::time::now_ms(),
            value: value.into(),
        }
    }

    pub fn error(uuid: impl Into<String>, err: impl Into<String>) -> Self {
        Self {
            uuid: uuid.into(),
            status: STATUS_ERROR,
            err_msg: err.into(),
            last_fetch_time: common::time::now_ms(),
            value: String::new(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == STATUS_OK
    }
}

type Slot = Arc<RwLock<BTreeMap<String, CacheValue>>>;

/// Process-wide point cache shared through the runtime context
#[derive(Default)]
pub struct PointCache {
    slots: DashMap<String, Slot>,
    order: RwLock<Vec<String>>,
}

impl PointCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create (or reset to empty) a slot
    pub fn register_slot(&self, slot: &str) {
        self.slots
            .insert(slot.to_string(), Arc::new(RwLock::new(BTreeMap::new())));
        let mut order = self.order.write();
        if !order.iter().any(|s| s == slot) {
            order.push(slot.to_string());
        }
    }

    /// Create a slot unless it already exists; existing rows are kept
    pub fn ensure_slot(&self, slot: &str) {
        if let dashmap::mapref::entry::Entry::Vacant(e) = self.slots.entry(slot.to_string()) {
            e.insert(Arc::new(RwLock::new(BTreeMap::new())));
            let mut order = self.order.write();
            if !order.iter().any(|s| s == slot) {
                order.push(slot.to_string());
            }
        }
    }

    /// Run `f` over a slot's rows with the slot write lock held, so a
    /// read-check-write sequence is atomic. `None` when the slot is unknown.
    pub fn with_slot_mut<R>(
        &self,
        slot: &str,
        f: impl FnOnce(&mut BTreeMap<String, CacheValue>) -> R,
    ) -> Option<R> {
        let rows = self.slot(slot)?;
        let mut guard = rows.write();
        Some(f(&mut guard))
    }

    /// Drop a slot and every row in it
    pub fn unregister_slot(&self, slot: &str) {
        self.slots.remove(slot);
        self.order.write().retain(|s| s != slot);
    }

    pub fn contains_slot(&self, slot: &str) -> bool {
        self.slots.contains_key(slot)
    }

    fn slot(&self, slot: &str) -> Option<Slot> {
        self.slots.get(slot).map(|s| Arc::clone(s.value()))
    }

    /// Write a row; unknown slots are ignored since the owner already tore down
    pub fn set(&self, slot: &str, point: &str, value: CacheValue) {
        if let Some(rows) = self.slot(slot) {
            rows.write().insert(point.to_string(), value);
        }
    }

    /// Read a row, zero-valued when the slot or point is unknown
    pub fn get(&self, slot: &str, point: &str) -> CacheValue {
        self.slot(slot)
            .and_then(|rows| rows.read().get(point).cloned())
            .unwrap_or_default()
    }

    pub fn delete(&self, slot: &str, point: &str) {
        if let Some(rows) = self.slot(slot) {
            rows.write().remove(point);
        }
    }

    /// Snapshot of one slot's rows ordered by point id
    pub fn get_slot(&self, slot: &str) -> Option<Vec<CacheValue>> {
        self.slot(slot)
            .map(|rows| rows.read().values().cloned().collect())
    }

    /// Every slot with its rows, in registration order
    pub fn list(&self) -> Vec<(String, Vec<CacheValue>)> {
        let order = self.order.read().clone();
        order
            .into_iter()
            .filter_map(|name| self.get_slot(&name).map(|rows| (name, rows)))
            .collect()
    }

    /// Number of registered slots
    pub fn size(&self) -> usize {
        self.slots.len()
    }

    /// Drop every slot
    pub fn flush(&self) {
        self.slots.clear();
        self.order.write().clear();
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use super::*;

    #[test]
    fn test_set_get_in_registered_slot() {
        let cache = PointCache::new();
        cache.register_slot("dev1");
        cache.set("dev1", "p1", CacheValue::ok("p1", "42"));

        let row = cache.get("dev1", "p1");
        assert_eq!(row.status, STATUS_OK);
        assert_eq!(row.value, "42");
        assert!(row.err_msg.is_empty());
        assert!(row.last_fetch_time > 0);
    }

    #[test]
    fn test_unknown_slot_set_is_noop() {
        let cache = PointCache::new();
        cache.set("ghost", "p1", CacheValue::ok("p1", "1"));
        assert_eq!(cache.size(), 0);
        assert_eq!(cache.get("ghost", "p1"), CacheValue::default());
    }

    #[test]
    fn test_reregister_clears_stale_rows() {
        let cache = PointCache::new();
        cache.register_slot("dev1");
        cache.set("dev1", "p1", CacheValue::ok("p1", "1"));
        cache.register_slot("dev1");
        assert_eq!(cache.get_slot("dev1").unwrap().len(), 0);
        assert_eq!(cache.list().len(), 1);
    }

    #[test]
    fn test_list_keeps_registration_order() {
        let cache = PointCache::new();
        for name in ["c", "a", "b"] {
            cache.register_slot(name);
        }
        let names: Vec<String> = cache.list().into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["c", "a", "b"]);

        cache.unregister_slot("a");
        let names: Vec<String> = cache.list().into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["c", "b"]);
    }

    #[test]
    fn test_delete_and_flush() {
        let cache = PointCache::new();
        cache.register_slot("dev1");
        cache.set("dev1", "p1", CacheValue::error("p1", "timeout"));
        assert!(!cache.get("dev1", "p1").is_ok());
        cache.delete("dev1", "p1");
        assert_eq!(cache.get("dev1", "p1").uuid, "");

        cache.flush();
        assert_eq!(cache.size(), 0);
        assert!(cache.list().is_empty());
    }

    #[test]
    fn test_concurrent_writers_on_separate_slots() {
        let cache = Arc::new(PointCache::new());
        for i in 0..4 {
            cache.register_slot(&format!("dev{}", i));
        }
        let handles: Vec<_> = (0..4)
            .map(|i| {
                let cache = Arc::clone(&cache);
                std::thread::spawn(move || {
                    let slot = format!("dev{}", i);
                    for p in 0..100 {
                        cache.set(&slot, &format!("p{}", p), CacheValue::ok("", p.to_string()));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        for i in 0..4 {
            assert_eq!(cache.get_slot(&format!("dev{}", i)).unwrap().len(), 100);
        }
    }
}
