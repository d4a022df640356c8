//! Device <-> cecolla binding
//!
//! Bindings live in the `__CecollaBinding` cache slot as
//! `cecolla id -> device id`; a cecolla can serve one device at a time.

use errors::{RhilexError, RhilexResult};
use rhilex_cache::{CacheValue, PointCache, CECOLLA_BINDING_SLOT};
use serde::{Deserialize, Serialize};

/// `cecollaConfig` block of a device config
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CecollaConfig {
    pub enable: bool,
    pub enable_create_schema: bool,
    pub cecolla_id: String,
}

impl CecollaConfig {
    /// The bound cecolla id when binding is enabled
    pub fn target(&self) -> Option<&str> {
        (self.enable && !self.cecolla_id.is_empty()).then_some(self.cecolla_id.as_str())
    }
}

pub fn bound_device(cache: &PointCache, cecolla_id: &str) -> Option<String> {
    let value = cache.get(CECOLLA_BINDING_SLOT, cecolla_id).value;
    (!value.is_empty()).then_some(value)
}

/// Bind `device_id` to `cecolla_id`, failing when another device holds it
///
/// The owner check and the write happen under the binding slot's lock.
pub fn bind(cache: &PointCache, cecolla_id: &str, device_id: &str) -> RhilexResult<()> {
    cache.ensure_slot(CECOLLA_BINDING_SLOT);
    cache
        .with_slot_mut(CECOLLA_BINDING_SLOT, |rows| match rows.get(cecolla_id) {
            Some(owner) if !owner.value.is_empty() && owner.value != device_id => {
                Err(RhilexError::BindingConflict {
                    cecolla: cecolla_id.to_string(),
                    device: owner.value.clone(),
                })
            },
            _ => {
                rows.insert(cecolla_id.to_string(), CacheValue::ok(cecolla_id, device_id));
                Ok(())
            },
        })
        .unwrap_or_else(|| Err(RhilexError::not_found("cache slot", CECOLLA_BINDING_SLOT)))
}

/// Drop the binding if it still belongs to `device_id`
pub fn unbind(cache: &PointCache, cecolla_id: &str, device_id: &str) {
    cache.with_slot_mut(CECOLLA_BINDING_SLOT, |rows| {
        if rows.get(cecolla_id).is_some_and(|owner| owner.value == device_id) {
            rows.remove(cecolla_id);
        }
    });
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use super::*;

    #[test]
    fn test_second_device_is_rejected() {
        let cache = PointCache::new();
        bind(&cache, "C1", "devA").unwrap();
        bind(&cache, "C1", "devA").unwrap();

        let err = bind(&cache, "C1", "devB").unwrap_err();
        assert!(err.to_string().contains("Cecolla already bind to device"));
        assert_eq!(bound_device(&cache, "C1").as_deref(), Some("devA"));

        unbind(&cache, "C1", "devB");
        assert!(bound_device(&cache, "C1").is_some());
        unbind(&cache, "C1", "devA");
        bind(&cache, "C1", "devB").unwrap();
    }

    #[test]
    fn test_concurrent_binds_have_one_winner() {
        use std::sync::{Arc, Barrier};

        for round in 0..200 {
            let cache = Arc::new(PointCache::new());
            let barrier = Arc::new(Barrier::new(2));
            let cecolla = format!("C{}", round);
            let handles: Vec<_> = ["devA", "devB"]
                .into_iter()
                .map(|device| {
                    let cache = Arc::clone(&cache);
                    let barrier = Arc::clone(&barrier);
                    let cecolla = cecolla.clone();
                    std::thread::spawn(move || {
                        barrier.wait();
                        bind(&cache, &cecolla, device).is_ok()
                    })
                })
                .collect();
            let wins = handles
                .into_iter()
                .map(|h| h.join().unwrap())
                .filter(|ok| *ok)
                .count();
            assert_eq!(wins, 1, "round {}", round);
            assert!(bound_device(&cache, &cecolla).is_some());
        }
    }

    #[test]
    fn test_cecolla_config_target() {
        let cfg: CecollaConfig =
            serde_json::from_value(serde_json::json!({"enable": true, "cecollaId": "C1"})).unwrap();
        assert_eq!(cfg.target(), Some("C1"));
        assert_eq!(CecollaConfig::default().target(), None);
    }
}
