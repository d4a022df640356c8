//! Shared in-memory state for the rhilex gateway
//!
//! - [`PointCache`]: last reading, status and error for every point
//! - [`KvStore`]: bounded key/value store with TTL
//! - [`DataCenter`]: per-table row rings

pub mod datacenter;
pub mod intercache;
pub mod kv;

pub use datacenter::DataCenter;
pub use intercache::{
    CacheValue, PointCache, CECOLLA_BINDING_SLOT, DEFAULT_RULE_ENGINE_SLOT,
    DEVICE_CONFIG_MAP_SLOT,
};
pub use kv::KvStore;
