//! rhilex basic library
//!
//! Provides functions shared by every gateway crate:
//! - logging bootstrap
//! - INI parsing and the gateway configuration
//! - shutdown signal handling
//! - process metrics for the snapshot dump
//! - time helpers

pub mod config;
pub mod ini;
pub mod logging;
pub mod shutdown;
pub mod system_metrics;
pub mod time;

pub use config::{bind_config, LoadedConfig, PluginSection, RhilexConfig, TransceiverConfig};
pub use ini::{Ini, IniSection};
pub use system_metrics::SystemMetrics;

// Re-export common dependencies
pub use serde;
pub use serde_json;
pub use tokio;
