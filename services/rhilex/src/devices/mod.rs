//! Southbound devices
//!
//! - [`ModbusMaster`]: polls a Modbus slave over TCP or a serial port
//! - [`ModbusSlaver`]: serves coil and holding-register tables over TCP

mod modbus_master;
mod modbus_slaver;

use errors::{RhilexError, RhilexResult};
use rhilex_core::binding::{self, CecollaConfig};
use rhilex_core::{ResourceKind, RuntimeContext};
use serde::{Deserialize, Serialize};

use crate::engine::EngineRef;

pub use modbus_master::{group_points, ModbusMaster, ModbusMasterConfig, PointGroup, RegisterRW};
pub use modbus_slaver::{ModbusSlaver, ModbusSlaverConfig};

/// `hostConfig` block shared by network devices
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HostConfig {
    pub host: String,
    pub port: u16,
    /// Milliseconds
    pub timeout: u64,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 502,
            timeout: 3000,
        }
    }
}

pub(crate) const MODE_TCP: &str = "TCP";
pub(crate) const MODE_UART: &str = "UART";

pub(crate) fn check_mode(mode: &str) -> RhilexResult<()> {
    if mode == MODE_TCP || mode == MODE_UART {
        Ok(())
    } else {
        Err(RhilexError::InvalidConfig {
            field: "mode".to_string(),
            reason: "unsupported mode, only can be one of 'TCP' or 'UART'".to_string(),
        })
    }
}

/// Claim the cecolla named in `cecollaConfig` for `device_id`
pub(crate) fn bind_cecolla(
    runtime: &RuntimeContext,
    config: &CecollaConfig,
    device_id: &str,
) -> RhilexResult<()> {
    match config.target() {
        Some(cecolla_id) => binding::bind(&runtime.cache, cecolla_id, device_id),
        None => Ok(()),
    }
}

pub(crate) fn unbind_cecolla(runtime: &RuntimeContext, config: &CecollaConfig, device_id: &str) {
    if let Some(cecolla_id) = config.target() {
        binding::unbind(&runtime.cache, cecolla_id, device_id);
    }
}

/// Display name of a loaded device, falling back to its id
pub(crate) fn device_name(engine: &EngineRef, device_id: &str) -> String {
    engine
        .get()
        .ok()
        .and_then(|e| e.resource_def(ResourceKind::Device, device_id))
        .map_or_else(|| device_id.to_string(), |def| def.name)
}
