//! Hardware port manager
//!
//! Serial ports are exclusive: a device marks the port busy while it runs
//! and frees it on stop.

use std::fmt;

use dashmap::DashMap;
use errors::{RhilexError, RhilexResult};
use serde::{Deserialize, Serialize};

pub const OCCUPY_DEVICE: &str = "DEVICE";
pub const OCCUPY_OS: &str = "OS";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UartConfig {
    /// Milliseconds
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    pub uart: String,
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    #[serde(default = "default_data_bits")]
    pub data_bits: u8,
    #[serde(default = "default_parity")]
    pub parity: String,
    #[serde(default = "default_stop_bits")]
    pub stop_bits: u8,
}

fn default_timeout() -> u64 {
    3000
}
fn default_baud_rate() -> u32 {
    9600
}
fn default_data_bits() -> u8 {
    8
}
fn default_parity() -> String {
    "N".to_string()
}
fn default_stop_bits() -> u8 {
    1
}

impl Default for UartConfig {
    fn default() -> Self {
        Self {
            timeout: default_timeout(),
            uart: String::new(),
            baud_rate: default_baud_rate(),
            data_bits: default_data_bits(),
            parity: default_parity(),
            stop_bits: default_stop_bits(),
        }
    }
}

/// Who holds a port
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UartOccupy {
    pub uuid: String,
    /// `DEVICE`, `OS`, ...
    #[serde(rename = "type")]
    pub kind: String,
    pub name: String,
}

impl UartOccupy {
    pub fn device(uuid: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            uuid: uuid.into(),
            kind: OCCUPY_DEVICE.to_string(),
            name: name.into(),
        }
    }

    fn vacant() -> Self {
        Self {
            uuid: "-".to_string(),
            kind: "-".to_string(),
            name: "-".to_string(),
        }
    }
}

impl fmt::Display for UartOccupy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({}), type {}", self.name, self.uuid, self.kind)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemUart {
    pub uuid: String,
    pub name: String,
    #[serde(default)]
    pub alias: String,
    #[serde(default)]
    pub busy: bool,
    #[serde(default)]
    pub occupy_by: UartOccupy,
    /// `UART`, `USB`, `FD`
    #[serde(rename = "type", default = "default_port_type")]
    pub kind: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub config: UartConfig,
}

fn default_port_type() -> String {
    "UART".to_string()
}

impl SystemUart {
    pub fn uart(uuid: impl Into<String>, config: UartConfig) -> Self {
        let uuid = uuid.into();
        Self {
            name: uuid.clone(),
            uuid,
            alias: String::new(),
            busy: false,
            occupy_by: UartOccupy::vacant(),
            kind: default_port_type(),
            description: String::new(),
            config,
        }
    }
}

#[derive(Debug, Default)]
pub struct HwPortManager {
    ports: DashMap<String, SystemUart>,
}

impl HwPortManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a port definition
    ///
    /// Returns the id of a device that held the replaced port; that device
    /// must be taken DOWN so it reopens the port with the new settings.
    pub fn register(&self, port: SystemUart) -> Option<String> {
        let displaced = self.ports.get(&port.uuid).and_then(|old| {
            (old.busy && old.occupy_by.kind == OCCUPY_DEVICE).then(|| old.occupy_by.uuid.clone())
        });
        let mut port = port;
        if let Some(owner) = &displaced {
            // the displaced device gives the port up when it goes down
            port.busy = false;
            port.occupy_by = UartOccupy::vacant();
            tracing::info!("Port {} refreshed, releasing device {}", port.uuid, owner);
        }
        self.ports.insert(port.uuid.clone(), port);
        displaced
    }

    /// Same as [`register`](Self::register), kept for the refresh call sites
    pub fn refresh(&self, port: SystemUart) -> Option<String> {
        self.register(port)
    }

    /// Remove the port, returning the device that held it
    pub fn remove(&self, uuid: &str) -> Option<String> {
        self.ports.remove(uuid).and_then(|(_, old)| {
            (old.busy && old.occupy_by.kind == OCCUPY_DEVICE).then_some(old.occupy_by.uuid)
        })
    }

    pub fn get(&self, uuid: &str) -> RhilexResult<SystemUart> {
        self.ports
            .get(uuid)
            .map(|p| p.clone())
            .ok_or_else(|| RhilexError::not_found("interface", uuid))
    }

    /// Mark the port held by `occupy`; re-acquiring by the same owner is allowed
    pub fn set_busy(&self, uuid: &str, occupy: UartOccupy) -> RhilexResult<()> {
        let mut port = self
            .ports
            .get_mut(uuid)
            .ok_or_else(|| RhilexError::not_found("interface", uuid))?;
        if port.busy && port.occupy_by.uuid != occupy.uuid {
            return Err(RhilexError::PortBusy {
                port: uuid.to_string(),
                owner: port.occupy_by.to_string(),
            });
        }
        port.busy = true;
        port.occupy_by = occupy;
        Ok(())
    }

    /// Release a port held by a device. Ports held by the OS stay busy.
    pub fn free(&self, uuid: &str) {
        if let Some(mut port) = self.ports.get_mut(uuid) {
            if port.occupy_by.kind == OCCUPY_DEVICE {
                port.busy = false;
                port.occupy_by = UartOccupy::vacant();
            }
        }
    }

    pub fn all(&self) -> Vec<SystemUart> {
        let mut ports: Vec<SystemUart> = self.ports.iter().map(|p| p.value().clone()).collect();
        ports.sort_by(|a, b| a.uuid.cmp(&b.uuid));
        ports
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use super::*;

    fn manager() -> HwPortManager {
        let m = HwPortManager::new();
        m.register(SystemUart::uart(
            "COM1",
            UartConfig {
                uart: "/dev/ttyS1".into(),
                ..Default::default()
            },
        ));
        m
    }

    #[test]
    fn test_get_unknown_port() {
        let err = manager().get("COM9").unwrap_err();
        assert_eq!(err.to_string(), "interface not exists:COM9");
    }

    #[test]
    fn test_port_is_exclusive() {
        let m = manager();
        m.set_busy("COM1", UartOccupy::device("d1", "meter")).unwrap();
        // same owner may re-acquire after a reload
        m.set_busy("COM1", UartOccupy::device("d1", "meter")).unwrap();

        let err = m.set_busy("COM1", UartOccupy::device("d2", "other")).unwrap_err();
        assert!(err.to_string().starts_with("UART busy, occupied by meter(d1)"));

        m.free("COM1");
        m.set_busy("COM1", UartOccupy::device("d2", "other")).unwrap();
        assert_eq!(m.get("COM1").unwrap().occupy_by.uuid, "d2");
    }

    #[test]
    fn test_os_hold_survives_free() {
        let m = manager();
        m.set_busy(
            "COM1",
            UartOccupy {
                uuid: "linux".into(),
                kind: OCCUPY_OS.into(),
                name: "linux".into(),
            },
        )
        .unwrap();
        m.free("COM1");
        assert!(m.get("COM1").unwrap().busy);
    }

    #[test]
    fn test_refresh_reports_displaced_device() {
        let m = manager();
        m.set_busy("COM1", UartOccupy::device("d1", "meter")).unwrap();
        let displaced = m.refresh(SystemUart::uart("COM1", UartConfig::default()));
        assert_eq!(displaced.as_deref(), Some("d1"));
        assert!(!m.get("COM1").unwrap().busy);
        assert_eq!(m.refresh(SystemUart::uart("COM1", UartConfig::default())), None);
    }

    #[test]
    fn test_uart_config_defaults() {
        let cfg: UartConfig = serde_json::from_value(serde_json::json!({"uart": "/dev/ttyUSB0"})).unwrap();
        assert_eq!(cfg.baud_rate, 9600);
        assert_eq!(cfg.parity, "N");
        assert_eq!(cfg.timeout, 3000);
    }
}
