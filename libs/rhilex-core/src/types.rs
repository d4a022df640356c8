//! Resource kinds and the type tags registered for each kind

use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Source,
    Device,
    Target,
    Cecolla,
    Multimedia,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Source => "source",
            Self::Device => "device",
            Self::Target => "target",
            Self::Cecolla => "cecolla",
            Self::Multimedia => "multimedia",
        }
    }

    /// Bus topic announcing that a resource of this kind went DOWN
    pub fn down_topic(&self, id: &str) -> String {
        format!("event.{}.down.{}", self.as_str(), id)
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub mod source_types {
    pub const GENERIC_MQTT_SERVER: &str = "GENERIC_MQTT_SERVER";
    pub const GENERIC_MQTT: &str = "GENERIC_MQTT";
    pub const INTERNAL_EVENT: &str = "INTERNAL_EVENT";
    pub const RHILEX_UDP: &str = "RHILEX_UDP";
    pub const HTTP: &str = "HTTP";
}

pub mod device_types {
    pub const GENERIC_MODBUS_MASTER: &str = "GENERIC_MODBUS_MASTER";
    pub const GENERIC_MODBUS_SLAVER: &str = "GENERIC_MODBUS_SLAVER";
}

pub mod target_types {
    pub const MQTT: &str = "MQTT";
    pub const HTTP: &str = "HTTP";
    pub const UDP_TARGET: &str = "UDP_TARGET";
    pub const TCP_TRANSPORT: &str = "TCP_TRANSPORT";
}

pub mod cecolla_types {
    pub const ITHINGS_IOTHUB_CEC: &str = "ITHINGS_IOTHUB_CEC";
    pub const TENCENT_IOTHUB_CEC: &str = "TENCENT_IOTHUB_CEC";
}
