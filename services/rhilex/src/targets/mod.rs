//! Egress resources (OutEnds)
//!
//! Scripts reach these through `data:ToMqtt`, `data:ToHttp`, `data:ToUdp`
//! and `data:ToTcp`; each call hands one payload to [`XTarget::to`].
//!
//! [`XTarget::to`]: rhilex_core::XTarget::to

mod http;
mod mqtt;
mod tcp;
mod udp;

use errors::{RhilexError, RhilexResult};
use serde::{Deserialize, Serialize};

pub use http::{HttpTarget, HttpTargetConfig};
pub use mqtt::{MqttTarget, MqttTargetConfig};
pub use tcp::TcpTarget;
pub use udp::UdpTarget;

/// How a payload is put on a raw socket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DataMode {
    /// Payload bytes unchanged
    RawString,
    /// Payload is a hex string, decoded before sending
    HexString,
    /// `{"label":<pingPacket>,"body":<payload>}` followed by CRLF
    Json,
}

/// `host`/`port` transport shared by the UDP and TCP targets
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TransportConfig {
    pub host: String,
    pub port: u16,
    /// Milliseconds
    pub timeout: u64,
    pub allow_ping: bool,
    pub ping_packet: String,
    pub data_mode: DataMode,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 6005,
            timeout: 3000,
            allow_ping: false,
            ping_packet: "rhilex".to_string(),
            data_mode: DataMode::RawString,
        }
    }
}

impl TransportConfig {
    pub fn validate(&self) -> RhilexResult<()> {
        if self.host.is_empty() {
            return Err(RhilexError::InvalidConfig {
                field: "host".to_string(),
                reason: "host is required".to_string(),
            });
        }
        if self.port == 0 {
            return Err(RhilexError::InvalidConfig {
                field: "port".to_string(),
                reason: "port must be between 1 and 65535".to_string(),
            });
        }
        Ok(())
    }

    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Script payloads arrive as JSON strings; anything else is serialised
pub(crate) fn payload_text(data: &serde_json::Value) -> String {
    match data {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

pub(crate) fn encode_payload(mode: DataMode, label: &str, data: &serde_json::Value) -> RhilexResult<Vec<u8>> {
    let text = payload_text(data);
    match mode {
        DataMode::RawString => Ok(text.into_bytes()),
        DataMode::HexString => hex::decode(text.trim()).map_err(|e| RhilexError::InvalidParameter {
            param: "data".to_string(),
            reason: format!("invalid hex payload: {}", e),
        }),
        DataMode::Json => {
            let mut bytes = serde_json::to_vec(&serde_json::json!({ "label": label, "body": text }))?;
            bytes.extend_from_slice(b"\r\n");
            Ok(bytes)
        },
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_payload_encoding_modes() {
        let data = json!("0102ff");
        assert_eq!(encode_payload(DataMode::RawString, "x", &data).unwrap(), b"0102ff");
        assert_eq!(
            encode_payload(DataMode::HexString, "x", &data).unwrap(),
            vec![0x01, 0x02, 0xFF]
        );
        assert!(encode_payload(DataMode::HexString, "x", &json!("zz")).is_err());

        let framed = encode_payload(DataMode::Json, "rhilex", &json!({"a": 1})).unwrap();
        let text = String::from_utf8(framed).unwrap();
        assert!(text.ends_with("\r\n"));
        assert!(text.contains("\"label\":\"rhilex\""));
        assert!(text.contains(r#"\"a\":1"#));
    }

    #[test]
    fn test_transport_config_defaults() {
        let config: TransportConfig = serde_json::from_value(json!({ "dataMode": "HEX_STRING" })).unwrap();
        assert_eq!(config.data_mode, DataMode::HexString);
        assert_eq!(config.endpoint(), "127.0.0.1:6005");
        assert!(TransportConfig {
            port: 0,
            ..TransportConfig::default()
        }
        .validate()
        .is_err());
    }
}
