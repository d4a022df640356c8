//! Persisted definitions of resources, rules and applets

use errors::{RhilexError, RhilexResult};
use serde::{Deserialize, Serialize};

use crate::state::RuleStatus;

/// Definition of a source, device, target or cecolla
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceDef {
    pub uuid: String,
    pub name: String,
    #[serde(rename = "type")]
    pub type_tag: String,
    #[serde(default)]
    pub config: serde_json::Value,
    #[serde(default)]
    pub description: String,
    /// Applet script a cecolla runs for every downlink message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
}

impl ResourceDef {
    pub fn new(
        uuid: impl Into<String>,
        name: impl Into<String>,
        type_tag: impl Into<String>,
        config: serde_json::Value,
    ) -> Self {
        Self {
            uuid: uuid.into(),
            name: name.into(),
            type_tag: type_tag.into(),
            config,
            description: String::new(),
            action: None,
        }
    }
}

/// A scripted pipeline bound to one source or one device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleDef {
    pub uuid: String,
    pub name: String,
    #[serde(default)]
    pub from_source: Option<String>,
    #[serde(default)]
    pub from_device: Option<String>,
    pub success: String,
    pub actions: String,
    pub failed: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_rule_status")]
    pub status: RuleStatus,
}

fn default_rule_status() -> RuleStatus {
    RuleStatus::Running
}

impl RuleDef {
    /// Exactly one of `from_source` / `from_device` must name a resource
    pub fn validate(&self) -> RhilexResult<()> {
        let source = self.from_source.as_deref().filter(|s| !s.is_empty());
        let device = self.from_device.as_deref().filter(|s| !s.is_empty());
        match (source, device) {
            (Some(_), None) | (None, Some(_)) => Ok(()),
            (None, None) => Err(RhilexError::Validation(format!(
                "rule {} must bind a source or a device",
                self.uuid
            ))),
            (Some(_), Some(_)) => Err(RhilexError::Validation(format!(
                "rule {} can not bind both a source and a device",
                self.uuid
            ))),
        }
    }

    /// Id of the resource this rule listens to
    pub fn bound_resource(&self) -> Option<&str> {
        self.from_source
            .as_deref()
            .filter(|s| !s.is_empty())
            .or_else(|| self.from_device.as_deref().filter(|s| !s.is_empty()))
    }
}

/// Long-lived user script with a `Main(uuid, env)` entry point
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppletDef {
    pub uuid: String,
    pub name: String,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub auto_start: bool,
    pub script: String,
    #[serde(default)]
    pub description: String,
}

fn default_version() -> String {
    "v1.0.0".to_string()
}

/// Register write request passed from the `modbus` script namespace to a
/// Modbus device's `on_write`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterWrite {
    pub function: u8,
    pub slaver_id: u8,
    pub address: u16,
    #[serde(default)]
    pub quantity: u16,
    /// Hex encoded payload
    pub values: String,
}

impl RegisterWrite {
    pub fn new(function: u8, slaver_id: u8, address: u16, quantity: u16, values: &[u8]) -> Self {
        Self {
            function,
            slaver_id,
            address,
            quantity,
            values: hex::encode(values),
        }
    }

    pub fn value_bytes(&self) -> RhilexResult<Vec<u8>> {
        hex::decode(&self.values).map_err(|e| RhilexError::InvalidParameter {
            param: "values".to_string(),
            reason: e.to_string(),
        })
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use super::*;

    fn rule(src: Option<&str>, dev: Option<&str>) -> RuleDef {
        RuleDef {
            uuid: "r1".into(),
            name: "r".into(),
            from_source: src.map(Into::into),
            from_device: dev.map(Into::into),
            success: String::new(),
            actions: String::new(),
            failed: String::new(),
            description: String::new(),
            status: RuleStatus::Running,
        }
    }

    #[test]
    fn test_rule_binding_is_exclusive() {
        assert!(rule(Some("s1"), None).validate().is_ok());
        assert!(rule(None, Some("d1")).validate().is_ok());
        assert!(rule(None, None).validate().is_err());
        assert!(rule(Some("s1"), Some("d1")).validate().is_err());
        assert!(rule(Some(""), Some("d1")).validate().is_ok());
        assert_eq!(rule(Some(""), Some("d1")).bound_resource(), Some("d1"));
    }

    #[test]
    fn test_resource_def_wire_shape() {
        let def: ResourceDef = serde_json::from_value(serde_json::json!({
            "uuid": "d1",
            "name": "meter",
            "type": "GENERIC_MODBUS_MASTER",
            "config": {"commonConfig": {"mode": "TCP"}}
        }))
        .unwrap();
        assert_eq!(def.type_tag, "GENERIC_MODBUS_MASTER");
        assert!(def.action.is_none());
        let applet: AppletDef =
            serde_json::from_value(serde_json::json!({"uuid": "a1", "name": "x", "script": ""}))
                .unwrap();
        assert_eq!(applet.version, "v1.0.0");
        assert!(!applet.auto_start);
    }

    #[test]
    fn test_register_write_hex_values() {
        let w = RegisterWrite::new(16, 1, 10, 2, &[0x00, 0x2A, 0xFF, 0x01]);
        let text = serde_json::to_string(&w).unwrap();
        assert!(text.contains("\"slaverId\":1"));
        assert!(text.contains("\"values\":\"002aff01\""));
        let back: RegisterWrite = serde_json::from_str(&text).unwrap();
        assert_eq!(back.value_bytes().unwrap(), vec![0x00, 0x2A, 0xFF, 0x01]);
        let bad = RegisterWrite { values: "0g".into(), ..back };
        assert!(bad.value_bytes().is_err());
    }
}
