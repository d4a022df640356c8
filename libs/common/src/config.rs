//! Gateway configuration
//!
//! Priority (highest to lowest):
//! 1. `RHILEX_*` environment variables
//! 2. `[app]` section of the INI file
//! 3. Built-in defaults

use std::path::Path;

use errors::{RhilexError, RhilexResult};
use figment::{
    providers::{Env, Serialized},
    value::{Dict, Value},
    Figment,
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::ini::{parse_bool, Ini, IniSection};

/// Settings from the `[app]` section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RhilexConfig {
    /// Path of the INI file this config was read from
    pub ini_path: String,
    pub app_id: String,
    pub max_queue_size: usize,
    /// Milliseconds between source restarts
    pub source_restart_interval: u64,
    /// Worker threads for the runtime, 0 means one per core
    pub max_procs: usize,
    pub enable_pprof: bool,
    pub enable_console: bool,
    pub debug_mode: bool,
    pub log_level: String,
    pub log_path: String,
    /// MiB
    pub log_max_size: u64,
    pub log_max_backups: usize,
    /// Days
    pub log_max_age: u64,
    pub log_compress: bool,
    pub max_kv_store_size: usize,
    pub max_lost_cache_size: usize,
    pub ext_libs: Vec<String>,
    pub data_schema_secret: Vec<String>,
    /// Consecutive poll failures before a device reports DOWN
    pub retry_threshold: u32,
    pub db_path: String,
    pub audio_player: String,
}

impl Default for RhilexConfig {
    fn default() -> Self {
        Self {
            ini_path: String::new(),
            app_id: "rhilex".to_string(),
            max_queue_size: 10240,
            source_restart_interval: 5000,
            max_procs: 0,
            enable_pprof: false,
            enable_console: false,
            debug_mode: false,
            log_level: "info".to_string(),
            log_path: "rhilex-running-log".to_string(),
            log_max_size: 5,
            log_max_backups: 5,
            log_max_age: 7,
            log_compress: true,
            max_kv_store_size: 1024,
            max_lost_cache_size: 10000,
            ext_libs: Vec::new(),
            data_schema_secret: vec!["rhilex-secret".to_string()],
            retry_threshold: 5,
            db_path: "rhilex.db".to_string(),
            audio_player: "aplay".to_string(),
        }
    }
}

const LIST_KEYS: &[&str] = &["ext_libs", "data_schema_secret"];

/// Map historic and CamelCase spellings onto field names
fn canonical_key(key: &str) -> String {
    let snake = to_snake_case(key);
    match snake.as_str() {
        "resource_restart_interval" => "source_restart_interval".to_string(),
        "gomax_procs" => "max_procs".to_string(),
        "enable_p_prof" => "enable_pprof".to_string(),
        "app_debug_mode" => "debug_mode".to_string(),
        "dataschema_secrets" | "data_schema_secrets" => "data_schema_secret".to_string(),
        _ => snake,
    }
}

fn to_snake_case(key: &str) -> String {
    let chars: Vec<char> = key.chars().collect();
    let mut out = String::with_capacity(key.len() + 4);
    for (i, c) in chars.iter().enumerate() {
        if c.is_ascii_uppercase() {
            let prev_lower = i > 0 && (chars[i - 1].is_ascii_lowercase() || chars[i - 1].is_ascii_digit());
            let next_lower = chars.get(i + 1).is_some_and(|n| n.is_ascii_lowercase());
            let prev_upper = i > 0 && chars[i - 1].is_ascii_uppercase();
            if prev_lower || (prev_upper && next_lower) {
                out.push('_');
            }
            out.push(c.to_ascii_lowercase());
        } else {
            out.push(*c);
        }
    }
    out
}

/// Convert the `[app]` section into a figment dictionary
fn app_section_dict(section: &IniSection) -> Dict {
    let mut dict = Dict::new();
    for key in section.keys() {
        let name = canonical_key(key);
        let values = section.get_all(key);
        let value = if LIST_KEYS.contains(&name.as_str()) {
            let items = values
                .iter()
                .flat_map(|v| v.split(','))
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(|v| Value::from(v.to_string()))
                .collect::<Vec<_>>();
            Value::from(items)
        } else {
            match values.last() {
                Some(raw) => raw.parse::<Value>().unwrap_or_else(|e| match e {}),
                None => continue,
            }
        };
        dict.insert(name, value);
    }
    dict
}

/// Declared `plugin.<name>` section
#[derive(Debug, Clone, PartialEq)]
pub struct PluginSection {
    pub name: String,
    pub enable: bool,
    pub section: IniSection,
}

/// Declared `transceiver.<name>` section
#[derive(Debug, Clone, PartialEq)]
pub struct TransceiverConfig {
    pub name: String,
    pub enable: bool,
    pub address: String,
    pub baud_rate: u32,
    pub data_bits: u8,
    pub parity: String,
    pub stop_bits: u8,
    /// Milliseconds
    pub io_timeout: u64,
    pub transport_protocol: u8,
}

impl TransceiverConfig {
    fn from_section(name: &str, section: &IniSection) -> Self {
        Self {
            name: name.to_string(),
            enable: section.get_bool("enable").unwrap_or(false),
            address: section.get("address").unwrap_or("COM1").to_string(),
            baud_rate: section.get_parsed("baud_rate").unwrap_or(9600),
            data_bits: section.get_parsed("data_bits").unwrap_or(8),
            parity: section.get("parity").unwrap_or("N").to_string(),
            stop_bits: section.get_parsed("stop_bits").unwrap_or(1),
            io_timeout: section.get_parsed("io_timeout").unwrap_or(0),
            transport_protocol: section.get_parsed("transport_protocol").unwrap_or(1),
        }
    }
}

/// Everything read from the INI file
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub app: RhilexConfig,
    pub plugins: Vec<PluginSection>,
    pub transceivers: Vec<TransceiverConfig>,
}

impl LoadedConfig {
    pub fn from_ini(ini: &Ini, ini_path: &str) -> RhilexResult<Self> {
        let app_dict = ini.section("app").map(app_section_dict).unwrap_or_default();

        let mut app: RhilexConfig = Figment::new()
            .merge(Serialized::defaults(RhilexConfig::default()))
            .merge(Serialized::globals(app_dict))
            .merge(Env::prefixed("RHILEX_"))
            .extract()
            .map_err(|e| RhilexError::config(format!("Failed to load configuration: {}", e)))?;
        app.ini_path = ini_path.to_string();

        if app.max_queue_size == 0 {
            return Err(RhilexError::InvalidConfig {
                field: "max_queue_size".to_string(),
                reason: "must be greater than 0".to_string(),
            });
        }

        let plugins = ini
            .sections_with_prefix("plugin")
            .map(|(name, section)| PluginSection {
                name: name.to_string(),
                enable: section.get("enable").map(parse_bool).unwrap_or(false),
                section: section.clone(),
            })
            .collect();

        let transceivers = ini
            .sections_with_prefix("transceiver")
            .map(|(name, section)| TransceiverConfig::from_section(name, section))
            .collect();

        Ok(Self {
            app,
            plugins,
            transceivers,
        })
    }

    pub fn load(path: impl AsRef<Path>) -> RhilexResult<Self> {
        let path = path.as_ref();
        let ini = Ini::load(path)?;
        Self::from_ini(&ini, &path.display().to_string())
    }
}

/// Bind a free-form resource config document to a typed struct
pub fn bind_config<T: DeserializeOwned>(config: &serde_json::Value) -> RhilexResult<T> {
    serde_json::from_value(config.clone())
        .map_err(|e| RhilexError::config(format!("invalid resource config: {}", e)))
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_without_app_section() {
        let ini = Ini::parse("").unwrap();
        let loaded = LoadedConfig::from_ini(&ini, "rhilex.ini").unwrap();
        assert_eq!(loaded.app.app_id, "rhilex");
        assert_eq!(loaded.app.max_queue_size, 10240);
        assert_eq!(loaded.app.data_schema_secret, vec!["rhilex-secret"]);
        assert_eq!(loaded.app.retry_threshold, 5);
        assert_eq!(loaded.app.ini_path, "rhilex.ini");
    }

    #[test]
    fn test_app_section_overrides_defaults() {
        let ini = Ini::parse(
            "[app]\n\
             app_id = edge-01\n\
             max_queue_size = 2\n\
             resource_restart_interval = 1000\n\
             LogCompress = false\n\
             ext_libs = a.lua\n\
             ext_libs = b.lua\n\
             dataschema_secrets = s1,s2\n",
        )
        .unwrap();
        let app = LoadedConfig::from_ini(&ini, "x.ini").unwrap().app;
        assert_eq!(app.app_id, "edge-01");
        assert_eq!(app.max_queue_size, 2);
        assert_eq!(app.source_restart_interval, 1000);
        assert!(!app.log_compress);
        assert_eq!(app.ext_libs, vec!["a.lua", "b.lua"]);
        assert_eq!(app.data_schema_secret, vec!["s1", "s2"]);
    }

    #[test]
    fn test_plugin_and_transceiver_sections() {
        let ini = Ini::parse(
            "[plugin.mqtt_server]\nenable = true\nport = 1884\n\
             [transceiver.lora]\nenable = true\naddress = /dev/ttyS2\nbaud_rate = 115200\n",
        )
        .unwrap();
        let loaded = LoadedConfig::from_ini(&ini, "x.ini").unwrap();
        assert_eq!(loaded.plugins.len(), 1);
        assert!(loaded.plugins[0].enable);
        assert_eq!(loaded.plugins[0].section.get("port"), Some("1884"));

        let lora = &loaded.transceivers[0];
        assert_eq!(lora.name, "lora");
        assert_eq!(lora.baud_rate, 115200);
        assert_eq!(lora.parity, "N");
        assert_eq!(lora.stop_bits, 1);
    }

    #[test]
    fn test_zero_queue_size_rejected() {
        let ini = Ini::parse("[app]\nmax_queue_size = 0\n").unwrap();
        assert!(LoadedConfig::from_ini(&ini, "x.ini").is_err());
    }

    #[test]
    fn test_canonical_keys() {
        assert_eq!(canonical_key("MaxQueueSize"), "max_queue_size");
        assert_eq!(canonical_key("EnablePProf"), "enable_pprof");
        assert_eq!(canonical_key("max_kv_store_size"), "max_kv_store_size");
        assert_eq!(canonical_key("GomaxProcs"), "max_procs");
    }

    #[test]
    fn test_bind_config() {
        #[derive(Deserialize)]
        struct HostConfig {
            host: String,
            #[serde(default)]
            port: u16,
        }
        let cfg: HostConfig =
            bind_config(&serde_json::json!({"host": "127.0.0.1", "extra": 1})).unwrap();
        assert_eq!(cfg.host, "127.0.0.1");
        assert_eq!(cfg.port, 0);
        assert!(bind_config::<HostConfig>(&serde_json::json!({"port": 1})).is_err());
    }
}
