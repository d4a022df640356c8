//! Minimal INI reader
//!
//! Sections keep file order, keys keep insertion order, and a key that
//! appears more than once inside a section is kept as several values so list
//! settings (`ext_libs`, `dataschema_secrets`) can be written one per line.

use std::path::Path;

use errors::{RhilexError, RhilexResult};

/// One `[name]` block
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IniSection {
    pub name: String,
    entries: Vec<(String, String)>,
}

impl IniSection {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entries: Vec::new(),
        }
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.push((key.into(), value.into()));
    }

    /// First value for `key`
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Every value recorded for `key`, in file order
    pub fn get_all(&self, key: &str) -> Vec<&str> {
        self.entries
            .iter()
            .filter(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
            .collect()
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.get(key).map(parse_bool)
    }

    pub fn get_parsed<T: std::str::FromStr>(&self, key: &str) -> Option<T> {
        self.get(key).and_then(|v| v.parse().ok())
    }

    /// Distinct keys, first-seen order
    pub fn keys(&self) -> Vec<&str> {
        let mut keys: Vec<&str> = Vec::new();
        for (k, _) in &self.entries {
            if !keys.contains(&k.as_str()) {
                keys.push(k);
            }
        }
        keys
    }

    pub fn entries(&self) -> &[(String, String)] {
        &self.entries
    }
}

/// Parsed INI document
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Ini {
    sections: Vec<IniSection>,
}

impl Ini {
    pub fn load(path: impl AsRef<Path>) -> RhilexResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|_| RhilexError::FileNotFound(path.display().to_string()))?;
        Self::parse(&text).map_err(|e| RhilexError::ParseError {
            file: path.display().to_string(),
            error: e.to_string(),
        })
    }

    pub fn parse(text: &str) -> RhilexResult<Self> {
        let mut sections: Vec<IniSection> = Vec::new();
        // Keys before the first header land in an unnamed default section
        let mut current = IniSection::new("");

        for (lineno, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with(';') || line.starts_with('#') {
                continue;
            }

            if let Some(rest) = line.strip_prefix('[') {
                let name = rest.strip_suffix(']').ok_or_else(|| {
                    RhilexError::Validation(format!(
                        "line {}: unterminated section header",
                        lineno + 1
                    ))
                })?;
                let finished = std::mem::replace(&mut current, IniSection::new(name.trim()));
                if !finished.name.is_empty() || !finished.entries.is_empty() {
                    sections.push(finished);
                }
                continue;
            }

            let (key, value) = line.split_once('=').ok_or_else(|| {
                RhilexError::Validation(format!("line {}: expected key = value", lineno + 1))
            })?;
            current.insert(key.trim(), unquote(strip_inline_comment(value.trim())));
        }
        if !current.name.is_empty() || !current.entries.is_empty() {
            sections.push(current);
        }

        Ok(Self { sections })
    }

    pub fn section(&self, name: &str) -> Option<&IniSection> {
        self.sections.iter().find(|s| s.name == name)
    }

    pub fn sections(&self) -> &[IniSection] {
        &self.sections
    }

    /// Sections named `<prefix>.<name>`, returned with the bare name
    pub fn sections_with_prefix<'a>(
        &'a self,
        prefix: &'a str,
    ) -> impl Iterator<Item = (&'a str, &'a IniSection)> + 'a {
        self.sections.iter().filter_map(move |s| {
            s.name
                .strip_prefix(prefix)
                .and_then(|rest| rest.strip_prefix('.'))
                .map(|name| (name, s))
        })
    }
}

pub fn parse_bool(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "true" | "1" | "yes" | "on"
    )
}

fn strip_inline_comment(value: &str) -> &str {
    // Only `;`/`#` preceded by whitespace starts a comment, so `a;b` survives
    for (i, c) in value.char_indices() {
        if (c == ';' || c == '#') && i > 0 && value[..i].ends_with(char::is_whitespace) {
            return value[..i].trim_end();
        }
    }
    value
}

fn unquote(value: &str) -> String {
    let bytes = value.as_bytes();
    if bytes.len() >= 2
        && ((bytes[0] == b'"' && bytes[bytes.len() - 1] == b'"')
            || (bytes[0] == b'\'' && bytes[bytes.len() - 1] == b'\''))
    {
        return value[1..value.len() - 1].to_string();
    }
    value.to_string()
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
; gateway settings
[app]
app_id = rhilex
max_queue_size = 20480
ext_libs = /usr/local/lib/a.lua
ext_libs = /usr/local/lib/b.lua
log_level = "debug"  ; inline

[plugin.mqtt_server]
enable = true
port = 1884

[transceiver.lora]
enable = false
address = /dev/ttyS1
"#;

    #[test]
    fn test_parse_sections_in_order() {
        let ini = Ini::parse(SAMPLE).unwrap();
        let names: Vec<&str> = ini.sections().iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["app", "plugin.mqtt_server", "transceiver.lora"]);
    }

    #[test]
    fn test_shadow_keys_and_quotes() {
        let ini = Ini::parse(SAMPLE).unwrap();
        let app = ini.section("app").unwrap();
        assert_eq!(app.get("app_id"), Some("rhilex"));
        assert_eq!(app.get_parsed::<u64>("max_queue_size"), Some(20480));
        assert_eq!(
            app.get_all("ext_libs"),
            vec!["/usr/local/lib/a.lua", "/usr/local/lib/b.lua"]
        );
        assert_eq!(app.get("log_level"), Some("debug"));
        assert_eq!(app.keys().len(), 4);
    }

    #[test]
    fn test_prefixed_sections() {
        let ini = Ini::parse(SAMPLE).unwrap();
        let plugins: Vec<&str> = ini.sections_with_prefix("plugin").map(|(n, _)| n).collect();
        assert_eq!(plugins, vec!["mqtt_server"]);

        let (_, lora) = ini.sections_with_prefix("transceiver").next().unwrap();
        assert_eq!(lora.get_bool("enable"), Some(false));
    }

    #[test]
    fn test_malformed_line_is_error() {
        assert!(Ini::parse("[app]\nnot a pair").is_err());
        assert!(Ini::parse("[app\nk=v").is_err());
    }
}
