//! Turning VM failures into gateway errors and log records

use std::fmt;
use std::sync::OnceLock;

use errors::RhilexError;
use regex::Regex;
use serde::Serialize;

const TRACEBACK_MARKER: &str = "stack traceback:";

fn line_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r":(\d+):").unwrap_or_else(|_| unreachable!()))
}

fn call_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"in (?:function|local|method|field|upvalue) '([^']+)'")
            .unwrap_or_else(|_| unreachable!())
    })
}

/// Innermost error behind callback and context wrappers
fn root_cause(e: &mlua::Error) -> &mlua::Error {
    let mut current = e;
    loop {
        match current {
            mlua::Error::CallbackError { cause, .. } | mlua::Error::WithContext { cause, .. } => {
                current = cause
            },
            other => return other,
        }
    }
}

/// Message without the `runtime error:` prefix and without a traceback
pub fn describe(e: &mlua::Error) -> String {
    let text = match root_cause(e) {
        mlua::Error::RuntimeError(msg) => msg.clone(),
        mlua::Error::SyntaxError { message, .. } => message.clone(),
        other => other.to_string(),
    };
    match text.find(TRACEBACK_MARKER) {
        Some(pos) => text[..pos].trim_end().to_string(),
        None => text,
    }
}

fn traceback(e: &mlua::Error) -> Option<String> {
    if let mlua::Error::CallbackError { traceback, .. } = e {
        return Some(traceback.clone());
    }
    if let mlua::Error::RuntimeError(msg) = root_cause(e) {
        return msg.find(TRACEBACK_MARKER).map(|pos| msg[pos..].to_string());
    }
    None
}

pub fn script_error(e: mlua::Error) -> RhilexError {
    RhilexError::Script(describe(&e))
}

pub fn invalid_script(e: mlua::Error) -> RhilexError {
    RhilexError::InvalidScript(describe(&e))
}

/// Structured record of an uncaught VM error
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScriptErrorRecord {
    pub function_name: String,
    /// `Lua` when the error carries a script position, `Rust` when it was
    /// raised by a library function
    pub what: String,
    /// -1 when unknown
    pub source_line: i64,
    pub last_call: String,
    pub message: String,
}

impl ScriptErrorRecord {
    pub fn from_error(function_name: &str, e: &mlua::Error) -> Self {
        let message = describe(e);
        let source_line = line_regex()
            .captures(&message)
            .and_then(|c| c[1].parse::<i64>().ok())
            .unwrap_or(-1);
        let what = if source_line >= 0 { "Lua" } else { "Rust" };
        let last_call = traceback(e)
            .and_then(|tb| call_regex().captures(&tb).map(|c| c[1].to_string()))
            .unwrap_or_else(|| "_main".to_string());
        Self {
            function_name: function_name.to_string(),
            what: what.to_string(),
            source_line,
            last_call,
            message,
        }
    }
}

impl fmt::Display for ScriptErrorRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Function Name: [{}],What: [{}], Source Line: [{}], Last Call: [{}], Error message: {}",
            self.function_name, self.what, self.source_line, self.last_call, self.message
        )
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use super::*;

    #[test]
    fn test_record_from_lua_error() {
        let lua = mlua::Lua::new();
        let err = lua
            .load("local x = 1\nerror('boom')")
            .set_name("Actions")
            .exec()
            .unwrap_err();
        let record = ScriptErrorRecord::from_error("Actions[1]", &err);
        assert_eq!(record.function_name, "Actions[1]");
        assert_eq!(record.source_line, 2);
        assert_eq!(record.what, "Lua");
        assert!(record.message.ends_with("boom"));
        assert!(record.to_string().starts_with("Function Name: [Actions[1]]"));
    }

    #[test]
    fn test_record_from_library_error() {
        let err = mlua::Error::CallbackError {
            traceback: "stack traceback:\n\t[C]: in function 'VGet'".to_string(),
            cause: std::sync::Arc::new(mlua::Error::runtime("max store size reached")),
        };
        let record = ScriptErrorRecord::from_error("Success", &err);
        assert_eq!(record.what, "Rust");
        assert_eq!(record.source_line, -1);
        assert_eq!(record.last_call, "VGet");
        assert_eq!(record.message, "max store size reached");
        assert!(matches!(script_error(err), RhilexError::Script(m) if m == "max store size reached"));
    }
}
