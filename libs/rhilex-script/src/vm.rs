//! Sandboxed Lua VM construction and scratch-VM validation

use std::sync::Arc;

use errors::{RhilexError, RhilexResult};
use mlua::{Function, HookTriggers, Lua, LuaOptions, StdLib, Table, Value};
use rhilex_core::{AppletDef, RuleDef};
use tracing::{debug, warn};

use crate::env::VmContext;
use crate::error::{describe, invalid_script, script_error};
use crate::libs;

/// Message of the error raised inside a VM whose token was cancelled
pub const VM_CANCELLED: &str = "vm cancelled";

/// Heap ceiling of a rule or applet VM
pub const VM_MEMORY_LIMIT: usize = 16 * 1024 * 1024;

const SCRATCH_MEMORY_LIMIT: usize = 4 * 1024 * 1024;

/// Instructions between two cancellation checks
const HOOK_INSTRUCTION_STEP: u32 = 1000;

/// Globals from the base library that reach the filesystem
const UNSAFE_GLOBALS: &[&str] = &["dofile", "loadfile"];

fn sandbox(memory_limit: usize) -> RhilexResult<Lua> {
    let lua = Lua::new_with(
        StdLib::COROUTINE | StdLib::TABLE | StdLib::STRING | StdLib::UTF8 | StdLib::MATH,
        LuaOptions::default(),
    )
    .map_err(script_error)?;
    lua.set_memory_limit(memory_limit).map_err(script_error)?;
    {
        let globals = lua.globals();
        for name in UNSAFE_GLOBALS {
            globals.raw_set(*name, Value::Nil).map_err(script_error)?;
        }
    }
    Ok(lua)
}

/// Build a VM carrying the gateway libraries for `ctx`, then load every
/// configured extension library
pub fn new_vm(ctx: &Arc<VmContext>) -> RhilexResult<Lua> {
    let lua = sandbox(VM_MEMORY_LIMIT)?;

    let token = ctx.token.clone();
    lua.set_hook(
        HookTriggers::new().every_nth_instruction(HOOK_INSTRUCTION_STEP),
        move |_lua, _debug| {
            if token.is_cancelled() {
                Err(mlua::Error::runtime(VM_CANCELLED))
            } else {
                Ok(())
            }
        },
    );

    libs::install(&lua, ctx).map_err(script_error)?;

    for path in &ctx.env.runtime().config.ext_libs {
        let source = match std::fs::read_to_string(path) {
            Ok(source) => source,
            Err(e) => {
                warn!("Failed to read ext lib {}: {}", path, e);
                continue;
            },
        };
        if let Err(e) = lua.load(source.as_str()).set_name(path.as_str()).exec() {
            warn!("Failed to load ext lib {}: {}", path, describe(&e));
            continue;
        }
        debug!("Loaded ext lib {} into {}", path, ctx.uuid);
    }
    Ok(lua)
}

/// VM without gateway libraries, used to check user scripts before they
/// reach a real VM
fn scratch_vm() -> RhilexResult<Lua> {
    sandbox(SCRATCH_MEMORY_LIMIT)
}

/// Check the shape of the three rule callbacks
pub(crate) fn check_rule_globals(globals: &Table<'_>) -> RhilexResult<()> {
    if !matches!(globals.get::<_, Value>("Success"), Ok(Value::Function(_))) {
        return Err(RhilexError::InvalidScript(
            "'Success' callback function missed".to_string(),
        ));
    }
    if !matches!(globals.get::<_, Value>("Failed"), Ok(Value::Function(_))) {
        return Err(RhilexError::InvalidScript(
            "'Failed' callback function missed".to_string(),
        ));
    }
    let actions = match globals.get::<_, Value>("Actions") {
        Ok(Value::Table(t)) => t,
        _ => {
            return Err(RhilexError::InvalidScript(
                "'Actions' must be a functions table".to_string(),
            ))
        },
    };
    for value in actions.sequence_values::<Value>() {
        if !matches!(value, Ok(Value::Function(_))) {
            return Err(RhilexError::InvalidScript("Invalid function type".to_string()));
        }
    }
    Ok(())
}

/// Load the three rule callbacks into `lua` under the globals
/// `Success`, `Failed` and `Actions`
pub(crate) fn load_rule_callbacks(lua: &Lua, def: &RuleDef) -> RhilexResult<()> {
    lua.load(def.actions.as_str())
        .set_name("Actions")
        .exec()
        .map_err(invalid_script)?;
    lua.load(def.success.as_str())
        .set_name("Success")
        .exec()
        .map_err(invalid_script)?;
    lua.load(def.failed.as_str())
        .set_name("Failed")
        .exec()
        .map_err(invalid_script)?;
    check_rule_globals(&lua.globals())
}

/// Compile the rule's callbacks on a throwaway VM
pub fn verify_rule_syntax(def: &RuleDef) -> RhilexResult<()> {
    let lua = scratch_vm()?;
    load_rule_callbacks(&lua, def)
}

/// Check that an applet script defines `Main` as a function
pub fn validate_applet_script(script: &str) -> RhilexResult<()> {
    let lua = scratch_vm()?;
    lua.load(script)
        .set_name("Main")
        .exec()
        .map_err(invalid_script)?;
    applet_main(&lua).map(|_| ())
}

pub(crate) fn applet_main(lua: &Lua) -> RhilexResult<Function<'_>> {
    match lua.globals().get::<_, Value>("Main") {
        Ok(Value::Function(f)) => Ok(f),
        Ok(Value::Nil) | Err(_) => Err(RhilexError::InvalidScript(
            "'Main' field not exists".to_string(),
        )),
        Ok(_) => Err(RhilexError::InvalidScript(
            "'Main' must be function(arg)".to_string(),
        )),
    }
}

/// Scratch-check an applet definition
pub fn verify_applet(def: &AppletDef) -> RhilexResult<()> {
    validate_applet_script(&def.script)
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use super::*;

    fn rule(actions: &str, success: &str, failed: &str) -> RuleDef {
        RuleDef {
            uuid: "r1".into(),
            name: "r".into(),
            from_source: Some("s1".into()),
            from_device: None,
            success: success.into(),
            actions: actions.into(),
            failed: failed.into(),
            description: String::new(),
            status: rhilex_core::RuleStatus::Running,
        }
    }

    const OK_ACTIONS: &str = "Actions = { function(args) return true, args end }";
    const OK_SUCCESS: &str = "function Success() end";
    const OK_FAILED: &str = "function Failed(error) end";

    #[test]
    fn test_valid_rule_passes() {
        verify_rule_syntax(&rule(OK_ACTIONS, OK_SUCCESS, OK_FAILED)).unwrap();
    }

    fn invalid(err: RhilexError) -> String {
        match err {
            RhilexError::InvalidScript(msg) => msg,
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_rule_shape_errors() {
        let err = verify_rule_syntax(&rule(OK_ACTIONS, "Success = 1", OK_FAILED)).unwrap_err();
        assert_eq!(invalid(err), "'Success' callback function missed");
        let err = verify_rule_syntax(&rule(OK_ACTIONS, OK_SUCCESS, "")).unwrap_err();
        assert_eq!(invalid(err), "'Failed' callback function missed");
        let err = verify_rule_syntax(&rule("Actions = 3", OK_SUCCESS, OK_FAILED)).unwrap_err();
        assert_eq!(invalid(err), "'Actions' must be a functions table");
        let err =
            verify_rule_syntax(&rule("Actions = { 1, 2 }", OK_SUCCESS, OK_FAILED)).unwrap_err();
        assert_eq!(invalid(err), "Invalid function type");
    }

    #[test]
    fn test_rule_syntax_error() {
        let err = verify_rule_syntax(&rule("Actions = {", OK_SUCCESS, OK_FAILED)).unwrap_err();
        assert!(matches!(err, RhilexError::InvalidScript(_)));
    }

    #[test]
    fn test_applet_script_checks() {
        validate_applet_script("function Main(arg) return 0 end").unwrap();
        assert_eq!(
            invalid(validate_applet_script("x = 1").unwrap_err()),
            "'Main' field not exists"
        );
        assert_eq!(
            invalid(validate_applet_script("Main = 'x'").unwrap_err()),
            "'Main' must be function(arg)"
        );
    }

    #[test]
    fn test_sandbox_hides_filesystem() {
        let lua = scratch_vm().unwrap();
        let (io, dofile): (Value, Value) = lua.load("return io, dofile").eval().unwrap();
        assert!(io.is_nil());
        assert!(dofile.is_nil());
    }
}
