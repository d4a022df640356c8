//! Gateway libraries exposed to rule and applet VMs
//!
//! Every namespace table carries a `__namespace` key so functions can be
//! called both as `ns.F(...)` and `ns:F(...)`: a leading argument that is
//! the namespace table itself is dropped before the arguments are bound.

use std::fmt::Display;
use std::sync::Arc;

use mlua::{FromLuaMulti, IntoLuaMulti, Lua, MultiValue, Table, Value};

use crate::env::VmContext;

mod audio;
mod binary;
mod cloud;
mod data;
mod device;
mod globals;
mod hex;
mod http;
mod jq;
pub(crate) mod json;
mod kv;
mod math;
mod modbus;
mod rds;
mod string;
mod time;

pub(crate) const NAMESPACE_KEY: &str = "__namespace";

/// A global table of library functions under construction
pub(crate) struct Namespace<'lua> {
    lua: &'lua Lua,
    name: &'static str,
    table: Table<'lua>,
}

impl<'lua> Namespace<'lua> {
    /// Start a namespace; an existing global table of the same name (e.g.
    /// the standard `string` library) is extended in place
    pub(crate) fn new(lua: &'lua Lua, name: &'static str) -> mlua::Result<Self> {
        let table = match lua.globals().raw_get::<_, Value>(name)? {
            Value::Table(t) => t,
            _ => lua.create_table()?,
        };
        table.raw_set(NAMESPACE_KEY, name)?;
        Ok(Self { lua, name, table })
    }

    pub(crate) fn add<A, R, F>(&self, fname: &str, f: F) -> mlua::Result<()>
    where
        A: FromLuaMulti<'lua>,
        R: IntoLuaMulti<'lua>,
        F: Fn(&'lua Lua, A) -> mlua::Result<R> + Send + 'static,
    {
        let ns = self.name;
        let func = self.lua.create_function(move |lua, mut args: MultiValue<'lua>| {
            if is_namespace(args.get(0), ns) {
                args.pop_front();
            }
            f(lua, A::from_lua_multi(args, lua)?)
        })?;
        self.table.raw_set(fname, func)
    }

    pub(crate) fn register(self) -> mlua::Result<()> {
        self.lua.globals().raw_set(self.name, self.table)
    }
}

fn is_namespace(value: Option<&Value<'_>>, ns: &str) -> bool {
    match value {
        Some(Value::Table(t)) => matches!(
            t.raw_get::<_, Option<String>>(NAMESPACE_KEY),
            Ok(Some(name)) if name == ns
        ),
        _ => false,
    }
}

/// `(value, nil)` on success, `(nil, err)` on failure
pub(crate) fn pair<T, E: Display>(result: Result<T, E>) -> (Option<T>, Option<String>) {
    match result {
        Ok(v) => (Some(v), None),
        Err(e) => (None, Some(e.to_string())),
    }
}

/// `nil` on success, the error message on failure
pub(crate) fn err_only<T, E: Display>(result: Result<T, E>) -> Option<String> {
    result.err().map(|e| e.to_string())
}

/// `tostring` semantics, honouring `__tostring`
pub(crate) fn to_display(lua: &Lua, value: Value<'_>) -> mlua::Result<String> {
    match value {
        Value::String(s) => Ok(s.to_string_lossy().into_owned()),
        other => {
            let tostring: mlua::Function = lua.globals().raw_get("tostring")?;
            tostring.call::<_, String>(other)
        },
    }
}

/// Install every library into `lua`
pub(crate) fn install(lua: &Lua, ctx: &Arc<VmContext>) -> mlua::Result<()> {
    globals::install(lua, ctx)?;
    data::install(lua, ctx)?;
    kv::install(lua, ctx)?;
    time::install(lua, ctx)?;
    hex::install(lua)?;
    binary::install(lua)?;
    json::install(lua)?;
    string::install(lua)?;
    device::install(lua, ctx)?;
    modbus::install(lua, ctx)?;
    cloud::install(lua, ctx)?;
    math::install(lua)?;
    http::install(lua, ctx)?;
    jq::install(lua)?;
    rds::install(lua, ctx)?;
    audio::install(lua, ctx)?;
    Ok(())
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Arc;

    use common::RhilexConfig;
    use mlua::Lua;
    use rhilex_core::RuntimeContext;
    use tokio_util::sync::CancellationToken;

    use crate::env::{ScriptEnv, ScriptScope, VmContext};

    pub(crate) fn detached_ctx() -> Arc<VmContext> {
        let runtime = RuntimeContext::new(RhilexConfig::default());
        VmContext::new(
            "test-vm",
            ScriptScope::Rule,
            CancellationToken::new(),
            ScriptEnv::detached(runtime),
        )
    }

    /// VM with every library and no engine behind it
    pub(crate) fn vm() -> Lua {
        crate::vm::new_vm(&detached_ctx()).unwrap_or_else(|e| panic!("vm: {e}"))
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use super::testing::vm;

    #[test]
    fn test_dot_and_colon_calls_agree() {
        let lua = vm();
        let (a, b): (String, String) = lua
            .load(r#"return hex.ABCD("01020304"), hex:ABCD("01020304")"#)
            .eval()
            .unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_string_library_is_extended_not_replaced() {
        let lua = vm();
        let (up, has_t2str): (String, bool) = lua
            .load(r#"return string.upper("ab"), type(string.T2Str) == "function""#)
            .eval()
            .unwrap();
        assert_eq!(up, "AB");
        assert!(has_t2str);
    }
}
