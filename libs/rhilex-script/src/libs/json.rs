//! `json`: table <-> JSON text

use mlua::{DeserializeOptions, Lua, LuaSerdeExt, SerializeOptions, Value};

use super::Namespace;
use crate::error::describe;

/// JSON `null` maps to `nil` and arrays carry no metatable
pub(crate) fn lua_options() -> SerializeOptions {
    SerializeOptions::new()
        .serialize_none_to_null(false)
        .serialize_unit_to_null(false)
        .set_array_metatable(false)
}

pub(crate) fn json_to_lua<'lua>(
    lua: &'lua Lua,
    value: &serde_json::Value,
) -> mlua::Result<Value<'lua>> {
    lua.to_value_with(value, lua_options())
}

pub(crate) fn lua_to_json(lua: &Lua, value: Value<'_>) -> mlua::Result<serde_json::Value> {
    lua.from_value_with(value, DeserializeOptions::new().sort_keys(true))
}

pub(super) fn install(lua: &Lua) -> mlua::Result<()> {
    let ns = Namespace::new(lua, "json")?;

    ns.add("T2J", |lua, value: Value| {
        let text = lua_to_json(lua, value).and_then(|v| {
            serde_json::to_string(&v).map_err(|e| mlua::Error::runtime(e.to_string()))
        });
        match text {
            Ok(text) => Ok((Some(text), None)),
            Err(e) => Ok((None, Some(describe(&e)))),
        }
    })?;

    ns.add("J2T", |lua, text: mlua::String| {
        match serde_json::from_slice::<serde_json::Value>(text.as_bytes()) {
            Ok(v) => Ok((json_to_lua(lua, &v)?, None)),
            Err(e) => Ok((Value::Nil, Some(e.to_string()))),
        }
    })?;
    ns.register()
}
