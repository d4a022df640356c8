//! `ithings` and `tciothub`: replies and reports through a cloud adapter

use std::sync::Arc;

use mlua::{Lua, Table, Value};
use serde::Serialize;

use super::json::lua_to_json;
use super::Namespace;
use crate::env::VmContext;
use crate::error::describe;

/// Reply operations that only carry the platform's request token
const TOKEN_REPLIES: &[&str] = &[
    "ActionReplySuccess",
    "ActionReplyFailure",
    "PropertyReplySuccess",
    "PropertyReplyFailure",
];

/// (cecolla, token, productID, deviceName, data)
type PropertyReply<'lua> = (String, String, String, String, Value<'lua>);

#[derive(Debug, Serialize)]
struct PropertiesCmd {
    token: String,
    #[serde(rename = "productID")]
    product_id: String,
    #[serde(rename = "deviceName")]
    device_name: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    identifiers: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<serde_json::Value>,
}

/// Run `cmd` on the cecolla; `None` on success
fn ctrl(vm: &VmContext, uuid: &str, cmd: &str, args: Vec<u8>) -> mlua::Result<Option<String>> {
    let engine = match vm.env.engine() {
        Ok(e) => e,
        Err(e) => return Ok(Some(describe(&e))),
    };
    let Some(cecolla) = engine.get_cecolla(uuid) else {
        return Ok(Some(format!("cecolla not exists:{}", uuid)));
    };
    let result = vm.block_on(async move { cecolla.on_ctrl(cmd, &args).await })?;
    Ok(result.err().map(|e| e.to_string()))
}

fn identifiers(table: Table<'_>) -> mlua::Result<Vec<String>> {
    let mut out = Vec::new();
    for v in table.sequence_values::<Value>() {
        out.push(match v? {
            Value::String(s) => s.to_string_lossy().into_owned(),
            other => other.to_string()?,
        });
    }
    Ok(out)
}

fn encode<T: Serialize>(value: &T) -> mlua::Result<Vec<u8>> {
    serde_json::to_vec(value).map_err(mlua::Error::external)
}

fn add_token_replies(
    ns: &Namespace<'_>,
    ctx: &Arc<VmContext>,
    names: &[&'static str],
) -> mlua::Result<()> {
    for &name in names {
        let vm = Arc::clone(ctx);
        ns.add(name, move |_, (uuid, token): (String, String)| {
            ctrl(&vm, &uuid, name, token.into_bytes())
        })?;
    }
    Ok(())
}

fn add_property_report(ns: &Namespace<'_>, ctx: &Arc<VmContext>) -> mlua::Result<()> {
    let vm = Arc::clone(ctx);
    ns.add("PropertyReport", move |lua, (uuid, params): (String, Value)| {
        let params = lua_to_json(lua, params)?;
        ctrl(&vm, &uuid, "PropertyReport", encode(&params)?)
    })
}

pub(super) fn install(lua: &Lua, ctx: &Arc<VmContext>) -> mlua::Result<()> {
    let ns = Namespace::new(lua, "ithings")?;
    add_token_replies(&ns, ctx, &["CtrlReplySuccess", "CtrlReplyFailure"])?;
    add_token_replies(&ns, ctx, TOKEN_REPLIES)?;
    add_property_report(&ns, ctx)?;

    let vm = Arc::clone(ctx);
    ns.add(
        "GetPropertyReplySuccess",
        move |lua, (uuid, token, product_id, device_name, data): PropertyReply| {
            let cmd = PropertiesCmd {
                token,
                product_id,
                device_name,
                identifiers: Vec::new(),
                data: Some(lua_to_json(lua, data)?),
            };
            ctrl(&vm, &uuid, "GetPropertyReplySuccess", encode(&cmd)?)
        },
    )?;

    let vm = Arc::clone(ctx);
    ns.add(
        "GetProperties",
        move |_, (uuid, product_id, device_name, ids): (String, String, String, Table)| {
            let cmd = PropertiesCmd {
                token: String::new(),
                product_id,
                device_name,
                identifiers: identifiers(ids)?,
                data: None,
            };
            ctrl(&vm, &uuid, "GetProperties", encode(&cmd)?)
        },
    )?;
    ns.register()?;

    let ns = Namespace::new(lua, "tciothub")?;
    add_token_replies(&ns, ctx, TOKEN_REPLIES)?;
    add_property_report(&ns, ctx)?;
    ns.register()
}
