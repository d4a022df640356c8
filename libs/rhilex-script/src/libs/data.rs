//! `data`: hand a payload to an outbound target

use std::sync::Arc;

use mlua::Lua;
use rhilex_core::types::target_types;
use rhilex_core::ResourceKind;

use super::{err_only, Namespace};
use crate::env::VmContext;
use crate::error::describe;

/// Send `payload` to the target `uuid`, which must be of type `expected`
fn write_target(ctx: &VmContext, expected: &str, uuid: &str, payload: String) -> Result<(), String> {
    let engine = ctx.env.engine().map_err(|e| describe(&e))?;
    let def = engine
        .resource_def(ResourceKind::Target, uuid)
        .ok_or_else(|| format!("target not exists:{}", uuid))?;
    if def.type_tag != expected {
        return Err(format!(
            "target type mismatch:{}, expect {} but got {}",
            uuid, expected, def.type_tag
        ));
    }
    let target = engine
        .get_target(uuid)
        .ok_or_else(|| format!("target not exists:{}", uuid))?;
    ctx.block_on(target.to(serde_json::Value::String(payload)))
        .map_err(|e| describe(&e))?
        .map(|_| ())
        .map_err(|e| e.to_string())
}

pub(super) fn install(lua: &Lua, ctx: &Arc<VmContext>) -> mlua::Result<()> {
    let ns = Namespace::new(lua, "data")?;
    for (name, kind) in [
        ("ToHttp", target_types::HTTP),
        ("ToMqtt", target_types::MQTT),
        ("ToUdp", target_types::UDP_TARGET),
        ("ToTcp", target_types::TCP_TRANSPORT),
    ] {
        let vm = Arc::clone(ctx);
        ns.add(name, move |_, (uuid, payload): (String, mlua::String)| {
            let payload = payload.to_string_lossy().into_owned();
            Ok(err_only(write_target(&vm, kind, &uuid, payload)))
        })?;
    }
    ns.register()
}
