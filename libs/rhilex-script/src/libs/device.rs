//! `device`: read, write and control devices; push bytes through sources

use std::sync::Arc;

use mlua::Lua;
use rhilex_core::{ResourceState, XDevice, XSource};

use super::Namespace;
use crate::env::VmContext;
use crate::error::describe;

type Reply<T> = (Option<T>, Option<String>);

fn up_device(vm: &VmContext, uuid: &str) -> Result<Arc<dyn XDevice>, String> {
    let engine = vm.env.engine().map_err(|e| describe(&e))?;
    let device = engine
        .get_device(uuid)
        .ok_or_else(|| format!("device not exists:{}", uuid))?;
    if device.status() != ResourceState::Up {
        return Err(format!("device down:{}", uuid));
    }
    Ok(device)
}

fn up_source(vm: &VmContext, uuid: &str) -> Result<Arc<dyn XSource>, String> {
    let engine = vm.env.engine().map_err(|e| describe(&e))?;
    let source = engine
        .get_source(uuid)
        .ok_or_else(|| format!("source not exists:{}", uuid))?;
    if source.status() != ResourceState::Up {
        return Err(format!("source down:{}", uuid));
    }
    Ok(source)
}

/// Run a device/source call on the VM thread, flattening the three error
/// layers into one message
fn call<T, F>(vm: &VmContext, fut: F) -> mlua::Result<Reply<T>>
where
    F: std::future::Future<Output = errors::RhilexResult<T>>,
{
    Ok(match vm.block_on(fut)? {
        Ok(v) => (Some(v), None),
        Err(e) => (None, Some(e.to_string())),
    })
}

pub(super) fn install(lua: &Lua, ctx: &Arc<VmContext>) -> mlua::Result<()> {
    let ns = Namespace::new(lua, "device")?;

    let vm = Arc::clone(ctx);
    ns.add("ReadDevice", move |lua, (uuid, cmd): (String, mlua::String)| {
        let device = match up_device(&vm, &uuid) {
            Ok(d) => d,
            Err(e) => return Ok((None, Some(e))),
        };
        let (data, err) = call(&vm, async move { device.on_read(cmd.as_bytes()).await })?;
        Ok((data.map(|d| lua.create_string(d)).transpose()?, err))
    })?;

    let vm = Arc::clone(ctx);
    ns.add(
        "WriteDevice",
        move |_, (uuid, cmd, data): (String, mlua::String, mlua::String)| {
            let device = match up_device(&vm, &uuid) {
                Ok(d) => d,
                Err(e) => return Ok((None, Some(e))),
            };
            call(&vm, async move { device.on_write(cmd.as_bytes(), data.as_bytes()).await })
        },
    )?;

    let vm = Arc::clone(ctx);
    ns.add(
        "CtrlDevice",
        move |_, (uuid, cmd, args): (String, mlua::String, mlua::String)| {
            let device = match up_device(&vm, &uuid) {
                Ok(d) => d,
                Err(e) => return Ok((None, Some(e))),
            };
            let (data, err) =
                call(&vm, async move { device.on_ctrl(cmd.as_bytes(), args.as_bytes()).await })?;
            Ok((data.map(hex::encode), err))
        },
    )?;

    let vm = Arc::clone(ctx);
    ns.add("ReadSource", move |_, (uuid, data): (String, mlua::String)| {
        let source = match up_source(&vm, &uuid) {
            Ok(s) => s,
            Err(e) => return Ok((None, Some(e))),
        };
        call(&vm, async move { source.up_stream(data.as_bytes()).await })
    })?;

    let vm = Arc::clone(ctx);
    ns.add("WriteSource", move |_, (uuid, data): (String, mlua::String)| {
        let source = match up_source(&vm, &uuid) {
            Ok(s) => s,
            Err(e) => return Ok((None, Some(e))),
        };
        call(&vm, async move { source.down_stream(data.as_bytes()).await })
    })?;
    ns.register()
}
