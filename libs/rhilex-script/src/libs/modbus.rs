//! `modbus` (writes through a Modbus master) and `modbus_slaver` (writes
//! into the register tables served by a Modbus slave)

use std::sync::Arc;

use mlua::Lua;
use rhilex_core::types::device_types;
use rhilex_core::{RegisterWrite, ResourceKind, ResourceState};

use super::Namespace;
use crate::env::VmContext;
use crate::error::describe;

/// Send `write` to the device's `on_write`; `None` on success
fn write_registers(
    vm: &VmContext,
    uuid: &str,
    expected_type: &str,
    write: RegisterWrite,
) -> mlua::Result<Option<String>> {
    let engine = match vm.env.engine() {
        Ok(e) => e,
        Err(e) => return Ok(Some(describe(&e))),
    };
    let (Some(def), Some(device)) = (
        engine.resource_def(ResourceKind::Device, uuid),
        engine.get_device(uuid),
    ) else {
        return Ok(Some("Device is not exists".to_string()));
    };
    if def.type_tag != expected_type {
        return Ok(Some(match expected_type {
            device_types::GENERIC_MODBUS_MASTER => "Only support GENERIC_MODBUS device".to_string(),
            _ => "Only support GENERIC_MODBUS_SLAVER device".to_string(),
        }));
    }
    if device.status() != ResourceState::Up {
        return Ok(Some(format!("device down:{}", uuid)));
    }
    let cmd = format!("F{}", write.function);
    let args = match serde_json::to_vec(&write) {
        Ok(args) => args,
        Err(e) => return Ok(Some(e.to_string())),
    };
    let result = vm.block_on(async move { device.on_write(cmd.as_bytes(), &args).await })?;
    Ok(result.err().map(|e| e.to_string()))
}

/// (device, slaver id, address, quantity, hex values)
type MultiWrite = (String, u8, u16, u16, String);

fn decode_values(values: &str) -> Result<Vec<u8>, String> {
    hex::decode(values).map_err(|e| e.to_string())
}

pub(super) fn install(lua: &Lua, ctx: &Arc<VmContext>) -> mlua::Result<()> {
    let master = device_types::GENERIC_MODBUS_MASTER;
    let ns = Namespace::new(lua, "modbus")?;

    let vm = Arc::clone(ctx);
    ns.add(
        "F5",
        move |_, (uuid, slaver_id, address, values): (String, u8, u16, String)| {
            let bytes = match decode_values(&values) {
                Ok(b) => b,
                Err(e) => return Ok(Some(e)),
            };
            if bytes.iter().any(|b| *b > 1) {
                return Ok(Some("Value Only Support '00' or '01'".to_string()));
            }
            let write = RegisterWrite::new(5, slaver_id, address, 1, &bytes);
            write_registers(&vm, &uuid, master, write)
        },
    )?;

    let vm = Arc::clone(ctx);
    ns.add(
        "F6",
        move |_, (uuid, slaver_id, address, values): (String, u8, u16, String)| {
            let bytes = match decode_values(&values) {
                Ok(b) => b,
                Err(e) => return Ok(Some(e)),
            };
            let write = RegisterWrite::new(6, slaver_id, address, 1, &bytes);
            write_registers(&vm, &uuid, master, write)
        },
    )?;

    for function in [15u8, 16u8] {
        let vm = Arc::clone(ctx);
        ns.add(
            &format!("F{}", function),
            move |_, (uuid, slaver_id, address, quantity, values): MultiWrite| {
                let bytes = match decode_values(&values) {
                    Ok(b) => b,
                    Err(e) => return Ok(Some(e)),
                };
                let write = RegisterWrite::new(function, slaver_id, address, quantity, &bytes);
                write_registers(&vm, &uuid, master, write)
            },
        )?;
    }
    ns.register()?;

    // modbus_slaver:F5(uuid, address, 0|1) / F6(uuid, address, u16); the
    // error message is returned, empty on success
    let slaver = device_types::GENERIC_MODBUS_SLAVER;
    let ns = Namespace::new(lua, "modbus_slaver")?;

    let vm = Arc::clone(ctx);
    ns.add("F5", move |_, (uuid, address, value): (String, u16, u8)| {
        if value > 1 {
            return Ok("Value Only Support 0 or 1".to_string());
        }
        let write = RegisterWrite::new(5, 0, address, 1, &[value]);
        Ok(write_registers(&vm, &uuid, slaver, write)?.unwrap_or_default())
    })?;

    let vm = Arc::clone(ctx);
    ns.add("F6", move |_, (uuid, address, value): (String, u16, u16)| {
        let write = RegisterWrite::new(6, 0, address, 1, &value.to_be_bytes());
        Ok(write_registers(&vm, &uuid, slaver, write)?.unwrap_or_default())
    })?;
    ns.register()
}
