//! `math` additions and `misc` checksums

use mlua::{Lua, Value};
use rand::Rng;
use rhilex_protocols::crc16_modbus;

use super::binary::bytes_arg;
use super::Namespace;

/// Floor `number` to `places` decimal places
pub(crate) fn truncate_float(number: f64, places: i32) -> f64 {
    let scale = 10f64.powi(places);
    (number * scale).floor() / scale
}

pub(crate) fn xor_checksum(data: &[u8]) -> u8 {
    data.iter().fold(0u8, |acc, b| acc ^ b)
}

pub(super) fn install(lua: &Lua) -> mlua::Result<()> {
    let ns = Namespace::new(lua, "math")?;
    ns.add("TFloat", |_, (number, places): (f64, i32)| {
        Ok(truncate_float(number, places))
    })?;
    // 1..=max
    ns.add("RandomInt", |_, max: i64| {
        if max < 1 {
            return Err(mlua::Error::runtime("RandomInt needs a positive bound"));
        }
        Ok(rand::thread_rng().gen_range(1..=max))
    })?;
    ns.register()?;

    let ns = Namespace::new(lua, "misc")?;
    ns.add("XOR", |_, data: Value| Ok(xor_checksum(&bytes_arg(data)?)))?;
    ns.add("CRC16", |_, data: Value| Ok(crc16_modbus(&bytes_arg(data)?)))?;
    ns.register()
}
