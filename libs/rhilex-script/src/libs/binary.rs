//! `binary`: bit-field matching and numeric decoding of raw bytes

use base64::Engine as _;
use mlua::{Lua, Value};

use super::{pair, Namespace};

/// Raw bytes from a Lua string or a sequence of byte numbers
pub(crate) fn bytes_arg(value: Value<'_>) -> mlua::Result<Vec<u8>> {
    match value {
        Value::String(s) => Ok(s.as_bytes().to_vec()),
        Value::Table(t) => t
            .sequence_values::<i64>()
            .map(|v| v.map(|b| (b & 0xFF) as u8))
            .collect(),
        Value::Nil => Ok(Vec::new()),
        other => Err(mlua::Error::runtime(format!(
            "expected bytes, got {}",
            other.type_name()
        ))),
    }
}

/// One `name:bits` field of a bit-match expression
#[derive(Debug, Clone, PartialEq, Eq)]
struct BitField {
    name: String,
    bits: usize,
}

/// Parse `">a:8 b:4 c:4"`; a leading `<` reads the buffer little-endian,
/// `>` (or nothing) big-endian
fn parse_bit_expr(expr: &str) -> Result<(bool, Vec<BitField>), String> {
    let expr = expr.trim();
    let (little, body) = match expr.chars().next() {
        Some('<') => (true, &expr[1..]),
        Some('>') => (false, &expr[1..]),
        _ => (false, expr),
    };
    let mut fields = Vec::new();
    for item in body.split(|c: char| c.is_whitespace() || c == ',' || c == ';') {
        if item.is_empty() {
            continue;
        }
        let (name, bits) = item
            .split_once(':')
            .ok_or_else(|| format!("invalid field: {}", item))?;
        let bits = bits
            .parse::<usize>()
            .map_err(|_| format!("invalid field width: {}", item))?;
        if bits == 0 || bits > 64 {
            return Err(format!("field width out of range: {}", item));
        }
        fields.push(BitField {
            name: name.to_string(),
            bits,
        });
    }
    Ok((little, fields))
}

/// Split `data` into named fields, most significant bit first; fields past
/// the end of the buffer are left out
fn match_bits(expr: &str, data: &[u8]) -> Result<Vec<(String, u64)>, String> {
    let (little, fields) = parse_bit_expr(expr)?;
    let mut buf = data.to_vec();
    if little {
        buf.reverse();
    }
    let total = buf.len() * 8;
    let mut cursor = 0usize;
    let mut out = Vec::with_capacity(fields.len());
    for field in fields {
        if cursor + field.bits > total {
            break;
        }
        let mut value = 0u64;
        for i in cursor..cursor + field.bits {
            let bit = (buf[i / 8] >> (7 - i % 8)) & 1;
            value = (value << 1) | bit as u64;
        }
        cursor += field.bits;
        out.push((field.name, value));
    }
    Ok(out)
}

fn bits_string(data: &[u8]) -> String {
    data.iter().map(|b| format!("{:08b}", b)).collect()
}

/// `"0100000101"` to bytes, MSB first, the last byte zero-padded
fn bits_to_bytes(bits: &str) -> Result<Vec<u8>, String> {
    let mut out = Vec::with_capacity(bits.len().div_ceil(8));
    for chunk in bits.as_bytes().chunks(8) {
        let mut byte = 0u8;
        for (i, c) in chunk.iter().enumerate() {
            match c {
                b'1' => byte |= 1 << (7 - i),
                b'0' => {},
                other => return Err(format!("invalid bit: {}", *other as char)),
            }
        }
        out.push(byte);
    }
    Ok(out)
}

/// Signed integer from up to 8 bytes
fn bytes_to_i64(little: bool, data: &[u8]) -> Result<i64, String> {
    if data.is_empty() || data.len() > 8 {
        return Err(format!("invalid integer length: {}", data.len()));
    }
    let mut be = data.to_vec();
    if little {
        be.reverse();
    }
    let fill = if be[0] & 0x80 != 0 { 0xFF } else { 0x00 };
    let mut raw = [fill; 8];
    raw[8 - be.len()..].copy_from_slice(&be);
    Ok(i64::from_be_bytes(raw))
}

fn f32_of(little: bool, data: &[u8]) -> Result<f64, String> {
    let raw: [u8; 4] = data
        .get(..4)
        .and_then(|s| s.try_into().ok())
        .ok_or_else(|| format!("need 4 bytes, got {}", data.len()))?;
    let v = if little {
        f32::from_le_bytes(raw)
    } else {
        f32::from_be_bytes(raw)
    };
    Ok(v as f64)
}

fn f64_of(little: bool, data: &[u8]) -> Result<f64, String> {
    let raw: [u8; 8] = data
        .get(..8)
        .and_then(|s| s.try_into().ok())
        .ok_or_else(|| format!("need 8 bytes, got {}", data.len()))?;
    Ok(if little {
        f64::from_le_bytes(raw)
    } else {
        f64::from_be_bytes(raw)
    })
}

fn fields_table<'lua>(lua: &'lua Lua, fields: Vec<(String, u64)>) -> mlua::Result<mlua::Table<'lua>> {
    let table = lua.create_table()?;
    for (name, value) in fields {
        table.raw_set(name, value)?;
    }
    Ok(table)
}

pub(super) fn install(lua: &Lua) -> mlua::Result<()> {
    let ns = Namespace::new(lua, "binary")?;

    ns.add("MB", |lua, (expr, data): (String, Value)| {
        match match_bits(&expr, &bytes_arg(data)?) {
            Ok(fields) => Ok((Some(fields_table(lua, fields)?), None)),
            Err(e) => Ok((None, Some(e))),
        }
    })?;

    ns.add("MBHex", |lua, (expr, hex_str): (String, String)| {
        let fields = hex::decode(&hex_str)
            .map_err(|e| e.to_string())
            .and_then(|data| match_bits(&expr, &data));
        match fields {
            Ok(fields) => Ok((Some(fields_table(lua, fields)?), None)),
            Err(e) => Ok((None, Some(e))),
        }
    })?;

    ns.add("B2BS", |_, data: Value| Ok(bits_string(&bytes_arg(data)?)))?;

    ns.add("Bit", |_, (byte, index): (i64, u32)| {
        if index > 7 {
            return Err(mlua::Error::runtime(format!("bit index out of range: {}", index)));
        }
        Ok(((byte >> index) & 1) as u8)
    })?;

    ns.add("B2I64", |_, (endian, data): (String, Value)| {
        Ok(pair(bytes_to_i64(endian == "<", &bytes_arg(data)?)))
    })?;

    ns.add("B64S2B", |lua, text: String| {
        match base64::engine::general_purpose::STANDARD.decode(text.trim()) {
            Ok(bytes) => Ok((Some(lua.create_sequence_from(bytes)?), None)),
            Err(e) => Ok((None, Some(e.to_string()))),
        }
    })?;

    ns.add("BS2B", |lua, bits: String| match bits_to_bytes(&bits) {
        Ok(bytes) => Ok((Some(lua.create_sequence_from(bytes)?), None)),
        Err(e) => Ok((None, Some(e))),
    })?;

    for (name, little) in [("Bin2F32", false), ("Bin2F32Big", false), ("Bin2F32Little", true)] {
        ns.add(name, move |_, data: Value| Ok(pair(f32_of(little, &bytes_arg(data)?))))?;
    }
    for (name, little) in [("Bin2F64", false), ("Bin2F64Big", false), ("Bin2F64Little", true)] {
        ns.add(name, move |_, data: Value| Ok(pair(f64_of(little, &bytes_arg(data)?))))?;
    }
    ns.register()
}
