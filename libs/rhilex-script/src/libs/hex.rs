//! `hex`: hex string slicing, matching and byte-order helpers

use std::sync::OnceLock;

use mlua::Lua;
use regex::Regex;
use rhilex_protocols::ByteOrder;

use super::{pair, Namespace};

/// Named byte range cut out of a hex string
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct HexSegment {
    pub name: String,
    pub value: Vec<u8>,
}

impl HexSegment {
    pub fn to_hex_upper(&self) -> String {
        hex::encode_upper(&self.value)
    }

    /// Big-endian integer of the leading 1, 2, 4 or 8 bytes, picked by the
    /// segment length
    pub fn to_uint(&self) -> u64 {
        let v = &self.value;
        match v.len() {
            0 => 0,
            1 => v[0] as u64,
            2 | 3 => u16::from_be_bytes([v[0], v[1]]) as u64,
            4..=7 => u32::from_be_bytes([v[0], v[1], v[2], v[3]]) as u64,
            _ => u64::from_be_bytes([v[0], v[1], v[2], v[3], v[4], v[5], v[6], v[7]]),
        }
    }
}

fn segment_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"([a-zA-Z0-9]+):\[([0-9]+),([0-9]+)\]").unwrap_or_else(|_| unreachable!())
    })
}

/// Hex digits of bytes `start..=end`, empty when the range is unusable
fn sub_hex(hex_str: &str, start: usize, end: usize) -> &str {
    if start > end || (end + 1) * 2 > hex_str.len() {
        return "";
    }
    hex_str.get(start * 2..(end + 1) * 2).unwrap_or("")
}

/// Cut `hex_str` by an expression like `"age:[1,2];sex:[4,5]"` (inclusive
/// byte indexes)
pub(crate) fn match_hex(expr: &str, hex_str: &str) -> Vec<HexSegment> {
    segment_regex()
        .captures_iter(expr)
        .map(|c| {
            let start = c[2].parse::<usize>().unwrap_or(usize::MAX);
            let end = c[3].parse::<usize>().unwrap_or(0);
            HexSegment {
                name: c[1].to_string(),
                value: hex::decode(sub_hex(hex_str, start, end)).unwrap_or_default(),
            }
        })
        .collect()
}

fn bytes_to_uint(bytes: &[u8]) -> Result<u64, String> {
    if bytes.len() > 8 {
        return Err(format!("too many bytes for an integer: {}", bytes.len()));
    }
    Ok(bytes.iter().fold(0u64, |acc, b| (acc << 8) | *b as u64))
}

fn hex_to_uint(hex_str: &str) -> Result<u64, String> {
    let bytes = hex::decode(hex_str).map_err(|e| e.to_string())?;
    bytes_to_uint(&bytes)
}

fn reorder_hex(order: ByteOrder, hex_str: &str) -> Result<String, String> {
    let bytes = hex::decode(hex_str).map_err(|e| e.to_string())?;
    Ok(hex::encode_upper(order.reorder(&bytes)))
}

pub(super) fn install(lua: &Lua) -> mlua::Result<()> {
    let ns = Namespace::new(lua, "hex")?;

    ns.add("HToN", |_, hex_str: String| Ok(pair(hex_to_uint(&hex_str))))?;

    ns.add(
        "HsubToN",
        |_, (hex_str, start, end): (String, usize, usize)| {
            let sub = sub_hex(&hex_str, start, end);
            if sub.is_empty() {
                return Ok((None, Some(format!("invalid range [{},{}]", start, end))));
            }
            Ok(pair(hex_to_uint(sub)))
        },
    )?;

    ns.add("MatchHex", |lua, (expr, hex_str): (String, String)| {
        let table = lua.create_table()?;
        for seg in match_hex(&expr, &hex_str) {
            table.raw_set(seg.name.as_str(), seg.to_hex_upper())?;
        }
        Ok(table)
    })?;

    ns.add("MatchUInt", |lua, (expr, hex_str): (String, String)| {
        let table = lua.create_table()?;
        for seg in match_hex(&expr, &hex_str) {
            table.raw_set(seg.name.as_str(), seg.to_uint())?;
        }
        Ok(table)
    })?;

    ns.add("Hexs2Bytes", |lua, hex_str: String| match hex::decode(&hex_str) {
        Ok(bytes) => Ok((Some(lua.create_sequence_from(bytes)?), None)),
        Err(e) => Ok((None, Some(e.to_string()))),
    })?;

    ns.add("Bytes2Hexs", |_, bytes: mlua::String| {
        Ok((hex::encode(bytes.as_bytes()), None::<String>))
    })?;

    for (name, order) in [
        ("ABCD", ByteOrder::BigEndian),
        ("DCBA", ByteOrder::LittleEndian),
        ("BADC", ByteOrder::LittleEndianSwap),
        ("CDAB", ByteOrder::BigEndianSwap),
    ] {
        ns.add(name, move |_, hex_str: String| Ok(pair(reorder_hex(order, &hex_str))))?;
    }
    ns.register()
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use super::*;
    use crate::libs::testing::vm;

    #[test]
    fn test_match_hex_segments() {
        let segs = match_hex("age:[1,2];sex:[4,5];bad:[6,99]", "FFFFFF014CB2AA55");
        assert_eq!(segs.len(), 3);
        assert_eq!(segs[0].to_hex_upper(), "FFFF");
        assert_eq!(segs[1].to_hex_upper(), "4CB2");
        assert!(segs[2].value.is_empty());
        assert_eq!(segs[1].to_uint(), 0x4CB2);
        assert_eq!(segs[2].to_uint(), 0);
    }

    #[test]
    fn test_uint_width_follows_length() {
        let three = HexSegment {
            name: "x".into(),
            value: vec![0x01, 0x02, 0x03],
        };
        assert_eq!(three.to_uint(), 0x0102);
    }

    #[test]
    fn test_lua_surface() {
        let lua = vm();
        let (age, n, swapped, bytes_len, bad): (String, u64, String, i64, String) = lua
            .load(
                r#"
                local t = hex:MatchHex("age:[1,2]", "FFFFFF014CB2AA55")
                local n = hex:HToN("0102")
                local swapped = hex:CDAB("01020304")
                local bytes = hex:Hexs2Bytes("0A0B0C")
                local _, err = hex:Hexs2Bytes("zz")
                return t.age, n, swapped, #bytes, err
                "#,
            )
            .eval()
            .unwrap();
        assert_eq!(age, "FFFF");
        assert_eq!(n, 0x0102);
        assert_eq!(swapped, "03040102");
        assert_eq!(bytes_len, 3);
        assert!(!bad.is_empty());
    }
}
