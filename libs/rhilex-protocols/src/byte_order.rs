//! Byte/word order handling and point value decoding
//!
//! Uses ABCD notation where A is the most significant byte. For the 32-bit
//! value `0x12345678`:
//! - `ABCD`: [0x12, 0x34, 0x56, 0x78]
//! - `DCBA`: [0x78, 0x56, 0x34, 0x12]
//! - `CDAB`: [0x56, 0x78, 0x12, 0x34] (Modbus common)
//! - `BADC`: [0x34, 0x12, 0x78, 0x56]

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ByteOrder {
    /// ABCD
    BigEndian,
    /// DCBA
    LittleEndian,
    /// CDAB
    BigEndianSwap,
    /// BADC
    LittleEndianSwap,
    /// AB, 16-bit only
    BigEndian16,
    /// BA, 16-bit only
    LittleEndian16,
}

impl ByteOrder {
    /// Accepts `ABCD`/`AB-CD` style strings as well as `BE`/`LE`
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        let normalized = s.to_uppercase().replace('-', "");
        match normalized.as_str() {
            "ABCD" | "BE" | "BIG_ENDIAN" | "BIGENDIAN" | "ABCDEFGH" => Some(Self::BigEndian),
            "DCBA" | "LE" | "LITTLE_ENDIAN" | "LITTLEENDIAN" | "HGFEDCBA" => {
                Some(Self::LittleEndian)
            },
            "CDAB" | "BIG_ENDIAN_SWAP" => Some(Self::BigEndianSwap),
            "BADC" | "LITTLE_ENDIAN_SWAP" => Some(Self::LittleEndianSwap),
            "AB" => Some(Self::BigEndian16),
            "BA" => Some(Self::LittleEndian16),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BigEndian => "ABCD",
            Self::LittleEndian => "DCBA",
            Self::BigEndianSwap => "CDAB",
            Self::LittleEndianSwap => "BADC",
            Self::BigEndian16 => "AB",
            Self::LittleEndian16 => "BA",
        }
    }

    /// Rearrange 2 received bytes into big-endian order
    pub fn to_be_2(&self, b: [u8; 2]) -> [u8; 2] {
        match self {
            Self::LittleEndian | Self::LittleEndian16 | Self::LittleEndianSwap => [b[1], b[0]],
            _ => b,
        }
    }

    /// Rearrange 4 received bytes into big-endian order
    pub fn to_be_4(&self, b: [u8; 4]) -> [u8; 4] {
        match self {
            Self::BigEndian | Self::BigEndian16 => b,
            Self::LittleEndian | Self::LittleEndian16 => [b[3], b[2], b[1], b[0]],
            Self::BigEndianSwap => [b[2], b[3], b[0], b[1]],
            Self::LittleEndianSwap => [b[1], b[0], b[3], b[2]],
        }
    }

    /// Rearrange 8 received bytes into big-endian order
    pub fn to_be_8(&self, b: [u8; 8]) -> [u8; 8] {
        match self {
            Self::LittleEndian | Self::LittleEndian16 => {
                let mut out = b;
                out.reverse();
                out
            },
            Self::BigEndianSwap => [b[6], b[7], b[4], b[5], b[2], b[3], b[0], b[1]],
            Self::LittleEndianSwap => [b[1], b[0], b[3], b[2], b[5], b[4], b[7], b[6]],
            _ => b,
        }
    }

    /// Apply this order to an arbitrary buffer, 4 bytes at a time; a
    /// trailing 2-byte remainder is treated as one 16-bit word
    pub fn reorder(&self, data: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(data.len());
        let mut chunks = data.chunks_exact(4);
        for c in &mut chunks {
            out.extend_from_slice(&self.to_be_4([c[0], c[1], c[2], c[3]]));
        }
        let rest = chunks.remainder();
        if rest.len() == 2 {
            out.extend_from_slice(&self.to_be_2([rest[0], rest[1]]));
        } else {
            out.extend_from_slice(rest);
        }
        out
    }
}

/// Order used when a point leaves `dataOrder` empty
pub fn default_data_order<'a>(data_type: &str, order: &'a str) -> &'a str {
    if !order.is_empty() {
        return order;
    }
    match data_type {
        "INT" | "UINT" | "INT32" | "UINT32" | "FLOAT" | "FLOAT32" | "UFLOAT32" => "DCBA",
        "BYTE" | "I" | "Q" => "A",
        "INT16" | "UINT16" | "SHORT" | "USHORT" => "BA",
        "LONG" | "ULONG" | "INT64" | "UINT64" | "DOUBLE" | "FLOAT64" => "HGFEDCBA",
        _ => "",
    }
}

fn fixed<const N: usize>(bytes: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    let n = bytes.len().min(N);
    out[..n].copy_from_slice(&bytes[..n]);
    out
}

fn scaled(raw: f64, integer: String, weight: f32) -> String {
    if weight == 1.0 {
        integer
    } else {
        format!("{:.4}", raw * f64::from(weight))
    }
}

fn trim_nul(bytes: &[u8]) -> &[u8] {
    let end = bytes.iter().rposition(|b| *b != 0).map_or(0, |i| i + 1);
    &bytes[..end]
}

/// Decode the register bytes of one point into its string value
///
/// Integers are printed as-is when `weight == 1`, otherwise scaled and
/// printed with four decimals; floats always use four decimals. Unknown
/// type/order combinations decode to `"0"`.
pub fn parse_modbus_value(data_type: &str, data_order: &str, weight: f32, bytes: &[u8]) -> String {
    let data_type = data_type.to_ascii_uppercase();
    let order_str = default_data_order(&data_type, data_order).to_ascii_uppercase();
    let order = ByteOrder::from_str(&order_str);

    match data_type.as_str() {
        "UTF8" => {
            let text = trim_nul(bytes);
            match order_str.as_str() {
                "LITTLE_ENDIAN" => text.iter().rev().map(|b| *b as char).collect(),
                _ => String::from_utf8_lossy(text).into_owned(),
            }
        },
        "RAW" => hex::encode(trim_nul(bytes)),
        "BYTE" => bytes.first().copied().unwrap_or(0).to_string(),
        "BOOL" | "BIT" => (bytes.first().copied().unwrap_or(0) & 0x01).to_string(),
        "SHORT" | "INT16" => match order {
            Some(o) => {
                let v = i16::from_be_bytes(o.to_be_2(fixed(bytes)));
                scaled(f64::from(v), v.to_string(), weight)
            },
            None => "0".to_string(),
        },
        "USHORT" | "UINT16" => match order {
            Some(o) => {
                let v = u16::from_be_bytes(o.to_be_2(fixed(bytes)));
                scaled(f64::from(v), v.to_string(), weight)
            },
            None => "0".to_string(),
        },
        "INT" | "INT32" => match order {
            Some(o) => {
                let v = i32::from_be_bytes(o.to_be_4(fixed(bytes)));
                scaled(f64::from(v), v.to_string(), weight)
            },
            None => "0".to_string(),
        },
        "UINT" | "UINT32" => match order {
            Some(o) => {
                let v = u32::from_be_bytes(o.to_be_4(fixed(bytes)));
                scaled(f64::from(v), v.to_string(), weight)
            },
            None => "0".to_string(),
        },
        "LONG" | "INT64" => match order {
            Some(o) => {
                let v = i64::from_be_bytes(o.to_be_8(fixed(bytes)));
                scaled(v as f64, v.to_string(), weight)
            },
            None => "0".to_string(),
        },
        "ULONG" | "UINT64" => match order {
            Some(o) => {
                let v = u64::from_be_bytes(o.to_be_8(fixed(bytes)));
                scaled(v as f64, v.to_string(), weight)
            },
            None => "0".to_string(),
        },
        "FLOAT" | "FLOAT32" | "UFLOAT32" => match order {
            Some(o) => {
                let v = f32::from_be_bytes(o.to_be_4(fixed(bytes)));
                let v = if data_type == "UFLOAT32" { v.abs() } else { v };
                format!("{:.4}", v * weight)
            },
            None => "0".to_string(),
        },
        "DOUBLE" | "FLOAT64" => match order {
            Some(o) => {
                let v = f64::from_be_bytes(o.to_be_8(fixed(bytes)));
                format!("{:.4}", v * f64::from(weight))
            },
            None => "0".to_string(),
        },
        _ => "0".to_string(),
    }
}

/// Number of 16-bit registers a data type occupies
pub fn register_count(data_type: &str) -> u16 {
    match data_type.to_ascii_uppercase().as_str() {
        "INT" | "UINT" | "INT32" | "UINT32" | "FLOAT" | "FLOAT32" | "UFLOAT32" => 2,
        "LONG" | "ULONG" | "INT64" | "UINT64" | "DOUBLE" | "FLOAT64" => 4,
        _ => 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_int16_orders() {
        assert_eq!(parse_modbus_value("INT16", "AB", 1.0, &[0x00, 0x2A]), "42");
        assert_eq!(parse_modbus_value("INT16", "BA", 1.0, &[0x2A, 0x00]), "42");
        assert_eq!(parse_modbus_value("INT16", "AB", 1.0, &[0xFF, 0xFE]), "-2");
        assert_eq!(parse_modbus_value("UINT16", "AB", 1.0, &[0xFF, 0xFE]), "65534");
        // empty order falls back to BA
        assert_eq!(parse_modbus_value("INT16", "", 1.0, &[0x2A, 0x00]), "42");
    }

    #[test]
    fn test_weight_switches_to_decimal() {
        assert_eq!(parse_modbus_value("INT16", "AB", 0.1, &[0x00, 0x64]), "10.0000");
        assert_eq!(parse_modbus_value("UINT32", "ABCD", 2.0, &[0, 0, 0, 3]), "6.0000");
    }

    #[test]
    fn test_int32_word_orders() {
        let abcd = [0x12, 0x34, 0x56, 0x78];
        let expected = 0x12345678_i32.to_string();
        assert_eq!(parse_modbus_value("INT32", "ABCD", 1.0, &abcd), expected);
        assert_eq!(parse_modbus_value("INT32", "DCBA", 1.0, &[0x78, 0x56, 0x34, 0x12]), expected);
        assert_eq!(parse_modbus_value("INT32", "CDAB", 1.0, &[0x56, 0x78, 0x12, 0x34]), expected);
        assert_eq!(parse_modbus_value("INT32", "BADC", 1.0, &[0x34, 0x12, 0x78, 0x56]), expected);
    }

    #[test]
    fn test_float_and_text() {
        assert_eq!(parse_modbus_value("FLOAT32", "ABCD", 1.0, &[0x40, 0x49, 0x0F, 0xDC]), "3.1416");
        assert_eq!(parse_modbus_value("FLOAT", "DCBA", 1.0, &[0xDC, 0x0F, 0x49, 0x40]), "3.1416");
        assert_eq!(parse_modbus_value("UTF8", "BIG_ENDIAN", 1.0, b"abc\0\0"), "abc");
        assert_eq!(parse_modbus_value("UTF8", "LITTLE_ENDIAN", 1.0, b"abc\0"), "cba");
        assert_eq!(parse_modbus_value("RAW", "", 1.0, &[0x01, 0xAB, 0, 0]), "01ab");
        assert_eq!(parse_modbus_value("BYTE", "", 1.0, &[7]), "7");
        assert_eq!(parse_modbus_value("WHATEVER", "AB", 1.0, &[1, 2]), "0");
    }

    #[test]
    fn test_reorder_buffer() {
        assert_eq!(
            ByteOrder::LittleEndian.reorder(&[1, 2, 3, 4, 5, 6]),
            vec![4, 3, 2, 1, 6, 5]
        );
        assert_eq!(register_count("float32"), 2);
        assert_eq!(register_count("INT16"), 1);
    }
}
