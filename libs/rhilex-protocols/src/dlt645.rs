//! DL/T645-2007 frame codec
//!
//! ```text
//! [FE..FE] 68 A0..A5 68 C L D0..Dn CS 16
//! ```
//! Address is 12 BCD digits stored low byte first. Every data byte is sent
//! with 0x33 added. CS is the byte sum from the first 0x68 through the data.

use crate::error::{ProtocolError, Result};

const START: u8 = 0x68;
const END: u8 = 0x16;
const PREAMBLE: u8 = 0xFE;
const DATA_OFFSET: u8 = 0x33;
/// Header (68 + address + 68 + C + L) before the data field
const HEADER_LEN: usize = 10;

pub mod control {
    pub const BROADCAST_TIME: u8 = 0x08;
    pub const READ_DATA: u8 = 0x11;
    pub const READ_NEXT: u8 = 0x12;
    pub const READ_ADDRESS: u8 = 0x13;
    pub const WRITE_DATA: u8 = 0x14;
    /// Set on slave responses
    pub const RESPONSE_FLAG: u8 = 0x80;
    /// Set on abnormal slave responses
    pub const ERROR_FLAG: u8 = 0x40;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dlt645Frame {
    /// Meter id as 12 decimal digits, most significant first
    pub address: String,
    pub control: u8,
    /// Plain data, without the 0x33 offset
    pub data: Vec<u8>,
}

impl Dlt645Frame {
    pub fn new(address: impl Into<String>, control: u8, data: Vec<u8>) -> Self {
        Self {
            address: address.into(),
            control,
            data,
        }
    }

    /// Read request for a 4-byte data identifier (DI3..DI0 as written in the tables)
    pub fn read_request(address: impl Into<String>, data_id: u32) -> Self {
        Self::new(address, control::READ_DATA, data_id.to_le_bytes().to_vec())
    }

    pub fn is_response(&self) -> bool {
        self.control & control::RESPONSE_FLAG != 0
    }

    pub fn is_error(&self) -> bool {
        self.control & control::ERROR_FLAG != 0
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        if self.data.len() > u8::MAX as usize {
            return Err(ProtocolError::InvalidParameter(format!(
                "data field too long: {}",
                self.data.len()
            )));
        }
        let address = encode_address(&self.address)?;

        let mut frame = Vec::with_capacity(HEADER_LEN + self.data.len() + 2);
        frame.push(START);
        frame.extend_from_slice(&address);
        frame.push(START);
        frame.push(self.control);
        frame.push(self.data.len() as u8);
        frame.extend(self.data.iter().map(|b| b.wrapping_add(DATA_OFFSET)));
        frame.push(checksum(&frame));
        frame.push(END);
        Ok(frame)
    }

    /// Decode one frame, skipping any wake-up preamble
    pub fn decode(raw: &[u8]) -> Result<Self> {
        let skip = raw.iter().take_while(|b| **b == PREAMBLE).count();
        let frame = &raw[skip..];
        if frame.len() < HEADER_LEN + 2 {
            return Err(ProtocolError::Frame(format!(
                "DL/T645 frame too short: {} bytes",
                frame.len()
            )));
        }
        if frame[0] != START || frame[7] != START {
            return Err(ProtocolError::Frame("missing DL/T645 start byte".to_string()));
        }
        let len = frame[9] as usize;
        let total = HEADER_LEN + len + 2;
        if frame.len() < total {
            return Err(ProtocolError::Frame(format!(
                "DL/T645 frame truncated: need {} bytes, got {}",
                total,
                frame.len()
            )));
        }
        if frame[total - 1] != END {
            return Err(ProtocolError::Frame("missing DL/T645 end byte".to_string()));
        }
        let expected = checksum(&frame[..HEADER_LEN + len]);
        let actual = frame[HEADER_LEN + len];
        if expected != actual {
            return Err(ProtocolError::Checksum { expected, actual });
        }

        Ok(Self {
            address: decode_address(&frame[1..7]),
            control: frame[8],
            data: frame[HEADER_LEN..HEADER_LEN + len]
                .iter()
                .map(|b| b.wrapping_sub(DATA_OFFSET))
                .collect(),
        })
    }
}

fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |acc, b| acc.wrapping_add(*b))
}

fn encode_address(address: &str) -> Result<[u8; 6]> {
    if address.len() > 12 || !address.chars().all(|c| c.is_ascii_digit()) {
        return Err(ProtocolError::InvalidParameter(format!(
            "meter address must be up to 12 digits: {}",
            address
        )));
    }
    let padded = format!("{:0>12}", address);
    let digits = padded.as_bytes();
    let mut out = [0u8; 6];
    for (i, pair) in digits.chunks(2).enumerate() {
        // most significant pair goes last on the wire
        out[5 - i] = ((pair[0] - b'0') << 4) | (pair[1] - b'0');
    }
    Ok(out)
}

fn decode_address(bytes: &[u8]) -> String {
    bytes.iter().rev().map(|b| format!("{:02x}", b)).collect()
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_layout() {
        let frame = Dlt645Frame::read_request("000000000001", 0x0001_0000)
            .encode()
            .unwrap();
        assert_eq!(
            frame,
            vec![
                0x68, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x68, 0x11, 0x04, 0x33, 0x33, 0x34,
                0x33, 0xB3, 0x16
            ]
        );
    }

    #[test]
    fn test_decode_preserves_fields() {
        let frame = Dlt645Frame::new("202312345678", 0x91, vec![0x00, 0x00, 0x01, 0x00, 0x56, 0x12]);
        let mut wire = vec![0xFE, 0xFE, 0xFE, 0xFE];
        wire.extend(frame.encode().unwrap());

        let decoded = Dlt645Frame::decode(&wire).unwrap();
        assert_eq!(decoded, frame);
        assert!(decoded.is_response());
        assert!(!decoded.is_error());
    }

    #[test]
    fn test_short_address_is_zero_padded() {
        let wire = Dlt645Frame::new("42", control::READ_ADDRESS, Vec::new()).encode().unwrap();
        assert_eq!(&wire[1..7], &[0x42, 0, 0, 0, 0, 0]);
        assert_eq!(Dlt645Frame::decode(&wire).unwrap().address, "000000000042");
    }

    #[test]
    fn test_decode_rejects_bad_checksum() {
        let mut wire = Dlt645Frame::read_request("000000000001", 0).encode().unwrap();
        let cs = wire.len() - 2;
        wire[cs] ^= 0xFF;
        assert!(matches!(
            Dlt645Frame::decode(&wire),
            Err(ProtocolError::Checksum { .. })
        ));
        assert!(Dlt645Frame::encode(&Dlt645Frame::new("12ab", 0x11, vec![])).is_err());
    }
}
