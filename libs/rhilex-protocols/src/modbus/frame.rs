//! TCP (MBAP) and RTU (CRC) framing

use tracing::debug;

use super::constants;
use super::pdu::ModbusPdu;
use crate::crc::crc16_modbus;
use crate::error::{ProtocolError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameMode {
    Tcp,
    Rtu,
}

/// Decoded MBAP header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MbapHeader {
    pub transaction_id: u16,
    pub protocol_id: u16,
    pub length: u16,
    pub unit_id: u8,
}

/// Wraps PDUs into ADUs and validates replies against the last request
#[derive(Debug)]
pub struct ModbusFrameProcessor {
    mode: FrameMode,
    next_transaction_id: u16,
    /// (transaction id, unit id, function code) of the request in flight
    pending: Option<(u16, u8, u8)>,
}

impl ModbusFrameProcessor {
    pub fn new(mode: FrameMode) -> Self {
        Self {
            mode,
            next_transaction_id: 1,
            pending: None,
        }
    }

    pub fn mode(&self) -> FrameMode {
        self.mode
    }

    fn next_transaction_id(&mut self) -> u16 {
        let id = self.next_transaction_id;
        self.next_transaction_id = self.next_transaction_id.wrapping_add(1);
        id
    }

    pub fn build_frame(&mut self, unit_id: u8, pdu: &ModbusPdu) -> Vec<u8> {
        let fc = pdu.function_code().unwrap_or(0);
        match self.mode {
            FrameMode::Tcp => {
                let tid = self.next_transaction_id();
                self.pending = Some((tid, unit_id, fc));
                build_tcp_frame(tid, unit_id, pdu)
            },
            FrameMode::Rtu => {
                self.pending = Some((0, unit_id, fc));
                build_rtu_frame(unit_id, pdu)
            },
        }
    }

    /// Parse a reply and check it answers the request in flight
    pub fn parse_frame(&mut self, data: &[u8]) -> Result<(u8, ModbusPdu)> {
        let (tid, unit_id, pdu) = match self.mode {
            FrameMode::Tcp => {
                let (header, pdu) = parse_tcp_frame(data)?;
                (header.transaction_id, header.unit_id, pdu)
            },
            FrameMode::Rtu => {
                let (unit_id, pdu) = parse_rtu_frame(data)?;
                (0, unit_id, pdu)
            },
        };

        if let Some((want_tid, want_unit, want_fc)) = self.pending {
            let fc = pdu.function_code().map(|f| f & 0x7F).unwrap_or(0);
            if tid != want_tid || unit_id != want_unit || fc != want_fc {
                debug!(
                    "Ignoring reply tid={:04X} unit={} fc={:02X}, expected tid={:04X} unit={} fc={:02X}",
                    tid, unit_id, fc, want_tid, want_unit, want_fc
                );
                return Err(ProtocolError::Frame(
                    "Response ignored - transaction/FC/slave mismatch".to_string(),
                ));
            }
            self.pending = None;
        }
        Ok((unit_id, pdu))
    }
}

pub fn build_tcp_frame(transaction_id: u16, unit_id: u8, pdu: &ModbusPdu) -> Vec<u8> {
    let length = (pdu.len() + 1) as u16;
    let mut frame = Vec::with_capacity(constants::mbap_frame_size(pdu.len()));
    frame.extend_from_slice(&transaction_id.to_be_bytes());
    frame.extend_from_slice(&0u16.to_be_bytes());
    frame.extend_from_slice(&length.to_be_bytes());
    frame.push(unit_id);
    frame.extend_from_slice(pdu.as_slice());
    frame
}

pub fn build_rtu_frame(unit_id: u8, pdu: &ModbusPdu) -> Vec<u8> {
    let mut frame = Vec::with_capacity(1 + pdu.len() + 2);
    frame.push(unit_id);
    frame.extend_from_slice(pdu.as_slice());
    let crc = crc16_modbus(&frame);
    frame.extend_from_slice(&crc.to_le_bytes());
    frame
}

pub fn parse_mbap_header(data: &[u8]) -> Result<MbapHeader> {
    if data.len() < constants::MBAP_HEADER_LEN + 1 {
        return Err(ProtocolError::Frame("TCP frame too short".to_string()));
    }
    let header = MbapHeader {
        transaction_id: u16::from_be_bytes([data[0], data[1]]),
        protocol_id: u16::from_be_bytes([data[2], data[3]]),
        length: u16::from_be_bytes([data[4], data[5]]),
        unit_id: data[6],
    };
    if header.protocol_id != 0 {
        return Err(ProtocolError::Frame(format!(
            "Invalid protocol ID: expected 0, got {}",
            header.protocol_id
        )));
    }
    if header.length == 0 || header.length as usize > constants::MAX_MBAP_LENGTH {
        return Err(ProtocolError::Frame(format!(
            "Invalid TCP frame length: {}",
            header.length
        )));
    }
    Ok(header)
}

pub fn parse_tcp_frame(data: &[u8]) -> Result<(MbapHeader, ModbusPdu)> {
    let header = parse_mbap_header(data)?;
    let expected = constants::MBAP_HEADER_LEN + header.length as usize;
    if data.len() != expected {
        return Err(ProtocolError::Frame(format!(
            "Invalid TCP frame length: expected {}, got {}",
            expected,
            data.len()
        )));
    }
    let pdu = ModbusPdu::from_slice(&data[constants::MBAP_HEADER_LEN + 1..])?;
    Ok((header, pdu))
}

pub fn parse_rtu_frame(data: &[u8]) -> Result<(u8, ModbusPdu)> {
    if data.len() < 4 {
        return Err(ProtocolError::Frame("RTU frame too short".to_string()));
    }
    let n = data.len();
    let received = u16::from_le_bytes([data[n - 2], data[n - 1]]);
    let calculated = crc16_modbus(&data[..n - 2]);
    if received != calculated {
        return Err(ProtocolError::Crc {
            expected: calculated,
            actual: received,
        });
    }
    Ok((data[0], ModbusPdu::from_slice(&data[1..n - 2])?))
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use super::*;
    use crate::modbus::pdu::PduBuilder;

    #[test]
    fn test_tcp_frame_and_reply_matching() {
        let mut fp = ModbusFrameProcessor::new(FrameMode::Tcp);
        let pdu = PduBuilder::build_read_request(0x03, 0, 2).unwrap();
        let frame = fp.build_frame(1, &pdu);
        assert_eq!(frame, vec![0x00, 0x01, 0x00, 0x00, 0x00, 0x06, 0x01, 0x03, 0x00, 0x00, 0x00, 0x02]);

        // wrong transaction id
        let stale = [0x00, 0x09, 0x00, 0x00, 0x00, 0x05, 0x01, 0x03, 0x02, 0x00, 0x2A];
        assert!(fp.parse_frame(&stale).is_err());

        let reply = [0x00, 0x01, 0x00, 0x00, 0x00, 0x05, 0x01, 0x03, 0x02, 0x00, 0x2A];
        let (unit, pdu) = fp.parse_frame(&reply).unwrap();
        assert_eq!(unit, 1);
        assert_eq!(pdu.as_slice(), &[0x03, 0x02, 0x00, 0x2A]);
    }

    #[test]
    fn test_rtu_frame_crc() {
        let pdu = PduBuilder::build_read_request(0x03, 0, 10).unwrap();
        let frame = build_rtu_frame(1, &pdu);
        assert_eq!(frame, vec![0x01, 0x03, 0x00, 0x00, 0x00, 0x0A, 0xC5, 0xCD]);
        let (unit, parsed) = parse_rtu_frame(&frame).unwrap();
        assert_eq!(unit, 1);
        assert_eq!(parsed, pdu);

        let mut corrupt = frame.clone();
        corrupt[3] ^= 0x01;
        assert!(matches!(parse_rtu_frame(&corrupt), Err(ProtocolError::Crc { .. })));
    }

    #[test]
    fn test_bad_mbap_rejected() {
        assert!(parse_tcp_frame(&[0, 1, 0, 1, 0, 2, 1, 3]).is_err());
        assert!(parse_tcp_frame(&[0, 1, 0, 0, 0, 0, 1]).is_err());
    }
}
