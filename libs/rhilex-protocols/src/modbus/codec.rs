//! Modbus request/response encoding

use super::constants::{self, *};
use super::pdu::{ModbusPdu, PduBuilder};
use crate::error::{ProtocolError, Result};

/// Request PDU, as parsed by a slave or built by a master
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModbusRequest {
    ReadCoils { address: u16, quantity: u16 },
    ReadDiscreteInputs { address: u16, quantity: u16 },
    ReadHoldingRegisters { address: u16, quantity: u16 },
    ReadInputRegisters { address: u16, quantity: u16 },
    WriteSingleCoil { address: u16, value: bool },
    WriteSingleRegister { address: u16, value: u16 },
    WriteMultipleCoils { address: u16, values: Vec<bool> },
    WriteMultipleRegisters { address: u16, values: Vec<u16> },
}

impl ModbusRequest {
    pub fn function_code(&self) -> u8 {
        match self {
            Self::ReadCoils { .. } => FC_READ_COILS,
            Self::ReadDiscreteInputs { .. } => FC_READ_DISCRETE_INPUTS,
            Self::ReadHoldingRegisters { .. } => FC_READ_HOLDING_REGISTERS,
            Self::ReadInputRegisters { .. } => FC_READ_INPUT_REGISTERS,
            Self::WriteSingleCoil { .. } => FC_WRITE_SINGLE_COIL,
            Self::WriteSingleRegister { .. } => FC_WRITE_SINGLE_REGISTER,
            Self::WriteMultipleCoils { .. } => FC_WRITE_MULTIPLE_COILS,
            Self::WriteMultipleRegisters { .. } => FC_WRITE_MULTIPLE_REGISTERS,
        }
    }

    pub fn to_pdu(&self) -> Result<ModbusPdu> {
        match self {
            Self::ReadCoils { address, quantity }
            | Self::ReadDiscreteInputs { address, quantity }
            | Self::ReadHoldingRegisters { address, quantity }
            | Self::ReadInputRegisters { address, quantity } => {
                PduBuilder::build_read_request(self.function_code(), *address, *quantity)
            },
            Self::WriteSingleCoil { address, value } => {
                ModbusCodec::build_fc05_single_coil_pdu(*address, *value)
            },
            Self::WriteSingleRegister { address, value } => {
                ModbusCodec::build_fc06_single_register_pdu(*address, *value)
            },
            Self::WriteMultipleCoils { address, values } => {
                ModbusCodec::build_fc15_multiple_coils_pdu(*address, values)
            },
            Self::WriteMultipleRegisters { address, values } => {
                ModbusCodec::build_fc16_multiple_registers_pdu(*address, values)
            },
        }
    }

    pub fn parse(pdu: &ModbusPdu) -> Result<Self> {
        let data = pdu.as_slice();
        let fc = pdu
            .function_code()
            .ok_or_else(|| ProtocolError::Frame("empty request PDU".to_string()))?;
        let address = pdu.u16_at(1)?;
        let word = pdu.u16_at(3)?;
        let request = match fc {
            FC_READ_COILS => Self::ReadCoils { address, quantity: word },
            FC_READ_DISCRETE_INPUTS => Self::ReadDiscreteInputs { address, quantity: word },
            FC_READ_HOLDING_REGISTERS => Self::ReadHoldingRegisters { address, quantity: word },
            FC_READ_INPUT_REGISTERS => Self::ReadInputRegisters { address, quantity: word },
            FC_WRITE_SINGLE_COIL => match word {
                0xFF00 => Self::WriteSingleCoil { address, value: true },
                0x0000 => Self::WriteSingleCoil { address, value: false },
                other => {
                    return Err(ProtocolError::Frame(format!(
                        "invalid FC05 coil value 0x{:04X}",
                        other
                    )))
                },
            },
            FC_WRITE_SINGLE_REGISTER => Self::WriteSingleRegister { address, value: word },
            FC_WRITE_MULTIPLE_COILS => {
                let count = data.get(5).copied().unwrap_or(0) as usize;
                let bytes = data
                    .get(6..6 + count)
                    .ok_or_else(|| ProtocolError::Frame("FC15 payload truncated".to_string()))?;
                Self::WriteMultipleCoils {
                    address,
                    values: unpack_bits(bytes, word as usize),
                }
            },
            FC_WRITE_MULTIPLE_REGISTERS => {
                let count = data.get(5).copied().unwrap_or(0) as usize;
                let bytes = data
                    .get(6..6 + count)
                    .ok_or_else(|| ProtocolError::Frame("FC16 payload truncated".to_string()))?;
                if bytes.len() != word as usize * 2 {
                    return Err(ProtocolError::Frame(format!(
                        "FC16 byte count {} does not match quantity {}",
                        bytes.len(),
                        word
                    )));
                }
                Self::WriteMultipleRegisters {
                    address,
                    values: bytes
                        .chunks_exact(2)
                        .map(|c| u16::from_be_bytes([c[0], c[1]]))
                        .collect(),
                }
            },
            other => {
                return Err(ProtocolError::Exception {
                    function: other,
                    code: EXCEPTION_ILLEGAL_FUNCTION,
                })
            },
        };
        Ok(request)
    }
}

/// Pack coils LSB-first into bytes
pub fn pack_bits(values: &[bool]) -> Vec<u8> {
    let mut out = vec![0u8; values.len().div_ceil(8)];
    for (i, v) in values.iter().enumerate() {
        if *v {
            out[i / 8] |= 1 << (i % 8);
        }
    }
    out
}

pub fn unpack_bits(bytes: &[u8], quantity: usize) -> Vec<bool> {
    (0..quantity)
        .map(|i| bytes.get(i / 8).is_some_and(|b| b & (1 << (i % 8)) != 0))
        .collect()
}

pub struct ModbusCodec;

impl ModbusCodec {
    /// FC05 value is 0xFF00 for ON, 0x0000 for OFF
    pub fn build_fc05_single_coil_pdu(address: u16, value: bool) -> Result<ModbusPdu> {
        Ok(PduBuilder::new()
            .function_code(FC_WRITE_SINGLE_COIL)?
            .address(address)?
            .byte(if value { 0xFF } else { 0x00 })?
            .byte(0x00)?
            .build())
    }

    pub fn build_fc06_single_register_pdu(address: u16, value: u16) -> Result<ModbusPdu> {
        Ok(PduBuilder::new()
            .function_code(FC_WRITE_SINGLE_REGISTER)?
            .address(address)?
            .quantity(value)?
            .build())
    }

    pub fn build_fc15_multiple_coils_pdu(start_address: u16, values: &[bool]) -> Result<ModbusPdu> {
        if values.is_empty() || values.len() > constants::MODBUS_MAX_WRITE_COILS {
            return Err(ProtocolError::InvalidParameter(
                "Invalid coil count for FC15".to_string(),
            ));
        }
        let packed = pack_bits(values);
        Ok(PduBuilder::new()
            .function_code(FC_WRITE_MULTIPLE_COILS)?
            .address(start_address)?
            .quantity(values.len() as u16)?
            .byte(packed.len() as u8)?
            .data(&packed)?
            .build())
    }

    pub fn build_fc16_multiple_registers_pdu(
        start_address: u16,
        values: &[u16],
    ) -> Result<ModbusPdu> {
        if values.is_empty() || values.len() > constants::MODBUS_MAX_WRITE_REGISTERS {
            return Err(ProtocolError::InvalidParameter(
                "Invalid register count for FC16".to_string(),
            ));
        }
        let mut pdu = PduBuilder::new()
            .function_code(FC_WRITE_MULTIPLE_REGISTERS)?
            .address(start_address)?
            .quantity(values.len() as u16)?
            .byte((values.len() * 2) as u8)?
            .build();
        for &value in values {
            pdu.push_u16(value)?;
        }
        Ok(pdu)
    }

    fn check_response(pdu: &ModbusPdu, expected_fc: u8) -> Result<()> {
        let fc = pdu
            .function_code()
            .ok_or_else(|| ProtocolError::Frame("Empty response PDU".to_string()))?;
        if pdu.is_exception() {
            return Err(ProtocolError::Exception {
                function: fc & 0x7F,
                code: pdu.exception_code().unwrap_or(0),
            });
        }
        if fc != expected_fc {
            return Err(ProtocolError::Frame(format!(
                "Function code mismatch: expected {:02X}, got {:02X}",
                expected_fc, fc
            )));
        }
        Ok(())
    }

    /// Data bytes of an FC01-04 response
    pub fn parse_read_response(pdu: &ModbusPdu, expected_fc: u8) -> Result<Vec<u8>> {
        Self::check_response(pdu, expected_fc)?;
        let data = pdu.as_slice();
        let count = data
            .get(1)
            .copied()
            .ok_or_else(|| ProtocolError::Frame("missing byte count".to_string()))?
            as usize;
        data.get(2..2 + count)
            .map(<[u8]>::to_vec)
            .ok_or_else(|| {
                ProtocolError::Frame(format!(
                    "byte count {} exceeds PDU length {}",
                    count,
                    data.len()
                ))
            })
    }

    pub fn parse_register_response(pdu: &ModbusPdu, expected_fc: u8) -> Result<Vec<u16>> {
        let bytes = Self::parse_read_response(pdu, expected_fc)?;
        Ok(bytes
            .chunks_exact(2)
            .map(|c| u16::from_be_bytes([c[0], c[1]]))
            .collect())
    }

    /// A matching function code means the write was accepted
    pub fn parse_write_response(pdu: &ModbusPdu, expected_fc: u8) -> Result<()> {
        Self::check_response(pdu, expected_fc)
    }

    /// Response PDU for a read request served from local tables
    pub fn build_read_response(fc: u8, data: &[u8]) -> Result<ModbusPdu> {
        Ok(PduBuilder::new()
            .function_code(fc)?
            .byte(data.len() as u8)?
            .data(data)?
            .build())
    }

    pub fn build_exception(fc: u8, code: u8) -> ModbusPdu {
        let mut pdu = ModbusPdu::new();
        // two bytes always fit
        let _ = pdu.push(fc | 0x80);
        let _ = pdu.push(code);
        pdu
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use super::*;

    #[test]
    fn test_fc05_request_roundtrip() {
        let pdu = ModbusCodec::build_fc05_single_coil_pdu(0x0013, true).unwrap();
        assert_eq!(pdu.as_slice(), &[0x05, 0x00, 0x13, 0xFF, 0x00]);
        let request = ModbusRequest::parse(&pdu).unwrap();
        assert_eq!(request, ModbusRequest::WriteSingleCoil { address: 0x13, value: true });
        assert_eq!(request.to_pdu().unwrap(), pdu);
    }

    #[test]
    fn test_fc15_and_fc16_requests() {
        let coils = vec![true, false, true, true, false, false, false, false, true];
        let pdu = ModbusCodec::build_fc15_multiple_coils_pdu(10, &coils).unwrap();
        assert_eq!(pdu.as_slice(), &[0x0F, 0x00, 0x0A, 0x00, 0x09, 0x02, 0x0D, 0x01]);
        assert_eq!(
            ModbusRequest::parse(&pdu).unwrap(),
            ModbusRequest::WriteMultipleCoils { address: 10, values: coils }
        );

        let pdu = ModbusCodec::build_fc16_multiple_registers_pdu(1, &[0x000A, 0x0102]).unwrap();
        assert_eq!(pdu.as_slice(), &[0x10, 0x00, 0x01, 0x00, 0x02, 0x04, 0x00, 0x0A, 0x01, 0x02]);
        assert!(ModbusCodec::build_fc16_multiple_registers_pdu(0, &[]).is_err());
    }

    #[test]
    fn test_parse_read_response() {
        let pdu = ModbusPdu::from_slice(&[0x03, 0x02, 0x00, 0x2A]).unwrap();
        assert_eq!(ModbusCodec::parse_read_response(&pdu, 0x03).unwrap(), vec![0x00, 0x2A]);
        assert_eq!(ModbusCodec::parse_register_response(&pdu, 0x03).unwrap(), vec![42]);
        assert!(ModbusCodec::parse_read_response(&pdu, 0x04).is_err());

        let truncated = ModbusPdu::from_slice(&[0x03, 0x04, 0x00]).unwrap();
        assert!(ModbusCodec::parse_read_response(&truncated, 0x03).is_err());
    }

    #[test]
    fn test_exception_response() {
        let pdu = ModbusCodec::build_exception(0x03, EXCEPTION_ILLEGAL_DATA_ADDRESS);
        let err = ModbusCodec::parse_read_response(&pdu, 0x03).unwrap_err();
        assert!(matches!(err, ProtocolError::Exception { function: 0x03, code: 0x02 }));
    }

    #[test]
    fn test_bits() {
        assert_eq!(pack_bits(&[true, false, true]), vec![0x05]);
        assert_eq!(unpack_bits(&[0x05], 3), vec![true, false, true]);
    }
}
