//! Stack-allocated Modbus PDU

use tracing::trace;

use super::constants::MAX_PDU_SIZE;
use crate::error::{ProtocolError, Result};

#[derive(Clone)]
pub struct ModbusPdu {
    data: [u8; MAX_PDU_SIZE],
    len: usize,
}

impl std::fmt::Debug for ModbusPdu {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ModbusPdu({})", hex::encode(self.as_slice()))
    }
}

impl PartialEq for ModbusPdu {
    fn eq(&self, other: &Self) -> bool {
        self.as_slice() == other.as_slice()
    }
}

impl ModbusPdu {
    #[inline]
    pub fn new() -> Self {
        Self {
            data: [0; MAX_PDU_SIZE],
            len: 0,
        }
    }

    pub fn from_slice(data: &[u8]) -> Result<Self> {
        if data.len() > MAX_PDU_SIZE {
            return Err(ProtocolError::Frame(format!(
                "PDU too large: {} bytes (max {})",
                data.len(),
                MAX_PDU_SIZE
            )));
        }
        let mut pdu = Self::new();
        pdu.data[..data.len()].copy_from_slice(data);
        pdu.len = data.len();
        trace!("PDU parsed: {:?}", pdu);
        Ok(pdu)
    }

    #[inline]
    pub fn push(&mut self, byte: u8) -> Result<()> {
        if self.len >= MAX_PDU_SIZE {
            return Err(ProtocolError::Frame("PDU buffer full".to_string()));
        }
        self.data[self.len] = byte;
        self.len += 1;
        Ok(())
    }

    /// Big-endian
    #[inline]
    pub fn push_u16(&mut self, value: u16) -> Result<()> {
        self.extend(&value.to_be_bytes())
    }

    #[inline]
    pub fn extend(&mut self, data: &[u8]) -> Result<()> {
        if self.len + data.len() > MAX_PDU_SIZE {
            return Err(ProtocolError::Frame(format!(
                "PDU would exceed max size: {} + {} > {}",
                self.len,
                data.len(),
                MAX_PDU_SIZE
            )));
        }
        self.data[self.len..self.len + data.len()].copy_from_slice(data);
        self.len += data.len();
        Ok(())
    }

    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.len]
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn function_code(&self) -> Option<u8> {
        (self.len > 0).then(|| self.data[0])
    }

    #[inline]
    pub fn is_exception(&self) -> bool {
        self.function_code().is_some_and(|fc| fc & 0x80 != 0)
    }

    pub fn exception_code(&self) -> Option<u8> {
        (self.is_exception() && self.len > 1).then(|| self.data[1])
    }

    /// Read a big-endian u16 at `offset`
    pub fn u16_at(&self, offset: usize) -> Result<u16> {
        self.as_slice()
            .get(offset..offset + 2)
            .map(|b| u16::from_be_bytes([b[0], b[1]]))
            .ok_or_else(|| ProtocolError::Frame(format!("PDU too short for u16 at {}", offset)))
    }
}

impl Default for ModbusPdu {
    fn default() -> Self {
        Self::new()
    }
}

/// Fluent PDU construction
#[derive(Default)]
pub struct PduBuilder {
    pdu: ModbusPdu,
}

impl PduBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn function_code(mut self, fc: u8) -> Result<Self> {
        self.pdu.push(fc)?;
        Ok(self)
    }

    pub fn address(mut self, addr: u16) -> Result<Self> {
        self.pdu.push_u16(addr)?;
        Ok(self)
    }

    pub fn quantity(mut self, qty: u16) -> Result<Self> {
        self.pdu.push_u16(qty)?;
        Ok(self)
    }

    pub fn byte(mut self, b: u8) -> Result<Self> {
        self.pdu.push(b)?;
        Ok(self)
    }

    pub fn data(mut self, data: &[u8]) -> Result<Self> {
        self.pdu.extend(data)?;
        Ok(self)
    }

    pub fn build(self) -> ModbusPdu {
        self.pdu
    }

    /// Read request for FC01-04
    pub fn build_read_request(fc: u8, start_address: u16, quantity: u16) -> Result<ModbusPdu> {
        if !matches!(fc, 0x01..=0x04) {
            return Err(ProtocolError::InvalidParameter(format!(
                "read request only supports FC01-04, got FC{:02X}",
                fc
            )));
        }
        Ok(Self::new()
            .function_code(fc)?
            .address(start_address)?
            .quantity(quantity)?
            .build())
    }
}
