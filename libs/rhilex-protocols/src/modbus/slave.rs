//! In-memory register tables served in slave mode

use super::codec::{pack_bits, ModbusCodec, ModbusRequest};
use super::constants::*;
use super::pdu::ModbusPdu;
use crate::error::{ProtocolError, Result};

#[derive(Debug, Clone)]
pub struct RegisterTable {
    coils: Vec<bool>,
    discrete_inputs: Vec<bool>,
    holding: Vec<u16>,
    input: Vec<u16>,
}

impl RegisterTable {
    /// Every table gets `size` entries starting at address 0
    pub fn new(size: usize) -> Self {
        Self {
            coils: vec![false; size],
            discrete_inputs: vec![false; size],
            holding: vec![0; size],
            input: vec![0; size],
        }
    }

    fn range(len: usize, address: u16, quantity: usize) -> Result<std::ops::Range<usize>> {
        let start = address as usize;
        let end = start + quantity;
        if quantity == 0 || end > len {
            return Err(ProtocolError::Exception {
                function: 0,
                code: EXCEPTION_ILLEGAL_DATA_ADDRESS,
            });
        }
        Ok(start..end)
    }

    pub fn coil(&self, address: u16) -> Option<bool> {
        self.coils.get(address as usize).copied()
    }

    pub fn holding_register(&self, address: u16) -> Option<u16> {
        self.holding.get(address as usize).copied()
    }

    pub fn coils(&self) -> &[bool] {
        &self.coils
    }

    pub fn holding_registers(&self) -> &[u16] {
        &self.holding
    }

    pub fn set_coil(&mut self, address: u16, value: bool) -> Result<()> {
        let r = Self::range(self.coils.len(), address, 1)?;
        self.coils[r.start] = value;
        Ok(())
    }

    pub fn set_coils(&mut self, address: u16, values: &[bool]) -> Result<()> {
        let r = Self::range(self.coils.len(), address, values.len())?;
        self.coils[r].copy_from_slice(values);
        Ok(())
    }

    pub fn set_holding_register(&mut self, address: u16, value: u16) -> Result<()> {
        let r = Self::range(self.holding.len(), address, 1)?;
        self.holding[r.start] = value;
        Ok(())
    }

    pub fn set_holding_registers(&mut self, address: u16, values: &[u16]) -> Result<()> {
        let r = Self::range(self.holding.len(), address, values.len())?;
        self.holding[r].copy_from_slice(values);
        Ok(())
    }

    pub fn set_input_register(&mut self, address: u16, value: u16) -> Result<()> {
        let r = Self::range(self.input.len(), address, 1)?;
        self.input[r.start] = value;
        Ok(())
    }

    pub fn set_discrete_input(&mut self, address: u16, value: bool) -> Result<()> {
        let r = Self::range(self.discrete_inputs.len(), address, 1)?;
        self.discrete_inputs[r.start] = value;
        Ok(())
    }

    fn serve(&mut self, request: &ModbusRequest, request_pdu: &ModbusPdu) -> Result<ModbusPdu> {
        let fc = request.function_code();
        match request {
            ModbusRequest::ReadCoils { address, quantity } => {
                let r = Self::range(self.coils.len(), *address, *quantity as usize)?;
                ModbusCodec::build_read_response(fc, &pack_bits(&self.coils[r]))
            },
            ModbusRequest::ReadDiscreteInputs { address, quantity } => {
                let r = Self::range(self.discrete_inputs.len(), *address, *quantity as usize)?;
                ModbusCodec::build_read_response(fc, &pack_bits(&self.discrete_inputs[r]))
            },
            ModbusRequest::ReadHoldingRegisters { address, quantity } => {
                if *quantity as usize > MODBUS_MAX_READ_REGISTERS {
                    return Err(ProtocolError::Exception {
                        function: fc,
                        code: EXCEPTION_ILLEGAL_DATA_VALUE,
                    });
                }
                let r = Self::range(self.holding.len(), *address, *quantity as usize)?;
                let bytes: Vec<u8> = self.holding[r].iter().flat_map(|v| v.to_be_bytes()).collect();
                ModbusCodec::build_read_response(fc, &bytes)
            },
            ModbusRequest::ReadInputRegisters { address, quantity } => {
                if *quantity as usize > MODBUS_MAX_READ_REGISTERS {
                    return Err(ProtocolError::Exception {
                        function: fc,
                        code: EXCEPTION_ILLEGAL_DATA_VALUE,
                    });
                }
                let r = Self::range(self.input.len(), *address, *quantity as usize)?;
                let bytes: Vec<u8> = self.input[r].iter().flat_map(|v| v.to_be_bytes()).collect();
                ModbusCodec::build_read_response(fc, &bytes)
            },
            // single writes echo the request
            ModbusRequest::WriteSingleCoil { address, value } => {
                self.set_coil(*address, *value)?;
                Ok(request_pdu.clone())
            },
            ModbusRequest::WriteSingleRegister { address, value } => {
                self.set_holding_register(*address, *value)?;
                Ok(request_pdu.clone())
            },
            ModbusRequest::WriteMultipleCoils { address, values } => {
                self.set_coils(*address, values)?;
                ModbusPdu::from_slice(&request_pdu.as_slice()[..5])
            },
            ModbusRequest::WriteMultipleRegisters { address, values } => {
                self.set_holding_registers(*address, values)?;
                ModbusPdu::from_slice(&request_pdu.as_slice()[..5])
            },
        }
    }

    /// Serve one request PDU
    ///
    /// Returns the response PDU (an exception response on failure) and the
    /// request when it modified the tables.
    pub fn handle(&mut self, pdu: &ModbusPdu) -> (ModbusPdu, Option<ModbusRequest>) {
        let fc = pdu.function_code().unwrap_or(0);
        let request = match ModbusRequest::parse(pdu) {
            Ok(r) => r,
            Err(ProtocolError::Exception { code, .. }) => {
                return (ModbusCodec::build_exception(fc, code), None)
            },
            Err(_) => return (ModbusCodec::build_exception(fc, EXCEPTION_ILLEGAL_DATA_VALUE), None),
        };
        match self.serve(&request, pdu) {
            Ok(response) => {
                let is_write = matches!(
                    request,
                    ModbusRequest::WriteSingleCoil { .. }
                        | ModbusRequest::WriteSingleRegister { .. }
                        | ModbusRequest::WriteMultipleCoils { .. }
                        | ModbusRequest::WriteMultipleRegisters { .. }
                );
                (response, is_write.then_some(request))
            },
            Err(ProtocolError::Exception { code, .. }) => (ModbusCodec::build_exception(fc, code), None),
            Err(_) => (ModbusCodec::build_exception(fc, EXCEPTION_ILLEGAL_DATA_VALUE), None),
        }
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use super::*;
    use crate::modbus::pdu::PduBuilder;

    #[test]
    fn test_write_then_read_registers() {
        let mut table = RegisterTable::new(16);
        let write = ModbusCodec::build_fc06_single_register_pdu(3, 0x1234).unwrap();
        let (resp, applied) = table.handle(&write);
        assert_eq!(resp, write);
        assert!(matches!(applied, Some(ModbusRequest::WriteSingleRegister { address: 3, value: 0x1234 })));

        let read = PduBuilder::build_read_request(0x03, 3, 1).unwrap();
        let (resp, applied) = table.handle(&read);
        assert_eq!(resp.as_slice(), &[0x03, 0x02, 0x12, 0x34]);
        assert!(applied.is_none());
    }

    #[test]
    fn test_coils_and_exceptions() {
        let mut table = RegisterTable::new(8);
        let write = ModbusCodec::build_fc15_multiple_coils_pdu(0, &[true, true, false]).unwrap();
        let (resp, _) = table.handle(&write);
        assert_eq!(resp.as_slice(), &[0x0F, 0x00, 0x00, 0x00, 0x03]);
        assert_eq!(table.coil(1), Some(true));

        let out_of_range = PduBuilder::build_read_request(0x01, 7, 4).unwrap();
        let (resp, _) = table.handle(&out_of_range);
        assert_eq!(resp.as_slice(), &[0x81, EXCEPTION_ILLEGAL_DATA_ADDRESS]);

        let unknown = ModbusPdu::from_slice(&[0x2B, 0x00, 0x00, 0x00, 0x00]).unwrap();
        let (resp, _) = table.handle(&unknown);
        assert_eq!(resp.as_slice(), &[0xAB, EXCEPTION_ILLEGAL_FUNCTION]);
    }
}
