//! Modbus frame and quantity limits

/// Transaction ID(2) + Protocol ID(2) + Length(2); the unit id is counted in
/// the length field
pub const MBAP_HEADER_LEN: usize = 6;

/// RS485 ADU (256) - slave address (1) - CRC (2)
pub const MAX_PDU_SIZE: usize = 253;

/// Unit id + PDU
pub const MAX_MBAP_LENGTH: usize = 1 + MAX_PDU_SIZE;

pub const MODBUS_RESPONSE_BUFFER_SIZE: usize = 512;

/// FC03/FC04: 1 + 1 + 2N <= 253
pub const MODBUS_MAX_READ_REGISTERS: usize = 125;

/// FC16: 1 + 2 + 2 + 1 + 2N <= 253
pub const MODBUS_MAX_WRITE_REGISTERS: usize = 123;

pub const MODBUS_MAX_READ_COILS: usize = 2000;

pub const MODBUS_MAX_WRITE_COILS: usize = 1968;

pub const MIN_SLAVE_ID: u8 = 1;
pub const MAX_SLAVE_ID: u8 = 247;

pub const FC_READ_COILS: u8 = 0x01;
pub const FC_READ_DISCRETE_INPUTS: u8 = 0x02;
pub const FC_READ_HOLDING_REGISTERS: u8 = 0x03;
pub const FC_READ_INPUT_REGISTERS: u8 = 0x04;
pub const FC_WRITE_SINGLE_COIL: u8 = 0x05;
pub const FC_WRITE_SINGLE_REGISTER: u8 = 0x06;
pub const FC_WRITE_MULTIPLE_COILS: u8 = 0x0F;
pub const FC_WRITE_MULTIPLE_REGISTERS: u8 = 0x10;

pub const EXCEPTION_ILLEGAL_FUNCTION: u8 = 0x01;
pub const EXCEPTION_ILLEGAL_DATA_ADDRESS: u8 = 0x02;
pub const EXCEPTION_ILLEGAL_DATA_VALUE: u8 = 0x03;

#[inline]
pub const fn mbap_frame_size(pdu_len: usize) -> usize {
    MBAP_HEADER_LEN + 1 + pdu_len
}
