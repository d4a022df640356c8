//! Field protocol codecs used by the gateway's device adapters
//!
//! - [`modbus`]: PDU builder, request/response codec, TCP/RTU framing,
//!   client transport and a register table for slave mode
//! - [`dlt645`]: DL/T645-2007 frame codec
//! - [`byte_order`]: register byte-order handling and point value decoding

pub mod byte_order;
pub mod crc;
pub mod dlt645;
pub mod error;
pub mod modbus;

pub use byte_order::{default_data_order, parse_modbus_value, ByteOrder};
pub use crc::crc16_modbus;
pub use error::{ProtocolError, Result};
