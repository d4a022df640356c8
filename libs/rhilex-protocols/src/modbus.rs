//! Modbus RTU/TCP
//!
//! Function codes 1/2/3/4 (read), 5/6 (single write), 15/16 (multiple
//! write); slave ids 1-247; big-endian 16-bit addresses.

pub mod codec;
pub mod constants;
pub mod frame;
pub mod pdu;
pub mod slave;
pub mod transport;

pub use codec::{ModbusCodec, ModbusRequest};
pub use frame::{FrameMode, ModbusFrameProcessor};
pub use pdu::{ModbusPdu, PduBuilder};
pub use slave::RegisterTable;
pub use transport::{ModbusClient, ModbusConnection, SerialParams};
