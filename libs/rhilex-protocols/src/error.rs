//! Protocol-level errors

use errors::RhilexError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed frame: {0}")]
    Frame(String),

    #[error("CRC mismatch: expected 0x{expected:04X}, got 0x{actual:04X}")]
    Crc { expected: u16, actual: u16 },

    #[error("checksum mismatch: expected 0x{expected:02X}, got 0x{actual:02X}")]
    Checksum { expected: u8, actual: u8 },

    #[error("Modbus exception response: FC{function:02X} code {code:02X}")]
    Exception { function: u8, code: u8 },

    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ProtocolError>;

impl From<ProtocolError> for RhilexError {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::Timeout(msg) => RhilexError::Timeout(msg),
            ProtocolError::Connection(msg) => RhilexError::Communication(msg),
            ProtocolError::Io(e) => RhilexError::Io(e),
            ProtocolError::InvalidParameter(msg) => RhilexError::InvalidParameter {
                param: "modbus".to_string(),
                reason: msg,
            },
            other => RhilexError::Modbus(other.to_string()),
        }
    }
}
