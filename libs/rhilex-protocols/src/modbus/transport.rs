//! Modbus master transport over TCP or a serial line

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info, warn};

#[cfg(feature = "modbus-rtu")]
use tokio_serial::{SerialPortBuilderExt, SerialStream};

use super::codec::{unpack_bits, ModbusCodec, ModbusRequest};
use super::constants;
use super::frame::{FrameMode, ModbusFrameProcessor};
use super::pdu::ModbusPdu;
use crate::error::{ProtocolError, Result};

/// Serial line settings
#[derive(Debug, Clone, PartialEq)]
pub struct SerialParams {
    pub port: String,
    pub baud_rate: u32,
    pub data_bits: u8,
    /// `N`, `E` or `O`
    pub parity: String,
    pub stop_bits: u8,
    pub timeout: Duration,
}

#[derive(Debug)]
pub enum ModbusConnection {
    Tcp(TcpStream),
    #[cfg(feature = "modbus-rtu")]
    Rtu(SerialStream),
}

impl ModbusConnection {
    pub async fn connect_tcp(host: &str, port: u16, timeout_duration: Duration) -> Result<Self> {
        let addr = format!("{host}:{port}");
        debug!("TCP connecting: {}", addr);
        match timeout(timeout_duration, TcpStream::connect(&addr)).await {
            Ok(Ok(stream)) => {
                if let Err(e) = stream.set_nodelay(true) {
                    debug!("TCP_NODELAY: {}", e);
                }
                info!("TCP connected: {}", addr);
                Ok(Self::Tcp(stream))
            },
            Ok(Err(e)) => Err(ProtocolError::Connection(format!(
                "Failed to connect to {addr}: {e}"
            ))),
            Err(_) => {
                warn!("TCP timeout: {}", addr);
                Err(ProtocolError::Timeout(format!("Connection to {addr} timed out")))
            },
        }
    }

    #[cfg(feature = "modbus-rtu")]
    pub fn open_rtu(params: &SerialParams) -> Result<Self> {
        debug!("RTU: {} @{}baud", params.port, params.baud_rate);
        let parity = match params.parity.to_ascii_uppercase().as_str() {
            "E" | "EVEN" => tokio_serial::Parity::Even,
            "O" | "ODD" => tokio_serial::Parity::Odd,
            _ => tokio_serial::Parity::None,
        };
        let data_bits = match params.data_bits {
            5 => tokio_serial::DataBits::Five,
            6 => tokio_serial::DataBits::Six,
            7 => tokio_serial::DataBits::Seven,
            _ => tokio_serial::DataBits::Eight,
        };
        let stop_bits = match params.stop_bits {
            2 => tokio_serial::StopBits::Two,
            _ => tokio_serial::StopBits::One,
        };
        tokio_serial::new(&params.port, params.baud_rate)
            .data_bits(data_bits)
            .parity(parity)
            .stop_bits(stop_bits)
            .timeout(params.timeout)
            .open_native_async()
            .map(|port| {
                info!("RTU opened: {}", params.port);
                Self::Rtu(port)
            })
            .map_err(|e| {
                ProtocolError::Connection(format!("Failed to open serial port {}: {e}", params.port))
            })
    }

    pub async fn send(&mut self, data: &[u8]) -> Result<()> {
        match self {
            Self::Tcp(stream) => stream.write_all(data).await?,
            #[cfg(feature = "modbus-rtu")]
            Self::Rtu(port) => {
                port.write_all(data).await?;
                port.flush().await?;
            },
        }
        debug!("TX: {}", hex::encode(data));
        Ok(())
    }

    /// Receive one complete frame
    pub async fn receive(&mut self, buffer: &mut [u8], timeout_duration: Duration) -> Result<usize> {
        match self {
            Self::Tcp(stream) => {
                let mut header = [0u8; constants::MBAP_HEADER_LEN];
                match timeout(timeout_duration, stream.read_exact(&mut header)).await {
                    Ok(Ok(_)) => {},
                    Ok(Err(e)) => return Err(e.into()),
                    Err(_) => return Err(ProtocolError::Timeout("TCP header read timeout".into())),
                }
                let length = u16::from_be_bytes([header[4], header[5]]) as usize;
                if length == 0 || length > constants::MAX_MBAP_LENGTH {
                    return Err(ProtocolError::Frame(format!("Invalid TCP frame length: {}", length)));
                }
                let total = constants::MBAP_HEADER_LEN + length;
                if buffer.len() < total {
                    return Err(ProtocolError::Frame("Buffer too small for complete frame".into()));
                }
                buffer[..constants::MBAP_HEADER_LEN].copy_from_slice(&header);
                match timeout(
                    timeout_duration,
                    stream.read_exact(&mut buffer[constants::MBAP_HEADER_LEN..total]),
                )
                .await
                {
                    Ok(Ok(_)) => Ok(total),
                    Ok(Err(e)) => Err(e.into()),
                    Err(_) => Err(ProtocolError::Timeout("TCP PDU read timeout".into())),
                }
            },
            #[cfg(feature = "modbus-rtu")]
            Self::Rtu(port) => {
                // frame end is detected by an inter-byte gap
                const INTER_BYTE_TIMEOUT: Duration = Duration::from_millis(50);
                let mut total = 0;
                let start = std::time::Instant::now();
                loop {
                    if start.elapsed() >= timeout_duration {
                        if total < 4 {
                            return Err(ProtocolError::Timeout("RTU frame incomplete".into()));
                        }
                        break;
                    }
                    let read_size = (buffer.len() - total).min(128);
                    match timeout(INTER_BYTE_TIMEOUT, port.read(&mut buffer[total..total + read_size])).await {
                        Ok(Ok(0)) => {
                            return Err(ProtocolError::Connection("Serial connection closed".into()))
                        },
                        Ok(Ok(n)) => {
                            total += n;
                            if total >= buffer.len() {
                                return Err(ProtocolError::Frame("RTU frame exceeds buffer size".into()));
                            }
                        },
                        Ok(Err(e)) => return Err(e.into()),
                        Err(_) if total >= 4 => break,
                        Err(_) if total > 0 => {
                            return Err(ProtocolError::Timeout("RTU frame incomplete: inter-byte timeout".into()))
                        },
                        Err(_) => {},
                    }
                }
                Ok(total)
            },
        }
    }

    fn frame_mode(&self) -> FrameMode {
        match self {
            Self::Tcp(_) => FrameMode::Tcp,
            #[cfg(feature = "modbus-rtu")]
            Self::Rtu(_) => FrameMode::Rtu,
        }
    }
}

/// Request/response Modbus master bound to one connection
#[derive(Debug)]
pub struct ModbusClient {
    connection: ModbusConnection,
    processor: ModbusFrameProcessor,
    timeout: Duration,
}

impl ModbusClient {
    pub fn new(connection: ModbusConnection, timeout: Duration) -> Self {
        let processor = ModbusFrameProcessor::new(connection.frame_mode());
        Self {
            connection,
            processor,
            timeout,
        }
    }

    pub async fn connect_tcp(host: &str, port: u16, timeout: Duration) -> Result<Self> {
        let connection = ModbusConnection::connect_tcp(host, port, timeout).await?;
        Ok(Self::new(connection, timeout))
    }

    #[cfg(feature = "modbus-rtu")]
    pub fn open_rtu(params: &SerialParams) -> Result<Self> {
        let connection = ModbusConnection::open_rtu(params)?;
        Ok(Self::new(connection, params.timeout))
    }

    fn check_slave(unit_id: u8) -> Result<()> {
        if !(constants::MIN_SLAVE_ID..=constants::MAX_SLAVE_ID).contains(&unit_id) {
            return Err(ProtocolError::InvalidParameter(format!(
                "slave id {} out of range 1-247",
                unit_id
            )));
        }
        Ok(())
    }

    /// Send one request and wait for its reply
    pub async fn request(&mut self, unit_id: u8, pdu: &ModbusPdu) -> Result<ModbusPdu> {
        Self::check_slave(unit_id)?;
        let frame = self.processor.build_frame(unit_id, pdu);
        self.connection.send(&frame).await?;
        let mut buffer = [0u8; constants::MODBUS_RESPONSE_BUFFER_SIZE];
        let n = self.connection.receive(&mut buffer, self.timeout).await?;
        let (_, reply) = self.processor.parse_frame(&buffer[..n])?;
        Ok(reply)
    }

    async fn execute(&mut self, unit_id: u8, request: &ModbusRequest) -> Result<ModbusPdu> {
        let pdu = request.to_pdu()?;
        self.request(unit_id, &pdu).await
    }

    pub async fn read_coils(&mut self, unit_id: u8, address: u16, quantity: u16) -> Result<Vec<bool>> {
        let reply = self
            .execute(unit_id, &ModbusRequest::ReadCoils { address, quantity })
            .await?;
        let data = ModbusCodec::parse_read_response(&reply, constants::FC_READ_COILS)?;
        Ok(unpack_bits(&data, quantity as usize))
    }

    pub async fn read_discrete_inputs(
        &mut self,
        unit_id: u8,
        address: u16,
        quantity: u16,
    ) -> Result<Vec<bool>> {
        let reply = self
            .execute(unit_id, &ModbusRequest::ReadDiscreteInputs { address, quantity })
            .await?;
        let data = ModbusCodec::parse_read_response(&reply, constants::FC_READ_DISCRETE_INPUTS)?;
        Ok(unpack_bits(&data, quantity as usize))
    }

    /// Raw register bytes, big-endian as received
    pub async fn read_holding_registers(
        &mut self,
        unit_id: u8,
        address: u16,
        quantity: u16,
    ) -> Result<Vec<u8>> {
        let reply = self
            .execute(unit_id, &ModbusRequest::ReadHoldingRegisters { address, quantity })
            .await?;
        ModbusCodec::parse_read_response(&reply, constants::FC_READ_HOLDING_REGISTERS)
    }

    pub async fn read_input_registers(
        &mut self,
        unit_id: u8,
        address: u16,
        quantity: u16,
    ) -> Result<Vec<u8>> {
        let reply = self
            .execute(unit_id, &ModbusRequest::ReadInputRegisters { address, quantity })
            .await?;
        ModbusCodec::parse_read_response(&reply, constants::FC_READ_INPUT_REGISTERS)
    }

    /// Run any write request and check the echo
    pub async fn write(&mut self, unit_id: u8, request: &ModbusRequest) -> Result<()> {
        let reply = self.execute(unit_id, request).await?;
        ModbusCodec::parse_write_response(&reply, request.function_code())
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    /// One-shot server answering a single FC03 request with 0x002A
    async fn serve_once(listener: TcpListener) {
        let (mut sock, _) = listener.accept().await.unwrap();
        let mut req = [0u8; 12];
        sock.read_exact(&mut req).await.unwrap();
        let reply = [req[0], req[1], 0, 0, 0, 5, req[6], 0x03, 0x02, 0x00, 0x2A];
        sock.write_all(&reply).await.unwrap();
    }

    #[tokio::test]
    async fn test_read_holding_registers_over_tcp() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(serve_once(listener));

        let mut client = ModbusClient::connect_tcp("127.0.0.1", port, Duration::from_secs(1))
            .await
            .unwrap();
        let data = client.read_holding_registers(1, 0, 1).await.unwrap();
        assert_eq!(data, vec![0x00, 0x2A]);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_invalid_slave_id() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let mut client = ModbusClient::connect_tcp("127.0.0.1", port, Duration::from_secs(1))
            .await
            .unwrap();
        assert!(client.read_coils(0, 0, 1).await.is_err());
        assert!(client.read_coils(248, 0, 1).await.is_err());
    }
}
