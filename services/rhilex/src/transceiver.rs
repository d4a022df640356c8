//! Radio transceiver modules on serial lines
//!
//! Every enabled `[transceiver.<name>]` section opens its port and publishes
//! each received chunk on `transceiver.up.data.<name>` as
//! `{"name":..,"data":<hex>}`.

use std::sync::Arc;
use std::time::Duration;

use common::TransceiverConfig;
use dashmap::DashMap;
use errors::{RhilexError, RhilexResult};
use rhilex_bus::{EventBus, EventMessage};
use serde_json::json;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::task::JoinHandle;
use tokio_serial::SerialPortBuilderExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const EVENT_KIND: &str = "transceiver.up.data";
const READ_BUFFER: usize = 1024;

pub fn data_topic(name: &str) -> String {
    format!("{}.{}", EVENT_KIND, name)
}

fn open_serial(config: &TransceiverConfig) -> RhilexResult<tokio_serial::SerialStream> {
    let parity = match config.parity.to_ascii_uppercase().as_str() {
        "E" | "EVEN" => tokio_serial::Parity::Even,
        "O" | "ODD" => tokio_serial::Parity::Odd,
        _ => tokio_serial::Parity::None,
    };
    let data_bits = match config.data_bits {
        5 => tokio_serial::DataBits::Five,
        6 => tokio_serial::DataBits::Six,
        7 => tokio_serial::DataBits::Seven,
        _ => tokio_serial::DataBits::Eight,
    };
    let stop_bits = match config.stop_bits {
        2 => tokio_serial::StopBits::Two,
        _ => tokio_serial::StopBits::One,
    };
    tokio_serial::new(&config.address, config.baud_rate)
        .data_bits(data_bits)
        .parity(parity)
        .stop_bits(stop_bits)
        .open_native_async()
        .map_err(|e| RhilexError::ConnectionFailed {
            endpoint: config.address.clone(),
            reason: e.to_string(),
        })
}

/// Read `reader` until EOF, error or cancellation, publishing every chunk.
/// A non-zero `io_timeout` (ms) ends the loop after that long without data.
pub(crate) async fn pump<R>(
    name: String,
    mut reader: R,
    bus: Arc<EventBus>,
    token: CancellationToken,
    io_timeout: u64,
) where
    R: AsyncRead + Unpin,
{
    let topic = data_topic(&name);
    let mut buf = vec![0u8; READ_BUFFER];
    loop {
        let read = async {
            if io_timeout == 0 {
                Ok(reader.read(&mut buf).await)
            } else {
                tokio::time::timeout(Duration::from_millis(io_timeout), reader.read(&mut buf)).await
            }
        };
        let result = tokio::select! {
            _ = token.cancelled() => break,
            r = read => r,
        };
        match result {
            Ok(Ok(0)) => {
                debug!("Transceiver {} closed", name);
                break;
            },
            Ok(Ok(n)) => {
                let payload = json!({ "name": name, "data": hex::encode(&buf[..n]) });
                bus.publish(&topic, EventMessage::new(topic.as_str(), name.as_str(), EVENT_KIND, payload));
            },
            Ok(Err(e)) => {
                warn!("Transceiver {} read error: {}", name, e);
                break;
            },
            Err(_) => {
                warn!("Transceiver {} idle for {} ms", name, io_timeout);
                break;
            },
        }
    }
}

/// Running transceivers keyed by name
pub struct TransceiverManager {
    bus: Arc<EventBus>,
    token: CancellationToken,
    running: DashMap<String, JoinHandle<()>>,
}

impl TransceiverManager {
    pub fn new(bus: Arc<EventBus>, token: CancellationToken) -> Self {
        Self {
            bus,
            token,
            running: DashMap::new(),
        }
    }

    /// Open the serial port of an enabled section and start reading it
    pub fn start(&self, config: &TransceiverConfig) -> RhilexResult<()> {
        if !config.enable {
            debug!("Transceiver {} disabled", config.name);
            return Ok(());
        }
        if self.running.contains_key(&config.name) {
            return Err(RhilexError::AlreadyRunning(format!("transceiver {}", config.name)));
        }
        let port = open_serial(config)?;
        let handle = tokio::spawn(pump(
            config.name.clone(),
            port,
            Arc::clone(&self.bus),
            self.token.child_token(),
            config.io_timeout,
        ));
        info!(
            "Transceiver {} started on {} @{}baud",
            config.name, config.address, config.baud_rate
        );
        self.running.insert(config.name.clone(), handle);
        Ok(())
    }

    pub fn start_all(&self, configs: &[TransceiverConfig]) {
        for config in configs {
            if let Err(e) = self.start(config) {
                warn!("Transceiver {} start failed: {}", config.name, e);
            }
        }
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.running.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    pub fn stop(&self, name: &str) -> bool {
        match self.running.remove(name) {
            Some((_, handle)) => {
                handle.abort();
                info!("Transceiver {} stopped", name);
                true
            },
            None => false,
        }
    }

    pub fn stop_all(&self) {
        for name in self.names() {
            self.stop(&name);
        }
    }
}
