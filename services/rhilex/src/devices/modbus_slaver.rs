//! Generic Modbus slave (TCP)
//!
//! Serves coil, discrete-input, holding- and input-register tables of
//! `maxRegisters` entries each. Every write from a client updates the
//! device's cache slot and is handed to the rule engine as
//! `{"register":3,"slaverId":1,"lastFetchTime":...,"value":"002a"}`.

use std::sync::Arc;

use async_trait::async_trait;
use common::bind_config;
use errors::{RhilexError, RhilexResult};
use parking_lot::{Mutex, RwLock};
use rhilex_cache::CacheValue;
use rhilex_core::{RegisterWrite, ResourceState, RuntimeContext, StateCell, XDevice, XStatus};
use rhilex_protocols::modbus::constants::MBAP_HEADER_LEN;
use rhilex_protocols::modbus::frame::{build_tcp_frame, parse_mbap_header, parse_tcp_frame};
use rhilex_protocols::modbus::{ModbusRequest, RegisterTable};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{check_mode, HostConfig, MODE_TCP};
use crate::engine::EngineRef;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SlaverCommonConfig {
    pub mode: String,
    pub max_registers: u16,
    pub slaver_id: u8,
}

impl Default for SlaverCommonConfig {
    fn default() -> Self {
        Self {
            mode: MODE_TCP.to_string(),
            max_registers: 64,
            slaver_id: 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ModbusSlaverConfig {
    pub common_config: SlaverCommonConfig,
    pub host_config: HostConfig,
}

impl Default for ModbusSlaverConfig {
    fn default() -> Self {
        Self {
            common_config: SlaverCommonConfig::default(),
            host_config: HostConfig {
                host: "0.0.0.0".to_string(),
                port: 1502,
                timeout: 3000,
            },
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SlaverValue {
    register: u16,
    slaver_id: u8,
    last_fetch_time: u64,
    value: String,
}

fn coil_point(device_id: &str, address: u16) -> String {
    format!("{}_Coils:{}", device_id, address)
}

fn holding_point(device_id: &str, address: u16) -> String {
    format!("{}_HoldingRegisters:{}", device_id, address)
}

/// State shared with connection tasks
struct Shared {
    device_id: String,
    slaver_id: u8,
    runtime: RuntimeContext,
    engine: EngineRef,
    table: Mutex<RegisterTable>,
}

impl Shared {
    /// Mirror applied writes into the cache and notify the rule engine
    fn publish(&self, request: &ModbusRequest) {
        let updates: Vec<(String, u16, String)> = match request {
            ModbusRequest::WriteSingleCoil { address, value } => {
                vec![(coil_point(&self.device_id, *address), *address, u8::from(*value).to_string())]
            },
            ModbusRequest::WriteMultipleCoils { address, values } => values
                .iter()
                .zip(*address..)
                .map(|(v, a)| (coil_point(&self.device_id, a), a, u8::from(*v).to_string()))
                .collect(),
            ModbusRequest::WriteSingleRegister { address, value } => vec![(
                holding_point(&self.device_id, *address),
                *address,
                hex::encode(value.to_be_bytes()),
            )],
            ModbusRequest::WriteMultipleRegisters { address, values } => values
                .iter()
                .zip(*address..)
                .map(|(v, a)| (holding_point(&self.device_id, a), a, hex::encode(v.to_be_bytes())))
                .collect(),
            _ => Vec::new(),
        };

        let engine = self.engine.get().ok();
        for (point, register, value) in updates {
            let cached = CacheValue::ok(point.clone(), value.clone());
            let payload = SlaverValue {
                register,
                slaver_id: self.slaver_id,
                last_fetch_time: cached.last_fetch_time,
                value,
            };
            self.runtime.cache.set(&self.device_id, &point, cached);
            let Some(engine) = &engine else { continue };
            match serde_json::to_string(&payload) {
                Ok(p) => {
                    if let Err(e) = engine.work_device(&self.device_id, &p) {
                        debug!("Dispatch from {} failed: {}", self.device_id, e);
                    }
                },
                Err(e) => warn!("Encode slaver value failed: {}", e),
            }
        }
    }

    async fn serve(self: Arc<Self>, mut stream: TcpStream, token: CancellationToken) {
        let mut header = [0u8; MBAP_HEADER_LEN + 1];
        loop {
            let read = tokio::select! {
                _ = token.cancelled() => break,
                r = stream.read_exact(&mut header) => r,
            };
            if read.is_err() {
                break;
            }
            let mbap = match parse_mbap_header(&header) {
                Ok(h) => h,
                Err(e) => {
                    debug!("Bad MBAP header: {}", e);
                    break;
                },
            };
            let mut frame = header.to_vec();
            frame.resize(MBAP_HEADER_LEN + usize::from(mbap.length), 0);
            if stream.read_exact(&mut frame[MBAP_HEADER_LEN + 1..]).await.is_err() {
                break;
            }
            let (mbap, pdu) = match parse_tcp_frame(&frame) {
                Ok(parsed) => parsed,
                Err(e) => {
                    debug!("Bad modbus frame: {}", e);
                    continue;
                },
            };
            let (response, applied) = self.table.lock().handle(&pdu);
            let reply = build_tcp_frame(mbap.transaction_id, mbap.unit_id, &response);
            if stream.write_all(&reply).await.is_err() {
                break;
            }
            if let Some(request) = applied {
                self.publish(&request);
            }
        }
    }
}

pub struct ModbusSlaver {
    runtime: RuntimeContext,
    engine: EngineRef,
    state: StateCell,
    config: RwLock<ModbusSlaverConfig>,
    shared: RwLock<Option<Arc<Shared>>>,
    token: Mutex<Option<CancellationToken>>,
    server: Mutex<Option<JoinHandle<()>>>,
}

impl ModbusSlaver {
    pub fn new(runtime: RuntimeContext, engine: EngineRef) -> Self {
        Self {
            runtime,
            engine,
            state: StateCell::default(),
            config: RwLock::new(ModbusSlaverConfig::default()),
            shared: RwLock::new(None),
            token: Mutex::new(None),
            server: Mutex::new(None),
        }
    }

    fn shared(&self) -> RhilexResult<Arc<Shared>> {
        self.shared
            .read()
            .clone()
            .ok_or_else(|| RhilexError::runtime("modbus slaver not initialised"))
    }

    pub fn coil(&self, address: u16) -> Option<bool> {
        self.shared().ok()?.table.lock().coil(address)
    }

    pub fn holding_register(&self, address: u16) -> Option<u16> {
        self.shared().ok()?.table.lock().holding_register(address)
    }
}

#[async_trait]
impl XStatus for ModbusSlaver {
    async fn init(&self, uuid: &str, config: &serde_json::Value) -> RhilexResult<()> {
        let config: ModbusSlaverConfig = bind_config(config)?;
        check_mode(&config.common_config.mode)?;
        if config.common_config.mode != MODE_TCP {
            return Err(RhilexError::InvalidConfig {
                field: "mode".to_string(),
                reason: "modbus slaver only serves TCP".to_string(),
            });
        }
        let size = config.common_config.max_registers;
        let cache = &self.runtime.cache;
        cache.register_slot(uuid);
        for address in 0..size {
            for point in [coil_point(uuid, address), holding_point(uuid, address)] {
                cache.set(uuid, &point, CacheValue::ok(point.clone(), "0"));
            }
        }
        *self.shared.write() = Some(Arc::new(Shared {
            device_id: uuid.to_string(),
            slaver_id: config.common_config.slaver_id,
            runtime: self.runtime.clone(),
            engine: self.engine.clone(),
            table: Mutex::new(RegisterTable::new(usize::from(size))),
        }));
        *self.config.write() = config;
        Ok(())
    }

    async fn start(&self, ctx: CancellationToken) -> RhilexResult<()> {
        let shared = self.shared()?;
        let host = self.config.read().host_config.clone();
        let listener = TcpListener::bind((host.host.as_str(), host.port)).await?;
        info!(
            "Modbus slaver {} listening on {}:{}",
            shared.device_id, host.host, host.port
        );

        let token = ctx.child_token();
        let accept_token = token.clone();
        let handle = tokio::spawn(async move {
            loop {
                let accepted = tokio::select! {
                    _ = accept_token.cancelled() => break,
                    a = listener.accept() => a,
                };
                match accepted {
                    Ok((stream, peer)) => {
                        debug!("Modbus client connected: {}", peer);
                        tokio::spawn(Arc::clone(&shared).serve(stream, accept_token.child_token()));
                    },
                    Err(e) => warn!("Modbus slaver accept failed: {}", e),
                }
            }
        });
        if let Some(old) = self.server.lock().replace(handle) {
            old.abort();
        }
        if let Some(old) = self.token.lock().replace(token) {
            old.cancel();
        }
        self.state.set(ResourceState::Up);
        Ok(())
    }

    fn status(&self) -> ResourceState {
        self.state.get()
    }

    fn set_state(&self, state: ResourceState) {
        self.state.set(state);
    }

    async fn stop(&self) {
        if let Some(token) = self.token.lock().take() {
            token.cancel();
        }
        if let Some(handle) = self.server.lock().take() {
            handle.abort();
        }
        if let Some(shared) = self.shared.write().take() {
            self.runtime.cache.unregister_slot(&shared.device_id);
        }
        self.state.set(ResourceState::Stop);
    }
}

#[async_trait]
impl XDevice for ModbusSlaver {
    async fn on_read(&self, _cmd: &[u8]) -> RhilexResult<Vec<u8>> {
        let shared = self.shared()?;
        let rows = self.runtime.cache.get_slot(&shared.device_id).unwrap_or_default();
        Ok(serde_json::to_vec(&rows)?)
    }

    /// `F5` writes one coil (`[0|1]`), `F6` one holding register (u16 BE)
    async fn on_write(&self, cmd: &[u8], data: &[u8]) -> RhilexResult<usize> {
        let shared = self.shared()?;
        let write: RegisterWrite = serde_json::from_slice(data)?;
        let bytes = write.value_bytes()?;
        let request = match (cmd, bytes.as_slice()) {
            (b"F5", [v]) if *v <= 1 => ModbusRequest::WriteSingleCoil {
                address: write.address,
                value: *v == 1,
            },
            (b"F5", _) => {
                return Err(RhilexError::Validation("Value Only Support 0 or 1".to_string()))
            },
            (b"F6", [hi, lo]) => ModbusRequest::WriteSingleRegister {
                address: write.address,
                value: u16::from_be_bytes([*hi, *lo]),
            },
            (b"F6", _) => {
                return Err(RhilexError::Validation("F6 expects a 16-bit value".to_string()))
            },
            _ => {
                return Err(RhilexError::Unsupported(format!(
                    "modbus slaver command {}",
                    String::from_utf8_lossy(cmd)
                )))
            },
        };
        {
            let mut table = shared.table.lock();
            match &request {
                ModbusRequest::WriteSingleCoil { address, value } => table.set_coil(*address, *value)?,
                ModbusRequest::WriteSingleRegister { address, value } => {
                    table.set_holding_register(*address, *value)?
                },
                _ => {},
            }
        }
        shared.publish(&request);
        Ok(bytes.len())
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use super::*;
    use common::RhilexConfig;
    use rhilex_protocols::modbus::ModbusClient;
    use std::time::Duration;

    #[tokio::test]
    async fn test_tcp_client_writes_reach_table_and_cache() {
        let runtime = RuntimeContext::new(RhilexConfig::default());
        let slaver = ModbusSlaver::new(runtime.clone(), EngineRef::detached());
        let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = probe.local_addr().unwrap().port();
        drop(probe);

        let config = serde_json::json!({
            "commonConfig": { "mode": "TCP", "maxRegisters": 8, "slaverId": 1 },
            "hostConfig": { "host": "127.0.0.1", "port": port },
        });
        slaver.init("slv1", &config).await.unwrap();
        slaver.start(CancellationToken::new()).await.unwrap();

        let mut client = ModbusClient::connect_tcp("127.0.0.1", port, Duration::from_secs(1))
            .await
            .unwrap();
        client
            .write(1, &ModbusRequest::WriteSingleRegister { address: 3, value: 42 })
            .await
            .unwrap();
        assert_eq!(slaver.holding_register(3), Some(42));
        let row = runtime.cache.get("slv1", "slv1_HoldingRegisters:3");
        assert_eq!(row.value, "002a");

        let data = client.read_holding_registers(1, 3, 1).await.unwrap();
        assert_eq!(data, vec![0x00, 0x2A]);

        slaver.stop().await;
        assert!(!runtime.cache.contains_slot("slv1"));
        slaver.stop().await;
    }

    #[tokio::test]
    async fn test_script_writes() {
        let runtime = RuntimeContext::new(RhilexConfig::default());
        let slaver = ModbusSlaver::new(runtime.clone(), EngineRef::detached());
        slaver
            .init("slv2", &serde_json::json!({ "commonConfig": { "maxRegisters": 4 } }))
            .await
            .unwrap();

        let coil = serde_json::to_vec(&RegisterWrite::new(5, 0, 1, 1, &[1])).unwrap();
        slaver.on_write(b"F5", &coil).await.unwrap();
        assert_eq!(slaver.coil(1), Some(true));
        assert_eq!(runtime.cache.get("slv2", "slv2_Coils:1").value, "1");

        let bad = serde_json::to_vec(&RegisterWrite::new(5, 0, 1, 1, &[2])).unwrap();
        assert!(slaver.on_write(b"F5", &bad).await.is_err());

        let reg = serde_json::to_vec(&RegisterWrite::new(6, 0, 2, 1, &[0x01, 0x00])).unwrap();
        slaver.on_write(b"F6", &reg).await.unwrap();
        assert_eq!(slaver.holding_register(2), Some(256));
        assert_eq!(runtime.cache.get("slv2", "slv2_HoldingRegisters:2").value, "0100");

        // outside the table
        let far = serde_json::to_vec(&RegisterWrite::new(6, 0, 9, 1, &[0, 1])).unwrap();
        assert!(slaver.on_write(b"F6", &far).await.is_err());
        assert!(slaver.on_write(b"F3", &reg).await.is_err());
    }
}
