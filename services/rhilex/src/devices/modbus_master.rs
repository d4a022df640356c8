//! Generic Modbus master
//!
//! Polls the configured point table over TCP or a serial port and pushes
//! the decoded values to the rule engine. With `batchRequest` every cycle is
//! dispatched as one JSON array, otherwise one JSON object per point:
//!
//! ```json
//! {"tag":"temp","alias":"room","slaverId":1,"lastFetchTime":1700000000000,"value":"42"}
//! ```
//!
//! With `enableOptimize` adjacent points sharing slave, function and
//! frequency are read with a single request of at most `maxRegNum`
//! registers.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common::bind_config;
use errors::{RhilexError, RhilexResult};
use parking_lot::{Mutex, RwLock};
use rhilex_cache::{CacheValue, DEFAULT_RULE_ENGINE_SLOT};
use rhilex_core::binding::CecollaConfig;
use rhilex_core::{
    RegisterWrite, ResourceState, RuntimeContext, StateCell, UartOccupy, XDevice, XStatus,
};
use rhilex_protocols::modbus::codec::{pack_bits, unpack_bits};
use rhilex_protocols::modbus::{ModbusClient, ModbusRequest, SerialParams};
use rhilex_protocols::parse_modbus_value;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{bind_cecolla, check_mode, device_name, unbind_cecolla, HostConfig, MODE_TCP, MODE_UART};
use crate::engine::EngineRef;

const MIN_FREQUENCY_MS: u64 = 50;
/// Pause between cycles when the point table is empty
const IDLE_CYCLE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MasterCommonConfig {
    pub mode: String,
    pub auto_request: bool,
    pub batch_request: bool,
    pub enable_optimize: bool,
    pub max_reg_num: u16,
}

impl Default for MasterCommonConfig {
    fn default() -> Self {
        Self {
            mode: MODE_TCP.to_string(),
            auto_request: true,
            batch_request: false,
            enable_optimize: false,
            max_reg_num: 32,
        }
    }
}

/// One point of the table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RegisterRW {
    pub uuid: String,
    pub tag: String,
    pub alias: String,
    pub function: u8,
    pub slaver_id: u8,
    pub address: u16,
    pub quantity: u16,
    /// Milliseconds to wait after reading this point
    pub frequency: u64,
    pub data_type: String,
    pub data_order: String,
    pub weight: f32,
}

impl Default for RegisterRW {
    fn default() -> Self {
        Self {
            uuid: String::new(),
            tag: String::new(),
            alias: String::new(),
            function: 3,
            slaver_id: 1,
            address: 0,
            quantity: 1,
            frequency: 1000,
            data_type: "RAW".to_string(),
            data_order: String::new(),
            weight: 1.0,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ModbusMasterConfig {
    pub common_config: MasterCommonConfig,
    pub host_config: HostConfig,
    pub port_uuid: String,
    pub cecolla_config: CecollaConfig,
    pub points: Vec<RegisterRW>,
}

impl ModbusMasterConfig {
    fn validate(&self) -> RhilexResult<()> {
        check_mode(&self.common_config.mode)?;
        if self.common_config.mode == MODE_UART && self.port_uuid.is_empty() {
            return Err(RhilexError::InvalidConfig {
                field: "portUuid".to_string(),
                reason: "UART mode requires a port".to_string(),
            });
        }
        if self.points.iter().any(|p| p.frequency < MIN_FREQUENCY_MS) {
            return Err(RhilexError::Validation(
                "'frequency' must be greater than 50 millisecond".to_string(),
            ));
        }
        Ok(())
    }
}

/// Value handed to rules for one point
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadRegisterValue {
    pub tag: String,
    pub alias: String,
    pub slaver_id: u8,
    pub last_fetch_time: u64,
    pub value: String,
}

/// Points read with one request
#[derive(Debug, Clone, PartialEq)]
pub struct PointGroup {
    pub function: u8,
    pub slaver_id: u8,
    pub address: u16,
    pub quantity: u16,
    pub frequency: u64,
    pub points: Vec<RegisterRW>,
}

/// Merge points into contiguous read groups of at most `max_reg_num`
/// registers. A group never spans slaves, functions or frequencies.
pub fn group_points(points: &[RegisterRW], max_reg_num: u16) -> Vec<PointGroup> {
    let mut sorted = points.to_vec();
    sorted.sort_by_key(|p| (p.slaver_id, p.function, p.frequency, p.address));

    let mut groups: Vec<PointGroup> = Vec::new();
    for point in sorted {
        let end = u32::from(point.address) + u32::from(point.quantity);
        if let Some(group) = groups.last_mut() {
            let group_end = u32::from(group.address) + u32::from(group.quantity);
            let same_kind = group.slaver_id == point.slaver_id
                && group.function == point.function
                && group.frequency == point.frequency;
            let span = end.max(group_end) - u32::from(group.address);
            if same_kind && u32::from(point.address) <= group_end && span <= u32::from(max_reg_num) {
                group.quantity = span as u16;
                group.points.push(point);
                continue;
            }
        }
        groups.push(PointGroup {
            function: point.function,
            slaver_id: point.slaver_id,
            address: point.address,
            quantity: point.quantity,
            frequency: point.frequency,
            points: vec![point],
        });
    }
    groups
}

/// What the poll loop needs; cloned into the task
#[derive(Clone)]
struct Poller {
    device_id: String,
    runtime: RuntimeContext,
    engine: EngineRef,
    config: ModbusMasterConfig,
    groups: Vec<PointGroup>,
    client: Arc<tokio::sync::Mutex<Option<ModbusClient>>>,
    retries: Arc<AtomicU32>,
}

enum Reading {
    Bits(Vec<bool>),
    Bytes(Vec<u8>),
}

impl Poller {
    async fn run(self, token: CancellationToken) {
        let threshold = self.runtime.config.retry_threshold;
        loop {
            if token.is_cancelled() {
                break;
            }
            let values = if self.config.common_config.enable_optimize {
                self.read_groups(&token).await
            } else {
                self.read_points(&token).await
            };
            if self.config.points.is_empty() {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(IDLE_CYCLE) => {},
                }
            }
            self.dispatch(&values);

            let retries = self.retries.load(Ordering::Relaxed);
            if retries > threshold {
                let msg = format!("modbus read failed {} times", retries);
                error!("Device {} down: {}", self.device_id, msg);
                self.runtime.cache.set(
                    DEFAULT_RULE_ENGINE_SLOT,
                    &self.device_id,
                    CacheValue::error(self.device_id.clone(), msg),
                );
                break;
            }
        }
        debug!("Modbus poller {} stopped", self.device_id);
    }

    async fn read(&self, slaver_id: u8, function: u8, address: u16, quantity: u16) -> RhilexResult<Reading> {
        let mut guard = self.client.lock().await;
        let client = guard
            .as_mut()
            .ok_or_else(|| RhilexError::runtime("modbus client not connected"))?;
        let reading = match function {
            1 => Reading::Bits(client.read_coils(slaver_id, address, quantity).await?),
            2 => Reading::Bits(client.read_discrete_inputs(slaver_id, address, quantity).await?),
            3 => Reading::Bytes(client.read_holding_registers(slaver_id, address, quantity).await?),
            4 => Reading::Bytes(client.read_input_registers(slaver_id, address, quantity).await?),
            other => {
                return Err(RhilexError::Unsupported(format!("read function {}", other)));
            },
        };
        Ok(reading)
    }

    fn record_error(&self, point: &RegisterRW, e: &RhilexError) {
        self.retries.fetch_add(1, Ordering::Relaxed);
        warn!("Read point {} of {} failed: {}", point.tag, self.device_id, e);
        self.runtime.cache.set(
            &self.device_id,
            &point.uuid,
            CacheValue::error(point.uuid.clone(), e.to_string()),
        );
    }

    fn record_value(&self, point: &RegisterRW, value: String) -> ReadRegisterValue {
        let cached = CacheValue::ok(point.uuid.clone(), value.clone());
        let read = ReadRegisterValue {
            tag: point.tag.clone(),
            alias: point.alias.clone(),
            slaver_id: point.slaver_id,
            last_fetch_time: cached.last_fetch_time,
            value,
        };
        self.runtime.cache.set(&self.device_id, &point.uuid, cached);
        read
    }

    async fn pause(token: &CancellationToken, millis: u64) -> bool {
        tokio::select! {
            _ = token.cancelled() => false,
            _ = tokio::time::sleep(Duration::from_millis(millis)) => true,
        }
    }

    async fn read_points(&self, token: &CancellationToken) -> Vec<ReadRegisterValue> {
        let mut values = Vec::with_capacity(self.config.points.len());
        for point in &self.config.points {
            match self
                .read(point.slaver_id, point.function, point.address, point.quantity)
                .await
            {
                Ok(reading) => {
                    let bytes = match reading {
                        Reading::Bits(bits) => pack_bits(&bits),
                        Reading::Bytes(bytes) => bytes,
                    };
                    let value =
                        parse_modbus_value(&point.data_type, &point.data_order, point.weight, &bytes);
                    values.push(self.record_value(point, value));
                },
                Err(e) => self.record_error(point, &e),
            }
            if !Self::pause(token, point.frequency).await {
                break;
            }
        }
        values
    }

    async fn read_groups(&self, token: &CancellationToken) -> Vec<ReadRegisterValue> {
        let mut values = Vec::with_capacity(self.config.points.len());
        for group in &self.groups {
            match self
                .read(group.slaver_id, group.function, group.address, group.quantity)
                .await
            {
                Ok(Reading::Bits(bits)) => {
                    for point in &group.points {
                        let offset = usize::from(point.address - group.address);
                        let bit = bits.get(offset).copied().unwrap_or(false);
                        values.push(self.record_value(point, u8::from(bit).to_string()));
                    }
                },
                Ok(Reading::Bytes(bytes)) => {
                    for point in &group.points {
                        let start = usize::from(point.address - group.address) * 2;
                        let end = start + usize::from(point.quantity) * 2;
                        let slice = bytes.get(start..end.min(bytes.len())).unwrap_or(&[]);
                        let value =
                            parse_modbus_value(&point.data_type, &point.data_order, point.weight, slice);
                        values.push(self.record_value(point, value));
                    }
                },
                Err(e) => {
                    for point in &group.points {
                        self.record_error(point, &e);
                    }
                },
            }
            if !Self::pause(token, group.frequency).await {
                break;
            }
        }
        values
    }

    fn dispatch(&self, values: &[ReadRegisterValue]) {
        if values.is_empty() {
            return;
        }
        let Ok(engine) = self.engine.get() else {
            return;
        };
        let payloads: Vec<serde_json::Result<String>> = if self.config.common_config.batch_request {
            vec![serde_json::to_string(values)]
        } else {
            values.iter().map(serde_json::to_string).collect()
        };
        for payload in payloads {
            let pushed = payload
                .map_err(RhilexError::from)
                .and_then(|p| engine.work_device(&self.device_id, &p));
            if let Err(e) = pushed {
                debug!("Dispatch from {} failed: {}", self.device_id, e);
            }
        }
    }
}

/// Build the write request a script asked for
fn write_request(write: &RegisterWrite) -> RhilexResult<ModbusRequest> {
    let bytes = write.value_bytes()?;
    let request = match write.function {
        5 => {
            let value = match bytes.first() {
                Some(0) => false,
                Some(1) => true,
                _ => {
                    return Err(RhilexError::Validation(
                        "Value Only Support '00' or '01'".to_string(),
                    ))
                },
            };
            ModbusRequest::WriteSingleCoil {
                address: write.address,
                value,
            }
        },
        6 => {
            let mut be = [0u8; 2];
            let n = bytes.len().min(2);
            be[2 - n..].copy_from_slice(&bytes[..n]);
            ModbusRequest::WriteSingleRegister {
                address: write.address,
                value: u16::from_be_bytes(be),
            }
        },
        15 => ModbusRequest::WriteMultipleCoils {
            address: write.address,
            values: unpack_bits(&bytes, usize::from(write.quantity)),
        },
        16 => {
            let mut padded = bytes;
            if padded.len() % 2 != 0 {
                padded.insert(0, 0);
            }
            ModbusRequest::WriteMultipleRegisters {
                address: write.address,
                values: padded
                    .chunks(2)
                    .map(|c| u16::from_be_bytes([c[0], c[1]]))
                    .collect(),
            }
        },
        other => return Err(RhilexError::Unsupported(format!("write function {}", other))),
    };
    Ok(request)
}

pub struct ModbusMaster {
    runtime: RuntimeContext,
    engine: EngineRef,
    state: StateCell,
    device_id: RwLock<String>,
    config: RwLock<ModbusMasterConfig>,
    groups: RwLock<Vec<PointGroup>>,
    client: Arc<tokio::sync::Mutex<Option<ModbusClient>>>,
    retries: Arc<AtomicU32>,
    token: Mutex<Option<CancellationToken>>,
    poller: Mutex<Option<JoinHandle<()>>>,
}

impl ModbusMaster {
    pub fn new(runtime: RuntimeContext, engine: EngineRef) -> Self {
        Self {
            runtime,
            engine,
            state: StateCell::default(),
            device_id: RwLock::new(String::new()),
            config: RwLock::new(ModbusMasterConfig::default()),
            groups: RwLock::new(Vec::new()),
            client: Arc::new(tokio::sync::Mutex::new(None)),
            retries: Arc::new(AtomicU32::new(0)),
            token: Mutex::new(None),
            poller: Mutex::new(None),
        }
    }

    pub fn config(&self) -> ModbusMasterConfig {
        self.config.read().clone()
    }

    async fn connect(&self, config: &ModbusMasterConfig, device_id: &str) -> RhilexResult<ModbusClient> {
        if config.common_config.mode == MODE_UART {
            let port = self.runtime.hwports.get(&config.port_uuid)?;
            let params = SerialParams {
                port: port.config.uart.clone(),
                baud_rate: port.config.baud_rate,
                data_bits: port.config.data_bits,
                parity: port.config.parity.clone(),
                stop_bits: port.config.stop_bits,
                timeout: Duration::from_millis(port.config.timeout),
            };
            self.runtime.hwports.set_busy(
                &config.port_uuid,
                UartOccupy::device(device_id, device_name(&self.engine, device_id)),
            )?;
            match ModbusClient::open_rtu(&params) {
                Ok(client) => Ok(client),
                Err(e) => {
                    self.runtime.hwports.free(&config.port_uuid);
                    Err(e.into())
                },
            }
        } else {
            let host = &config.host_config;
            let client =
                ModbusClient::connect_tcp(&host.host, host.port, Duration::from_millis(host.timeout))
                    .await?;
            Ok(client)
        }
    }
}

/// Mark every point without a row yet as loading
fn seed_slot(runtime: &RuntimeContext, device_id: &str, points: &[RegisterRW]) {
    runtime.cache.with_slot_mut(device_id, |rows| {
        for point in points {
            rows.entry(point.uuid.clone())
                .or_insert_with(|| CacheValue::error(point.uuid.clone(), "Device Loading"));
        }
    });
}

#[async_trait]
impl XStatus for ModbusMaster {
    async fn init(&self, uuid: &str, config: &serde_json::Value) -> RhilexResult<()> {
        let config: ModbusMasterConfig = bind_config(config)?;
        config.validate()?;

        self.runtime.cache.register_slot(uuid);
        seed_slot(&self.runtime, uuid, &config.points);
        if config.common_config.mode == MODE_UART {
            let port = self.runtime.hwports.get(&config.port_uuid)?;
            if port.busy && port.occupy_by.uuid != uuid {
                return Err(RhilexError::PortBusy {
                    port: port.uuid,
                    owner: port.occupy_by.to_string(),
                });
            }
        }
        let groups = if config.common_config.enable_optimize {
            let groups = group_points(&config.points, config.common_config.max_reg_num);
            for (i, g) in groups.iter().enumerate() {
                debug!(
                    "Register group {}: fc={} slave={} address={} quantity={}",
                    i, g.function, g.slaver_id, g.address, g.quantity
                );
            }
            groups
        } else {
            Vec::new()
        };

        *self.device_id.write() = uuid.to_string();
        *self.groups.write() = groups;
        *self.config.write() = config;
        self.retries.store(0, Ordering::Relaxed);
        Ok(())
    }

    async fn start(&self, ctx: CancellationToken) -> RhilexResult<()> {
        let device_id = self.device_id.read().clone();
        let config = self.config();
        // stop drops the slot; a restart without a fresh init brings it back
        self.runtime.cache.ensure_slot(&device_id);
        seed_slot(&self.runtime, &device_id, &config.points);
        bind_cecolla(&self.runtime, &config.cecolla_config, &device_id)?;

        let client = match self.connect(&config, &device_id).await {
            Ok(client) => client,
            Err(e) => {
                unbind_cecolla(&self.runtime, &config.cecolla_config, &device_id);
                return Err(e);
            },
        };
        *self.client.lock().await = Some(client);
        self.retries.store(0, Ordering::Relaxed);

        let token = ctx.child_token();
        if config.common_config.auto_request {
            let poller = Poller {
                device_id: device_id.clone(),
                runtime: self.runtime.clone(),
                engine: self.engine.clone(),
                groups: self.groups.read().clone(),
                config,
                client: Arc::clone(&self.client),
                retries: Arc::clone(&self.retries),
            };
            let handle = tokio::spawn(poller.run(token.clone()));
            if let Some(old) = self.poller.lock().replace(handle) {
                old.abort();
            }
        }
        if let Some(old) = self.token.lock().replace(token) {
            old.cancel();
        }
        self.state.set(ResourceState::Up);
        info!("Modbus master {} started", device_id);
        Ok(())
    }

    fn status(&self) -> ResourceState {
        if self.retries.load(Ordering::Relaxed) > self.runtime.config.retry_threshold {
            return ResourceState::Down;
        }
        self.state.get()
    }

    fn set_state(&self, state: ResourceState) {
        self.state.set(state);
    }

    async fn stop(&self) {
        if let Some(token) = self.token.lock().take() {
            token.cancel();
        }
        if let Some(handle) = self.poller.lock().take() {
            handle.abort();
        }
        self.client.lock().await.take();

        let device_id = self.device_id.read().clone();
        let config = self.config();
        if config.common_config.mode == MODE_UART {
            self.runtime.hwports.free(&config.port_uuid);
        }
        unbind_cecolla(&self.runtime, &config.cecolla_config, &device_id);
        self.runtime.cache.unregister_slot(&device_id);
        self.state.set(ResourceState::Stop);
    }
}

#[async_trait]
impl XDevice for ModbusMaster {
    /// JSON list of the device's current cache rows
    async fn on_read(&self, _cmd: &[u8]) -> RhilexResult<Vec<u8>> {
        let device_id = self.device_id.read().clone();
        let rows = self.runtime.cache.get_slot(&device_id).unwrap_or_default();
        Ok(serde_json::to_vec(&rows)?)
    }

    async fn on_write(&self, cmd: &[u8], data: &[u8]) -> RhilexResult<usize> {
        let write: RegisterWrite = serde_json::from_slice(data)?;
        let expected = format!("F{}", write.function);
        if cmd != expected.as_bytes() {
            return Err(RhilexError::InvalidParameter {
                param: "cmd".to_string(),
                reason: format!(
                    "{} does not match function {}",
                    String::from_utf8_lossy(cmd),
                    write.function
                ),
            });
        }
        let request = write_request(&write)?;
        let mut guard = self.client.lock().await;
        let client = guard
            .as_mut()
            .ok_or_else(|| RhilexError::runtime("modbus client not connected"))?;
        client.write(write.slaver_id, &request).await?;
        Ok(data.len())
    }
}
