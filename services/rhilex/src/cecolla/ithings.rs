//! `ITHINGS_IOTHUB_CEC`: iThings IoT hub adapter
//!
//! Topics are `$thing/{up,down}/{property,action}/<product>/<device>` for
//! the gateway itself, plus `$gateway/{up,down}/{thing,topo,status}/..` for
//! schema, topology and sub-device status in GATEWAY mode.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use common::bind_config;
use errors::{RhilexError, RhilexResult};
use parking_lot::{Mutex, RwLock};
use rhilex_core::{ResourceState, RuntimeContext, StateCell, XCecolla, XStatus};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::auth::{self, AuthInfo, SignMethod};
use super::{
    check_mode, dispatch_downlink, load_action, message_token, point_value_type, unload_action,
    CloudLink, MODE_DEVICE, MODE_GATEWAY,
};
use crate::engine::EngineRef;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct IthingsConfig {
    pub server_endpoint: String,
    /// DEVICE | GATEWAY
    pub mode: String,
    /// Product of the sub-devices, GATEWAY mode only
    pub sub_product: String,
    pub product_id: String,
    pub device_name: String,
    pub device_psk: String,
    pub sign_method: SignMethod,
}

impl Default for IthingsConfig {
    fn default() -> Self {
        Self {
            server_endpoint: "tcp://127.0.0.1:1883".to_string(),
            mode: MODE_DEVICE.to_string(),
            sub_product: String::new(),
            product_id: String::new(),
            device_name: String::new(),
            device_psk: String::new(),
            sign_method: SignMethod::default(),
        }
    }
}

impl IthingsConfig {
    pub fn validate(&self) -> RhilexResult<()> {
        check_mode(&self.mode)?;
        let required = [
            ("productId", &self.product_id),
            ("deviceName", &self.device_name),
            ("devicePsk", &self.device_psk),
        ];
        for (field, value) in required {
            if value.is_empty() {
                return Err(RhilexError::MissingConfig(field.to_string()));
            }
        }
        if self.mode == MODE_GATEWAY && self.sub_product.is_empty() {
            return Err(RhilexError::MissingConfig("subProduct".to_string()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
struct Topics {
    property_up: String,
    property_down: String,
    action_up: String,
    action_down: String,
    gateway_up: String,
    gateway_down: String,
    topo_up: String,
    topo_down: String,
    status_up: String,
}

impl Topics {
    fn new(product: &str, device: &str) -> Self {
        let t = |prefix: &str| format!("{}/{}/{}", prefix, product, device);
        Self {
            property_up: t("$thing/up/property"),
            property_down: t("$thing/down/property"),
            action_up: t("$thing/up/action"),
            action_down: t("$thing/down/action"),
            gateway_up: t("$gateway/up/thing"),
            gateway_down: t("$gateway/down/thing"),
            topo_up: t("$gateway/up/topo"),
            topo_down: t("$gateway/down/topo"),
            status_up: t("$gateway/up/status"),
        }
    }
}

fn gateway_thing_up(product: &str, device: &str) -> String {
    format!("$gateway/up/thing/{}/{}", product, device)
}

fn property_up(product: &str, device: &str) -> String {
    format!("$thing/up/property/{}/{}", product, device)
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SubDevice {
    #[serde(rename = "productID", default)]
    pub product_id: String,
    #[serde(rename = "deviceName", default)]
    pub device_name: String,
}

#[derive(Debug, Default, Deserialize)]
struct DownMessage {
    #[serde(default)]
    method: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct SchemaResponse {
    payload: SchemaPayload,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct SchemaPayload {
    product_id: String,
    schema: Value,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct TopologyResponse {
    payload: TopologyPayload,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct TopologyPayload {
    devices: Vec<SubDevice>,
}

/// Arguments of `GetProperties` and `GetPropertyReplySuccess`
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct PropertiesCmd {
    token: String,
    #[serde(rename = "productID")]
    product_id: String,
    #[serde(rename = "deviceName")]
    device_name: String,
    identifiers: Vec<String>,
    data: Option<Value>,
}

/// Arguments of `SubDeviceSetOnline` and `PackReportSubDeviceParams`
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct SubDeviceParam {
    timestamp: i64,
    #[serde(rename = "productID")]
    product_id: String,
    #[serde(rename = "deviceName")]
    device_name: String,
    param: String,
    value: Value,
}

/// One entry of `CreateSubDeviceSchema`
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct SchemaProperty {
    id: String,
    name: String,
    #[serde(rename = "type")]
    data_type: String,
    #[serde(rename = "productID")]
    product_id: String,
    #[serde(rename = "deviceName")]
    device_name: String,
}

fn slot_key(product: &str, device: &str, param: &str) -> String {
    format!("{}:{}:{}", product, device, param)
}

/// Zero value a schema property starts with
fn initial_value(value_type: &str) -> Value {
    match value_type {
        "bool" => json!(false),
        "int" => json!(0),
        "float" => json!(0.0),
        "string" => json!(""),
        _ => Value::Null,
    }
}

fn reply(method: &str, token: &str, success: bool) -> String {
    let (code, msg) = if success { (200, "success") } else { (400, "failure") };
    json!({ "method": method, "msgToken": token, "code": code, "msg": msg }).to_string()
}

fn get_schema(product: &str) -> String {
    json!({ "method": "getSchema", "msgToken": message_token(), "payload": { "productID": product } })
        .to_string()
}

fn parse<'a, T: Deserialize<'a>>(cmd: &str, args: &'a [u8]) -> RhilexResult<T> {
    serde_json::from_slice(args).map_err(|e| RhilexError::InvalidParameter {
        param: cmd.to_string(),
        reason: e.to_string(),
    })
}

struct Inner {
    id: RwLock<String>,
    runtime: RuntimeContext,
    engine: EngineRef,
    state: Arc<StateCell>,
    config: RwLock<IthingsConfig>,
    auth: RwLock<AuthInfo>,
    topics: RwLock<Topics>,
    has_action: AtomicBool,
    link: Mutex<Option<Arc<CloudLink>>>,
    gateway_schema: Mutex<Option<Value>>,
    sub_device_schema: Mutex<Option<Value>>,
    sub_devices: Mutex<Vec<SubDevice>>,
    /// `product:device:param` -> last known value
    properties: Mutex<HashMap<String, Value>>,
}

impl Inner {
    fn link(&self) -> RhilexResult<Arc<CloudLink>> {
        self.link
            .lock()
            .clone()
            .ok_or_else(|| RhilexError::ResourceDown(format!("ithings {}", self.id.read())))
    }

    async fn publish(&self, topic: &str, payload: String) -> RhilexResult<()> {
        self.link()?.publish(topic, payload).await
    }

    fn lookup(&self, product: &str, device: &str, identifiers: &[String]) -> Map<String, Value> {
        let properties = self.properties.lock();
        identifiers
            .iter()
            .map(|id| {
                let value = properties.get(&slot_key(product, device, id)).cloned().unwrap_or(Value::Null);
                (id.clone(), value)
            })
            .collect()
    }

    fn on_message(&self, topic: &str, payload: &[u8]) {
        let topics = self.topics.read().clone();
        if topic == topics.property_down || topic == topics.action_down {
            let method = serde_json::from_slice::<DownMessage>(payload)
                .map(|m| m.method)
                .unwrap_or_default();
            debug!("IThings downlink {} method={}", topic, method);
            let actionable = matches!(method.as_str(), "control" | "getReport" | "action");
            let run_action = actionable && self.has_action.load(Ordering::SeqCst);
            dispatch_downlink(&self.runtime, &self.engine, &self.id.read(), run_action, topic, payload);
        } else if topic == topics.gateway_down {
            match serde_json::from_slice::<SchemaResponse>(payload) {
                Ok(response) => self.on_schema(response.payload),
                Err(e) => warn!("IThings bad schema response: {}", e),
            }
        } else if topic == topics.topo_down {
            match serde_json::from_slice::<TopologyResponse>(payload) {
                Ok(response) => {
                    debug!("IThings topology: {} sub devices", response.payload.devices.len());
                    *self.sub_devices.lock() = response.payload.devices;
                },
                Err(e) => warn!("IThings bad topology response: {}", e),
            }
        } else {
            debug!("IThings ignored message on {}", topic);
        }
    }

    fn on_schema(&self, payload: SchemaPayload) {
        let config = self.config.read().clone();
        if payload.product_id == config.product_id {
            let mut properties = self.properties.lock();
            let declared = payload.schema.get("properties").and_then(Value::as_array);
            for property in declared.into_iter().flatten() {
                let id = property.get("id").and_then(Value::as_str).unwrap_or_default();
                let value_type = property.get("type").and_then(Value::as_str).unwrap_or_default();
                if !id.is_empty() {
                    properties
                        .entry(slot_key(&config.product_id, &config.device_name, id))
                        .or_insert_with(|| initial_value(value_type));
                }
            }
            *self.gateway_schema.lock() = Some(payload.schema);
            debug!("Get Gateway Schema Success");
        } else if !config.sub_product.is_empty() && payload.product_id == config.sub_product {
            *self.sub_device_schema.lock() = Some(payload.schema);
            debug!("Get SubDevice Schema Success");
        }
    }

    async fn create_schema(&self, args: &[u8]) -> RhilexResult<()> {
        let properties: Vec<SchemaProperty> = parse("CreateSubDeviceSchema", args)?;
        let config = self.config.read().clone();
        for property in properties {
            let product = if property.product_id.is_empty() { &config.product_id } else { &property.product_id };
            let device = if property.device_name.is_empty() { &config.device_name } else { &property.device_name };
            let value_type = point_value_type(&property.data_type);
            let message = json!({
                "method": "createSchema",
                "msgToken": message_token(),
                "timestamp": common::time::now_ms(),
                "properties": [{ "id": property.id, "name": property.name, "type": value_type }],
            });
            self.publish(&gateway_thing_up(product, device), message.to_string()).await?;
            self.properties
                .lock()
                .insert(slot_key(product, device, &property.id), initial_value(value_type));
        }
        if !config.sub_product.is_empty() {
            let topic = self.topics.read().gateway_up.clone();
            self.publish(&topic, get_schema(&config.sub_product)).await?;
        }
        Ok(())
    }
}

pub struct IthingsCecolla {
    inner: Arc<Inner>,
}

impl IthingsCecolla {
    pub fn new(runtime: RuntimeContext, engine: EngineRef) -> Self {
        Self {
            inner: Arc::new(Inner {
                id: RwLock::new(String::new()),
                runtime,
                engine,
                state: Arc::new(StateCell::default()),
                config: RwLock::new(IthingsConfig::default()),
                auth: RwLock::new(AuthInfo::default()),
                topics: RwLock::new(Topics::default()),
                has_action: AtomicBool::new(false),
                link: Mutex::new(None),
                gateway_schema: Mutex::new(None),
                sub_device_schema: Mutex::new(None),
                sub_devices: Mutex::new(Vec::new()),
                properties: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Sub-devices reported by the last topology response
    pub fn sub_devices(&self) -> Vec<SubDevice> {
        self.inner.sub_devices.lock().clone()
    }
}

#[async_trait]
impl XStatus for IthingsCecolla {
    async fn init(&self, uuid: &str, config: &Value) -> RhilexResult<()> {
        let config: IthingsConfig = bind_config(config)?;
        config.validate()?;
        let auth = auth::ithings(&config.product_id, &config.device_name, &config.device_psk, config.sign_method)?;
        *self.inner.topics.write() = Topics::new(&config.product_id, &config.device_name);
        *self.inner.auth.write() = auth;
        *self.inner.config.write() = config;
        *self.inner.id.write() = uuid.to_string();
        let has_action = load_action(&self.inner.engine, uuid)?;
        self.inner.has_action.store(has_action, Ordering::SeqCst);
        Ok(())
    }

    async fn start(&self, ctx: CancellationToken) -> RhilexResult<()> {
        let config = self.inner.config.read().clone();
        let auth = self.inner.auth.read().clone();
        let topics = self.inner.topics.read().clone();

        let inner = Arc::downgrade(&self.inner);
        let link = CloudLink::connect(
            &config.server_endpoint,
            &auth,
            ctx,
            Arc::clone(&self.inner.state),
            move |topic, payload| {
                if let Some(inner) = inner.upgrade() {
                    inner.on_message(topic, payload);
                }
            },
        )
        .await?;
        let link = Arc::new(link);
        if let Some(old) = self.inner.link.lock().replace(Arc::clone(&link)) {
            old.close();
        }

        link.subscribe(&topics.property_down).await?;
        link.subscribe(&topics.action_down).await?;
        if config.mode == MODE_GATEWAY {
            info!("Connect IThings with Gateway Mode");
            link.subscribe(&topics.gateway_down).await?;
            link.subscribe(&topics.topo_down).await?;
            link.publish(&topics.gateway_up, get_schema(&config.sub_product)).await?;
            let topo = json!({ "method": "getTopo", "msgToken": message_token() });
            link.publish(&topics.topo_up, topo.to_string()).await?;
        }
        link.publish(&topics.gateway_up, get_schema(&config.product_id)).await?;

        self.inner.state.set(ResourceState::Up);
        Ok(())
    }

    fn status(&self) -> ResourceState {
        self.inner.state.get()
    }

    fn set_state(&self, state: ResourceState) {
        self.inner.state.set(state);
    }

    async fn stop(&self) {
        if let Some(link) = self.inner.link.lock().take() {
            link.close();
        }
        let id = self.inner.id.read().clone();
        if self.inner.has_action.swap(false, Ordering::SeqCst) {
            unload_action(&self.inner.engine, &id);
        }
        self.inner.state.set(ResourceState::Stop);
    }
}

#[async_trait]
impl XCecolla for IthingsCecolla {
    async fn on_ctrl(&self, cmd: &str, args: &[u8]) -> RhilexResult<Vec<u8>> {
        let inner = &self.inner;
        let topics = inner.topics.read().clone();
        let token = || String::from_utf8_lossy(args).into_owned();
        match cmd {
            "GetProperties" => {
                let query: PropertiesCmd = parse(cmd, args)?;
                let values = inner.lookup(&query.product_id, &query.device_name, &query.identifiers);
                Ok(serde_json::to_vec(&values)?)
            },
            "GetSchema" => {
                let schema = json!({
                    "gatewaySchema": inner.gateway_schema.lock().clone(),
                    "subDeviceSchema": inner.sub_device_schema.lock().clone(),
                });
                Ok(serde_json::to_vec(&schema)?)
            },
            "CreateSubDeviceSchema" => {
                inner.create_schema(args).await?;
                Ok(Vec::new())
            },
            "SubDeviceSetOnline" => {
                let param: SubDeviceParam = parse(cmd, args)?;
                let message = json!({
                    "method": "online",
                    "msgToken": message_token(),
                    "payload": {
                        "devices": [{ "productID": param.product_id, "deviceName": param.device_name }],
                    },
                });
                inner.publish(&topics.status_up, message.to_string()).await?;
                Ok(Vec::new())
            },
            "PackReportSubDeviceParams" => {
                let param: SubDeviceParam = parse(cmd, args)?;
                inner.properties.lock().insert(
                    slot_key(&param.product_id, &param.device_name, &param.param),
                    param.value.clone(),
                );
                let timestamp = if param.timestamp > 0 { param.timestamp } else { common::time::now_ms() as i64 };
                let mut params = Map::new();
                params.insert(param.param.clone(), param.value.clone());
                let message = json!({
                    "method": "packReport",
                    "msgToken": message_token(),
                    "timestamp": timestamp,
                    "subDevices": [{
                        "productID": param.product_id,
                        "deviceName": param.device_name,
                        "properties": [{ "timestamp": timestamp, "params": params }],
                    }],
                });
                inner.publish(&topics.property_up, message.to_string()).await?;
                Ok(Vec::new())
            },
            "CtrlReplySuccess" | "CtrlReplyFailure" => {
                let message = reply("controlReply", &token(), cmd == "CtrlReplySuccess");
                inner.publish(&topics.property_up, message).await?;
                Ok(Vec::new())
            },
            "ActionReplySuccess" | "ActionReplyFailure" => {
                let message = reply("actionReply", &token(), cmd == "ActionReplySuccess");
                inner.publish(&topics.action_up, message).await?;
                Ok(Vec::new())
            },
            "PropertyReplySuccess" | "PropertyReplyFailure" => {
                let message = reply("reportReply", &token(), cmd == "PropertyReplySuccess");
                inner.publish(&topics.property_up, message).await?;
                Ok(Vec::new())
            },
            "PropertyReport" => {
                let params: Map<String, Value> = parse(cmd, args)?;
                let message = json!({
                    "method": "report",
                    "msgToken": message_token(),
                    "timestamp": common::time::now_ms(),
                    "params": params,
                });
                inner.publish(&topics.property_up, message.to_string()).await?;
                Ok(Vec::new())
            },
            "GetPropertyReplySuccess" | "GetPropertyReply" => {
                let query: PropertiesCmd = parse(cmd, args)?;
                let data = match query.data {
                    Some(Value::Object(data)) => data,
                    _ => inner.lookup(&query.product_id, &query.device_name, &query.identifiers),
                };
                let token = if query.token.is_empty() { message_token() } else { query.token };
                let message = json!({
                    "method": "getReportReply",
                    "msgToken": token,
                    "timestamp": common::time::now_ms(),
                    "code": 200,
                    "data": data,
                    "msg": "success",
                });
                let topic = if query.product_id.is_empty() {
                    topics.property_up.clone()
                } else {
                    property_up(&query.product_id, &query.device_name)
                };
                inner.publish(&topic, message.to_string()).await?;
                Ok(Vec::new())
            },
            other => Err(RhilexError::Unsupported(format!("ithings ctrl: {}", other))),
        }
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use super::*;
    use crate::broker::{Broker, BrokerConfig};
    use crate::sources::await_connack;
    use common::RhilexConfig;
    use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
    use std::time::Duration;

    async fn watcher(port: u16, topic: &str) -> (AsyncClient, EventLoop) {
        let options = MqttOptions::new("watcher", "127.0.0.1", port);
        let (client, mut eventloop) = AsyncClient::new(options, 16);
        await_connack(&mut eventloop, "broker").await.unwrap();
        client.subscribe(topic, QoS::AtMostOnce).await.unwrap();
        loop {
            if let Event::Incoming(Packet::SubAck(_)) = eventloop.poll().await.unwrap() {
                break;
            }
        }
        (client, eventloop)
    }

    async fn next_message(eventloop: &mut EventLoop) -> Value {
        let wait = async {
            loop {
                if let Event::Incoming(Packet::Publish(p)) = eventloop.poll().await.unwrap() {
                    return serde_json::from_slice(&p.payload).unwrap();
                }
            }
        };
        tokio::time::timeout(Duration::from_secs(5), wait).await.unwrap()
    }

    async fn started(port: u16) -> IthingsCecolla {
        let cecolla = IthingsCecolla::new(
            RuntimeContext::new(RhilexConfig::default()),
            EngineRef::detached(),
        );
        let config = json!({
            "serverEndpoint": format!("tcp://127.0.0.1:{}", port),
            "productId": "P1",
            "deviceName": "D1",
            "devicePsk": "psk",
        });
        cecolla.init("cec1", &config).await.unwrap();
        cecolla.start(CancellationToken::new()).await.unwrap();
        cecolla
    }

    #[test]
    fn test_config_validation() {
        let mut config = IthingsConfig {
            product_id: "P".into(),
            device_name: "D".into(),
            device_psk: "k".into(),
            ..IthingsConfig::default()
        };
        assert!(config.validate().is_ok());
        config.mode = MODE_GATEWAY.into();
        assert!(config.validate().is_err());
        config.sub_product = "SP".into();
        assert!(config.validate().is_ok());
        config.device_psk.clear();
        assert!(config.validate().is_err());
    }

    #[tokio::test]
    async fn test_ctrl_requires_connection() {
        let cecolla = IthingsCecolla::new(
            RuntimeContext::new(RhilexConfig::default()),
            EngineRef::detached(),
        );
        assert!(cecolla.on_ctrl("ActionReplySuccess", b"tok").await.is_err());
        assert!(cecolla.on_ctrl("Reboot", b"").await.is_err());
    }

    #[tokio::test]
    async fn test_replies_and_reports() {
        let broker = Arc::new(Broker::new(BrokerConfig { port: 0, ..BrokerConfig::default() }));
        let port = broker.start().await.unwrap().port();
        let cecolla = started(port).await;
        assert_eq!(cecolla.status(), ResourceState::Up);

        let (_client, mut up) = watcher(port, "$thing/up/property/P1/D1").await;

        cecolla.on_ctrl("CtrlReplySuccess", b"tok-1").await.unwrap();
        let message = next_message(&mut up).await;
        assert_eq!(message["method"], "controlReply");
        assert_eq!(message["msgToken"], "tok-1");
        assert_eq!(message["code"], 200);

        cecolla.on_ctrl("PropertyReport", br#"{"temp":21.5}"#).await.unwrap();
        let first = next_message(&mut up).await;
        cecolla.on_ctrl("PropertyReport", br#"{"temp":22}"#).await.unwrap();
        let second = next_message(&mut up).await;
        assert_eq!(first["method"], "report");
        assert_eq!(first["params"]["temp"], 21.5);
        assert_ne!(first["msgToken"], second["msgToken"]);

        let param = json!({ "productID": "P1", "deviceName": "D1", "param": "temp", "value": 30 });
        cecolla
            .on_ctrl("PackReportSubDeviceParams", param.to_string().as_bytes())
            .await
            .unwrap();
        let pack = next_message(&mut up).await;
        assert_eq!(pack["method"], "packReport");
        assert_eq!(pack["subDevices"][0]["properties"][0]["params"]["temp"], 30);

        let query = json!({ "productID": "P1", "deviceName": "D1", "identifiers": ["temp", "hum"] });
        let values = cecolla.on_ctrl("GetProperties", query.to_string().as_bytes()).await.unwrap();
        let values: Value = serde_json::from_slice(&values).unwrap();
        assert_eq!(values, json!({ "temp": 30, "hum": null }));

        cecolla.stop().await;
        assert_eq!(cecolla.status(), ResourceState::Stop);
        assert!(cecolla.on_ctrl("PropertyReport", b"{}").await.is_err());
        broker.stop();
    }

    #[tokio::test]
    async fn test_create_schema_maps_point_types() {
        let broker = Arc::new(Broker::new(BrokerConfig { port: 0, ..BrokerConfig::default() }));
        let port = broker.start().await.unwrap().port();
        let cecolla = started(port).await;
        let (_client, mut up) = watcher(port, "$gateway/up/thing/SP/S1").await;

        let schema = json!([{ "id": "t", "name": "temperature", "type": "INT16", "productID": "SP", "deviceName": "S1" }]);
        cecolla
            .on_ctrl("CreateSubDeviceSchema", schema.to_string().as_bytes())
            .await
            .unwrap();
        let message = next_message(&mut up).await;
        assert_eq!(message["method"], "createSchema");
        assert_eq!(message["properties"][0]["type"], "int");

        cecolla.stop().await;
        broker.stop();
    }
}
