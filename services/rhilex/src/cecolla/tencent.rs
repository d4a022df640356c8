//! `TENCENT_IOTHUB_CEC`: Tencent IoT Explorer adapter
//!
//! Data topics are `$thing/{up,down}/{property,action}/<product>/<device>`;
//! gateways manage sub-devices over `$gateway/operation/..`.

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

use super::auth::{self, AuthInfo};
use super::{
    check_mode, dispatch_downlink, load_action, message_token, unload_action, CloudLink,
    MODE_DEVICE, MODE_GATEWAY,
};
use crate::engine::EngineRef;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TencentConfig {
    /// Empty means the product's public hub endpoint
    pub server_endpoint: String,
    /// DEVICE | GATEWAY
    pub mode: String,
    pub product_id: String,
    pub device_name: String,
    /// Base64 device secret
    pub device_psk: String,
}

impl Default for TencentConfig {
    fn default() -> Self {
        Self {
            server_endpoint: String::new(),
            mode: MODE_DEVICE.to_string(),
            product_id: String::new(),
            device_name: String::new(),
            device_psk: String::new(),
        }
    }
}

impl TencentConfig {
    pub fn validate(&self) -> RhilexResult<()> {
        check_mode(&self.mode)?;
        for (field, value) in [
            ("productId", &self.product_id),
            ("deviceName", &self.device_name),
            ("devicePsk", &self.device_psk),
        ] {
            if value.is_empty() {
                return Err(RhilexError::MissingConfig(field.to_string()));
            }
        }
        Ok(())
    }

    pub fn endpoint(&self) -> String {
        if self.server_endpoint.is_empty() {
            format!("tcp://{}.iotcloud.tencentdevices.com:1883", self.product_id)
        } else {
            self.server_endpoint.clone()
        }
    }
}

#[derive(Debug, Clone, Default)]
struct Topics {
    property_up: String,
    property_down: String,
    action_up: String,
    action_down: String,
    operation_up: String,
    operation_down: String,
}

impl Topics {
    fn new(product: &str, device: &str) -> Self {
        let t = |prefix: &str| format!("{}/{}/{}", prefix, product, device);
        Self {
            property_up: t("$thing/up/property"),
            property_down: t("$thing/down/property"),
            action_up: t("$thing/up/action"),
            action_down: t("$thing/down/action"),
            operation_up: t("$gateway/operation"),
            operation_down: t("$gateway/operation/result"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TencentSubDevice {
    #[serde(rename = "productID")]
    pub product_id: String,
    #[serde(rename = "deviceName")]
    pub device_name: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct OperationResult {
    payload: OperationPayload,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct OperationPayload {
    devices: Vec<TencentSubDevice>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct DownMessage {
    method: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct SubDeviceParam {
    #[serde(rename = "productID")]
    product_id: String,
    #[serde(rename = "deviceName")]
    device_name: String,
}

fn reply(method: &str, token: &str, success: bool) -> String {
    let (code, status) = if success { (0, "success") } else { (1, "failure") };
    json!({ "method": method, "clientToken": token, "code": code, "status": status }).to_string()
}

struct Inner {
    id: RwLock<String>,
    runtime: RuntimeContext,
    engine: EngineRef,
    state: Arc<StateCell>,
    config: RwLock<TencentConfig>,
    auth: RwLock<AuthInfo>,
    topics: RwLock<Topics>,
    has_action: AtomicBool,
    link: Mutex<Option<Arc<CloudLink>>>,
    sub_devices: Mutex<Vec<TencentSubDevice>>,
}

impl Inner {
    async fn publish(&self, topic: &str, payload: String) -> RhilexResult<()> {
        let link = self
            .link
            .lock()
            .clone()
            .ok_or_else(|| RhilexError::ResourceDown(format!("tencent iothub {}", self.id.read())))?;
        link.publish(topic, payload).await
    }

    fn on_message(&self, topic: &str, payload: &[u8]) {
        let topics = self.topics.read().clone();
        if topic == topics.property_down || topic == topics.action_down {
            let method = serde_json::from_slice::<DownMessage>(payload)
                .map(|m| m.method)
                .unwrap_or_default();
            debug!("IOTHUB downlink {} method={}", topic, method);
            let actionable = matches!(method.as_str(), "control" | "get_status" | "action");
            let run_action = actionable && self.has_action.load(Ordering::SeqCst);
            dispatch_downlink(&self.runtime, &self.engine, &self.id.read(), run_action, topic, payload);
        } else if topic == topics.operation_down {
            match serde_json::from_slice::<OperationResult>(payload) {
                Ok(result) => {
                    let mut known = self.sub_devices.lock();
                    for device in result.payload.devices {
                        if !known.contains(&device) {
                            known.push(device);
                        }
                    }
                },
                Err(e) => warn!("IOTHUB bad operation result: {}", e),
            }
        }
    }
}

pub struct TencentCecolla {
    inner: Arc<Inner>,
}

impl TencentCecolla {
    pub fn new(runtime: RuntimeContext, engine: EngineRef) -> Self {
        Self {
            inner: Arc::new(Inner {
                id: RwLock::new(String::new()),
                runtime,
                engine,
                state: Arc::new(StateCell::default()),
                config: RwLock::new(TencentConfig::default()),
                auth: RwLock::new(AuthInfo::default()),
                topics: RwLock::new(Topics::default()),
                has_action: AtomicBool::new(false),
                link: Mutex::new(None),
                sub_devices: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn sub_devices(&self) -> Vec<TencentSubDevice> {
        self.inner.sub_devices.lock().clone()
    }
}

#[async_trait]
impl XStatus for TencentCecolla {
    async fn init(&self, uuid: &str, config: &Value) -> RhilexResult<()> {
        let config: TencentConfig = bind_config(config)?;
        config.validate()?;
        let auth = auth::tencent(&config.product_id, &config.device_name, &config.device_psk)?;
        debug!("IOTHUB client id: {}", auth.client_id);
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
            &config.endpoint(),
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
            info!("Connect iothub with Gateway Mode");
            link.subscribe(&topics.operation_down).await?;
            link.publish(&topics.operation_up, json!({ "type": "describe_sub_devices" }).to_string())
                .await?;
        }
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
impl XCecolla for TencentCecolla {
    async fn on_ctrl(&self, cmd: &str, args: &[u8]) -> RhilexResult<Vec<u8>> {
        let topics = self.inner.topics.read().clone();
        let token = String::from_utf8_lossy(args).into_owned();
        let (topic, message) = match cmd {
            "ActionReplySuccess" | "ActionReplyFailure" => (
                topics.action_up,
                reply("action_reply", &token, cmd == "ActionReplySuccess"),
            ),
            "PropertyReplySuccess" | "PropertyReplyFailure" | "CtrlReplySuccess" | "CtrlReplyFailure" => (
                topics.property_up,
                reply("control_reply", &token, cmd.ends_with("Success")),
            ),
            "PropertyReport" | "GetPropertyReply" => {
                let params: Map<String, Value> =
                    serde_json::from_slice(args).map_err(|e| RhilexError::InvalidParameter {
                        param: cmd.to_string(),
                        reason: e.to_string(),
                    })?;
                let message = if cmd == "PropertyReport" {
                    json!({
                        "method": "report",
                        "clientToken": message_token(),
                        "timestamp": common::time::now_ms(),
                        "params": params,
                    })
                } else {
                    json!({
                        "method": "get_status_reply",
                        "type": "report",
                        "clientToken": message_token(),
                        "timestamp": common::time::now_ms(),
                        "code": 0,
                        "data": params,
                        "msg": "success",
                    })
                };
                (topics.property_up, message.to_string())
            },
            "SubDeviceSetOnline" => {
                let param: SubDeviceParam =
                    serde_json::from_slice(args).map_err(|e| RhilexError::InvalidParameter {
                        param: cmd.to_string(),
                        reason: e.to_string(),
                    })?;
                let message = json!({
                    "type": "online",
                    "payload": {
                        "devices": [{ "product_id": param.product_id, "device_name": param.device_name }],
                    },
                });
                (topics.operation_up, message.to_string())
            },
            other => return Err(RhilexError::Unsupported(format!("tencent iothub ctrl: {}", other))),
        };
        self.inner.publish(&topic, message).await?;
        Ok(Vec::new())
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use super::*;
    use crate::broker::{Broker, BrokerConfig};
    use crate::sources::await_connack;
    use base64::Engine;
    use common::RhilexConfig;
    use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
    use std::time::Duration;

    #[test]
    fn test_default_endpoint() {
        let config = TencentConfig {
            product_id: "ABC123".into(),
            ..TencentConfig::default()
        };
        assert_eq!(config.endpoint(), "tcp://ABC123.iotcloud.tencentdevices.com:1883");
    }

    #[tokio::test]
    async fn test_action_reply_and_report() {
        let broker = Arc::new(Broker::new(BrokerConfig { port: 0, ..BrokerConfig::default() }));
        let port = broker.start().await.unwrap().port();

        let cecolla = TencentCecolla::new(
            RuntimeContext::new(RhilexConfig::default()),
            EngineRef::detached(),
        );
        let psk = base64::engine::general_purpose::STANDARD.encode(b"device-secret");
        let config = json!({
            "serverEndpoint": format!("tcp://127.0.0.1:{}", port),
            "productId": "PROD",
            "deviceName": "dev1",
            "devicePsk": psk,
        });
        cecolla.init("tc1", &config).await.unwrap();
        cecolla.start(CancellationToken::new()).await.unwrap();

        let (client, mut eventloop) = AsyncClient::new(MqttOptions::new("watcher", "127.0.0.1", port), 16);
        await_connack(&mut eventloop, "broker").await.unwrap();
        client.subscribe("$thing/up/action/PROD/dev1", QoS::AtMostOnce).await.unwrap();
        client.subscribe("$thing/up/property/PROD/dev1", QoS::AtMostOnce).await.unwrap();
        let mut acks = 0;
        while acks < 2 {
            if let Event::Incoming(Packet::SubAck(_)) = eventloop.poll().await.unwrap() {
                acks += 1;
            }
        }

        cecolla.on_ctrl("ActionReplyFailure", b"tok-9").await.unwrap();
        cecolla.on_ctrl("PropertyReport", br#"{"power":1}"#).await.unwrap();

        let mut received = Vec::new();
        let wait = async {
            while received.len() < 2 {
                if let Event::Incoming(Packet::Publish(p)) = eventloop.poll().await.unwrap() {
                    let body: Value = serde_json::from_slice(&p.payload).unwrap();
                    received.push((p.topic.clone(), body));
                }
            }
        };
        tokio::time::timeout(Duration::from_secs(5), wait).await.unwrap();

        let (topic, reply) = &received[0];
        assert_eq!(topic, "$thing/up/action/PROD/dev1");
        assert_eq!(reply["method"], "action_reply");
        assert_eq!(reply["clientToken"], "tok-9");
        assert_eq!(reply["code"], 1);

        let (_, report) = &received[1];
        assert_eq!(report["method"], "report");
        assert_eq!(report["params"]["power"], 1);
        assert!(report["clientToken"].as_str().is_some_and(|t| !t.is_empty()));

        assert!(cecolla.on_ctrl("GetSchema", b"").await.is_err());
        cecolla.stop().await;
        broker.stop();
    }
}
