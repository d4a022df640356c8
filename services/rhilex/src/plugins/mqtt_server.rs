//! `[plugin.mqtt_server]`: the embedded broker as a standalone service
//!
//! Services:
//! - `clients`: connected clients
//! - `kickout`: array of client ids to disconnect
//! - `publish`: JSON string `{"topic":"..","msg":".."}`

use std::sync::Arc;

use async_trait::async_trait;
use common::IniSection;
use errors::{RhilexError, RhilexResult};
use parking_lot::{Mutex, RwLock};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

use super::{PluginMeta, XPlugin};
use crate::broker::{Broker, BrokerConfig, MqttEvent};
use crate::engine::EngineRef;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PublishArgs {
    topic: String,
    #[serde(default)]
    msg: String,
}

pub struct MqttServerPlugin {
    config: RwLock<BrokerConfig>,
    broker: Mutex<Option<Arc<Broker>>>,
}

impl Default for MqttServerPlugin {
    fn default() -> Self {
        Self::new()
    }
}

impl MqttServerPlugin {
    pub fn new() -> Self {
        Self {
            config: RwLock::new(BrokerConfig::default()),
            broker: Mutex::new(None),
        }
    }

    fn broker(&self) -> RhilexResult<Arc<Broker>> {
        self.broker
            .lock()
            .clone()
            .ok_or_else(|| RhilexError::ResourceDown("mqtt server".to_string()))
    }

    fn kickout(&self, args: &Value) -> RhilexResult<Value> {
        let broker = self.broker()?;
        let ids = args.as_array().ok_or_else(|| RhilexError::InvalidParameter {
            param: "kickout".to_string(),
            reason: "expect an array of client ids".to_string(),
        })?;
        let kicked: Vec<&str> = ids
            .iter()
            .filter_map(Value::as_str)
            .filter(|id| broker.kickout(id))
            .collect();
        Ok(json!(kicked))
    }

    fn publish(&self, args: &Value) -> RhilexResult<Value> {
        let broker = self.broker()?;
        let parsed: Result<PublishArgs, _> = match args {
            Value::String(text) => serde_json::from_str(text),
            other => serde_json::from_value(other.clone()),
        };
        let message = parsed.map_err(|e| RhilexError::InvalidParameter {
            param: "publish".to_string(),
            reason: e.to_string(),
        })?;
        let delivered = broker.publish(&message.topic, message.msg.into_bytes());
        Ok(json!({ "delivered": delivered }))
    }
}

#[async_trait]
impl XPlugin for MqttServerPlugin {
    fn init(&self, section: &IniSection) -> RhilexResult<()> {
        let mut config = BrokerConfig::default();
        if let Some(host) = section.get("host") {
            config.host = host.to_string();
        }
        if let Some(port) = section.get_parsed("port") {
            config.port = port;
        }
        if let Some(anonymous) = section.get_bool("anonymous") {
            config.anonymous = anonymous;
        }
        *self.config.write() = config;
        Ok(())
    }

    async fn start(&self, _engine: EngineRef) -> RhilexResult<()> {
        let config = self.config.read().clone();
        let broker = Arc::new(Broker::new(config).with_events(Arc::new(|event: MqttEvent| {
            match event.action.as_str() {
                "connect" => info!("Mqtt Client Connected:({}), Addr:({})", event.clientid, event.ipaddress),
                "disconnect" => {
                    info!("Mqtt Client Disconnect:({}), Addr:({})", event.clientid, event.ipaddress)
                },
                _ => {},
            }
        })));
        let addr = broker.start().await?;
        info!("MqttServer start at [{}] successfully", addr);
        if let Some(old) = self.broker.lock().replace(broker) {
            old.stop();
        }
        Ok(())
    }

    fn service(&self, name: &str, args: &Value) -> RhilexResult<Value> {
        match name {
            "clients" => Ok(serde_json::to_value(self.broker()?.clients())?),
            "kickout" => self.kickout(args),
            "publish" => self.publish(args),
            other => Err(RhilexError::Unsupported(format!("mqtt server service: {}", other))),
        }
    }

    async fn stop(&self) {
        if let Some(broker) = self.broker.lock().take() {
            broker.stop();
        }
    }

    fn meta(&self) -> PluginMeta {
        PluginMeta {
            uuid: "RHILEX-MqttServer".to_string(),
            name: "MqttServer".to_string(),
            version: "v2.0.0".to_string(),
            description: "Simple Light Weight MqttServer".to_string(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use super::*;
    use crate::sources::await_connack;
    use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
    use std::time::Duration;

    async fn started() -> (MqttServerPlugin, u16) {
        let plugin = MqttServerPlugin::new();
        let mut section = IniSection::new("plugin.mqtt_server");
        section.insert("host", "127.0.0.1");
        section.insert("port", "0");
        plugin.init(&section).unwrap();
        plugin.start(EngineRef::detached()).await.unwrap();
        let port = plugin.broker().unwrap().local_addr().unwrap().port();
        (plugin, port)
    }

    #[tokio::test]
    async fn test_services() {
        let (plugin, port) = started().await;

        let mut options = MqttOptions::new("sensor-1", "127.0.0.1", port);
        options.set_keep_alive(Duration::from_secs(30));
        let (client, mut eventloop) = AsyncClient::new(options, 16);
        await_connack(&mut eventloop, "plugin").await.unwrap();
        client.subscribe("cmd/#", QoS::AtMostOnce).await.unwrap();
        loop {
            if let Event::Incoming(Packet::SubAck(_)) = eventloop.poll().await.unwrap() {
                break;
            }
        }

        let clients = plugin.service("clients", &Value::Null).unwrap();
        assert_eq!(clients[0]["id"], "sensor-1");
        assert_eq!(clients[0]["topics"], json!(["cmd/#"]));

        let args = json!(r#"{"topic":"cmd/reboot","msg":"now"}"#);
        assert_eq!(plugin.service("publish", &args).unwrap()["delivered"], 1);
        let publish = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Event::Incoming(Packet::Publish(p)) = eventloop.poll().await.unwrap() {
                    return p;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(publish.topic, "cmd/reboot");
        assert_eq!(&publish.payload[..], b"now");

        let kicked = plugin.service("kickout", &json!(["sensor-1", "ghost"])).unwrap();
        assert_eq!(kicked, json!(["sensor-1"]));
        assert!(plugin.service("clients", &Value::Null).unwrap().as_array().unwrap().is_empty());

        assert!(plugin.service("publish", &json!("not json")).is_err());
        assert!(plugin.service("reboot", &Value::Null).is_err());
        plugin.stop().await;
        assert!(plugin.service("clients", &Value::Null).is_err());
    }
}
