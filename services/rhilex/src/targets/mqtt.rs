//! `MQTT`: publish every payload to `pubTopic`

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common::bind_config;
use errors::{RhilexError, RhilexResult};
use parking_lot::{Mutex, RwLock};
use rhilex_core::{ResourceState, RuntimeContext, StateCell, XStatus, XTarget};
use rumqttc::{AsyncClient, MqttOptions};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::payload_text;
use crate::sources::{await_connack, qos_of};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MqttTargetConfig {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub username: String,
    pub password: String,
    pub pub_topic: String,
    pub qos: u8,
}

impl Default for MqttTargetConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 1883,
            client_id: format!("rhilex_mqtt_target_{}", common::time::now_secs() % 60),
            username: String::new(),
            password: String::new(),
            pub_topic: String::new(),
            qos: 1,
        }
    }
}

pub struct MqttTarget {
    state: Arc<StateCell>,
    config: RwLock<MqttTargetConfig>,
    client: Mutex<Option<AsyncClient>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl MqttTarget {
    pub fn new(_runtime: RuntimeContext) -> Self {
        Self {
            state: Arc::new(StateCell::default()),
            config: RwLock::new(MqttTargetConfig::default()),
            client: Mutex::new(None),
            task: Mutex::new(None),
        }
    }
}

#[async_trait]
impl XStatus for MqttTarget {
    async fn init(&self, _uuid: &str, config: &serde_json::Value) -> RhilexResult<()> {
        let config: MqttTargetConfig = bind_config(config)?;
        if config.host.is_empty() || config.pub_topic.is_empty() {
            return Err(RhilexError::Validation(
                "mqtt config error: host and pubTopic are required".to_string(),
            ));
        }
        *self.config.write() = config;
        Ok(())
    }

    async fn start(&self, ctx: CancellationToken) -> RhilexResult<()> {
        let config = self.config.read().clone();
        let endpoint = format!("{}:{}", config.host, config.port);
        let mut options = MqttOptions::new(&config.client_id, &config.host, config.port);
        if !config.username.is_empty() {
            options.set_credentials(&config.username, &config.password);
        }
        options.set_keep_alive(Duration::from_secs(60));

        let (client, mut eventloop) = AsyncClient::new(options, 64);
        await_connack(&mut eventloop, &endpoint).await?;
        info!("Mqtt target connected to {}", endpoint);

        let state = Arc::clone(&self.state);
        let handle = tokio::spawn(async move {
            loop {
                let polled = tokio::select! {
                    _ = ctx.cancelled() => break,
                    p = eventloop.poll() => p,
                };
                if let Err(e) = polled {
                    warn!("Mqtt target connection lost: {}", e);
                    state.set(ResourceState::Down);
                    break;
                }
            }
        });
        if let Some(old) = self.task.lock().replace(handle) {
            old.abort();
        }
        *self.client.lock() = Some(client);
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
        if let Some(client) = self.client.lock().take() {
            let _ = client.try_disconnect();
        }
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
        self.state.set(ResourceState::Stop);
    }
}

#[async_trait]
impl XTarget for MqttTarget {
    async fn to(&self, data: serde_json::Value) -> RhilexResult<serde_json::Value> {
        let client = self
            .client
            .lock()
            .clone()
            .ok_or_else(|| RhilexError::ResourceDown("mqtt target".to_string()))?;
        let (topic, qos) = {
            let config = self.config.read();
            (config.pub_topic.clone(), qos_of(config.qos))
        };
        debug!("Target publish: {}", topic);
        client
            .publish(topic, qos, false, payload_text(&data).into_bytes())
            .await
            .map_err(|e| RhilexError::Mqtt(e.to_string()))?;
        Ok(serde_json::Value::Null)
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use super::*;
    use crate::broker::{Broker, BrokerConfig};
    use common::RhilexConfig;

    #[tokio::test]
    async fn test_publish_through_embedded_broker() {
        let broker = Arc::new(Broker::new(BrokerConfig {
            port: 0,
            ..BrokerConfig::default()
        }));
        let addr = broker.start().await.unwrap();

        let target = MqttTarget::new(RuntimeContext::new(RhilexConfig::default()));
        target
            .init(
                "mqtt-out",
                &serde_json::json!({
                    "host": "127.0.0.1",
                    "port": addr.port(),
                    "clientId": "target-test",
                    "pubTopic": "rhilex/out",
                }),
            )
            .await
            .unwrap();
        target.start(CancellationToken::new()).await.unwrap();
        assert_eq!(target.status(), ResourceState::Up);
        assert!(target.to(serde_json::json!("hello")).await.is_ok());
        assert_eq!(broker.clients().len(), 1);

        target.stop().await;
        assert!(target.to(serde_json::json!("again")).await.is_err());
        broker.stop();
    }
}
