//! `GENERIC_MQTT`: subscribe to an external broker
//!
//! Each message is queued as `{"topic":"..","payload":".."}`. A lost
//! connection marks the source DOWN and the supervisor reconnects it.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common::bind_config;
use errors::{RhilexError, RhilexResult};
use parking_lot::{Mutex, RwLock};
use rhilex_core::{ResourceState, RuntimeContext, StateCell, XSource, XStatus};
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::engine::EngineRef;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MqttSourceConfig {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub username: String,
    pub password: String,
    pub qos: u8,
    pub sub_topics: Vec<String>,
}

impl Default for MqttSourceConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 1883,
            client_id: format!("rhilex_mqtt_source_{}", common::time::now_secs() % 60),
            username: String::new(),
            password: String::new(),
            qos: 0,
            sub_topics: Vec::new(),
        }
    }
}

impl MqttSourceConfig {
    pub fn validate(&self) -> RhilexResult<()> {
        let fail = |reason: &str| Err(RhilexError::Validation(format!("mqtt config error: {}", reason)));
        if self.host.is_empty() {
            return fail("host cannot be empty");
        }
        if self.port == 0 {
            return fail("port must be a valid number between 1 and 65535");
        }
        if self.client_id.is_empty() {
            return fail("client ID cannot be empty");
        }
        if self.qos > 2 {
            return fail("QoS must be 0, 1, or 2");
        }
        if self.sub_topics.is_empty() {
            return fail("at least one subscription topic is required");
        }
        if self.sub_topics.iter().any(String::is_empty) {
            return fail("subscription topics cannot be empty");
        }
        Ok(())
    }
}

pub(crate) fn qos_of(level: u8) -> QoS {
    match level {
        1 => QoS::AtLeastOnce,
        2 => QoS::ExactlyOnce,
        _ => QoS::AtMostOnce,
    }
}

#[derive(Serialize)]
struct MqttMessage<'a> {
    topic: &'a str,
    payload: String,
}

/// Drive the event loop until the first CONNACK
pub(crate) async fn await_connack(eventloop: &mut EventLoop, endpoint: &str) -> RhilexResult<()> {
    let wait = async {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => return Ok(()),
                Ok(_) => {},
                Err(e) => {
                    return Err(RhilexError::ConnectionFailed {
                        endpoint: endpoint.to_string(),
                        reason: e.to_string(),
                    })
                },
            }
        }
    };
    tokio::time::timeout(CONNECT_TIMEOUT, wait)
        .await
        .map_err(|_| RhilexError::Timeout(endpoint.to_string()))?
}

pub struct MqttSource {
    engine: EngineRef,
    state: Arc<StateCell>,
    source_id: RwLock<String>,
    config: RwLock<MqttSourceConfig>,
    client: Mutex<Option<AsyncClient>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl MqttSource {
    pub fn new(_runtime: RuntimeContext, engine: EngineRef) -> Self {
        Self {
            engine,
            state: Arc::new(StateCell::default()),
            source_id: RwLock::new(String::new()),
            config: RwLock::new(MqttSourceConfig::default()),
            client: Mutex::new(None),
            task: Mutex::new(None),
        }
    }
}

#[async_trait]
impl XStatus for MqttSource {
    async fn init(&self, uuid: &str, config: &serde_json::Value) -> RhilexResult<()> {
        let config: MqttSourceConfig = bind_config(config)?;
        config.validate()?;
        *self.source_id.write() = uuid.to_string();
        *self.config.write() = config;
        Ok(())
    }

    async fn start(&self, ctx: CancellationToken) -> RhilexResult<()> {
        let config = self.config.read().clone();
        let source_id = self.source_id.read().clone();
        let endpoint = format!("{}:{}", config.host, config.port);

        let mut options = MqttOptions::new(&config.client_id, &config.host, config.port);
        if !config.username.is_empty() {
            options.set_credentials(&config.username, &config.password);
        }
        options.set_keep_alive(Duration::from_secs(60));
        options.set_clean_session(true);

        let (client, mut eventloop) = AsyncClient::new(options, 64);
        await_connack(&mut eventloop, &endpoint).await?;
        info!(
            "GenericMqtt Connected. inEndId={} host={} port={} clientId={}",
            source_id, config.host, config.port, config.client_id
        );
        for topic in &config.sub_topics {
            client
                .subscribe(topic.as_str(), qos_of(config.qos))
                .await
                .map_err(|e| RhilexError::Mqtt(e.to_string()))?;
        }

        let engine = self.engine.clone();
        let state = Arc::clone(&self.state);
        let handle = tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = ctx.cancelled() => break,
                    e = eventloop.poll() => e,
                };
                match event {
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        let message = MqttMessage {
                            topic: &publish.topic,
                            payload: String::from_utf8_lossy(&publish.payload).into_owned(),
                        };
                        match serde_json::to_string(&message) {
                            Ok(data) => {
                                super::forward(&engine, &source_id, &data);
                            },
                            Err(e) => warn!("handle message failed: {}", e),
                        }
                    },
                    Ok(_) => {},
                    Err(e) => {
                        warn!("GenericMqtt Disconnect. err={}", e);
                        state.set(ResourceState::Down);
                        break;
                    },
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
        let client = self.client.lock().take();
        if let Some(client) = client {
            let _ = client.try_disconnect();
        }
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
        self.state.set(ResourceState::Stop);
    }
}

#[async_trait]
impl XSource for MqttSource {}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use super::*;

    #[test]
    fn test_config_validation() {
        let mut config = MqttSourceConfig {
            host: "127.0.0.1".into(),
            sub_topics: vec!["a/b".into()],
            ..MqttSourceConfig::default()
        };
        assert!(config.validate().is_ok());

        config.qos = 3;
        assert!(config.validate().is_err());
        config.qos = 1;
        config.sub_topics.clear();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("at least one subscription topic"));
    }

    #[test]
    fn test_qos_mapping() {
        assert_eq!(qos_of(0), QoS::AtMostOnce);
        assert_eq!(qos_of(2), QoS::ExactlyOnce);
        assert_eq!(qos_of(9), QoS::AtMostOnce);
    }
}
