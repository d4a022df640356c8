//! `GENERIC_MQTT_SERVER`: the embedded broker as an ingress
//!
//! Client activity is queued as [`MqttEvent`] JSON.

use std::sync::Arc;

use async_trait::async_trait;
use common::bind_config;
use errors::{RhilexError, RhilexResult};
use parking_lot::RwLock;
use rhilex_core::{ResourceState, RuntimeContext, StateCell, XSource, XStatus};
use tokio_util::sync::CancellationToken;

use crate::broker::{Broker, BrokerConfig, MqttEvent};
use crate::engine::EngineRef;

pub struct MqttServerSource {
    engine: EngineRef,
    state: StateCell,
    source_id: RwLock<String>,
    config: RwLock<BrokerConfig>,
    broker: RwLock<Option<Arc<Broker>>>,
}

impl MqttServerSource {
    pub fn new(_runtime: RuntimeContext, engine: EngineRef) -> Self {
        Self {
            engine,
            state: StateCell::default(),
            source_id: RwLock::new(String::new()),
            config: RwLock::new(BrokerConfig::default()),
            broker: RwLock::new(None),
        }
    }

    pub fn broker(&self) -> Option<Arc<Broker>> {
        self.broker.read().clone()
    }
}

#[async_trait]
impl XStatus for MqttServerSource {
    async fn init(&self, uuid: &str, config: &serde_json::Value) -> RhilexResult<()> {
        let config: BrokerConfig = bind_config(config)?;
        if config.host.is_empty() {
            return Err(RhilexError::InvalidConfig {
                field: "host".to_string(),
                reason: "listen host is required".to_string(),
            });
        }
        *self.source_id.write() = uuid.to_string();
        *self.config.write() = config;
        Ok(())
    }

    async fn start(&self, ctx: CancellationToken) -> RhilexResult<()> {
        let source_id = self.source_id.read().clone();
        let engine = self.engine.clone();
        let hook_id = source_id.clone();
        let broker = Arc::new(
            Broker::new(self.config.read().clone()).with_events(Arc::new(move |event: MqttEvent| {
                super::forward(&engine, &hook_id, &event.to_json());
            })),
        );
        broker.start().await?;

        // the supervisor token outlives a single start; tie the broker to it
        let watched = Arc::clone(&broker);
        tokio::spawn(async move {
            ctx.cancelled().await;
            watched.stop();
        });

        if let Some(old) = self.broker.write().replace(broker) {
            old.stop();
        }
        self.state.set(ResourceState::Up);
        Ok(())
    }

    fn status(&self) -> ResourceState {
        match self.broker.read().as_ref() {
            Some(b) if b.is_running() => self.state.get(),
            Some(_) => ResourceState::Down,
            None => self.state.get(),
        }
    }

    fn set_state(&self, state: ResourceState) {
        self.state.set(state);
    }

    async fn stop(&self) {
        if let Some(broker) = self.broker.write().take() {
            broker.stop();
        }
        self.state.set(ResourceState::Stop);
    }
}

#[async_trait]
impl XSource for MqttServerSource {
    /// Publish `data` as `{"topic":..,"payload":..}` to subscribed clients
    async fn down_stream(&self, data: &[u8]) -> RhilexResult<usize> {
        #[derive(serde::Deserialize)]
        struct Down {
            topic: String,
            payload: String,
        }
        let broker = self
            .broker()
            .ok_or_else(|| RhilexError::ResourceDown(self.source_id.read().clone()))?;
        let down: Down = serde_json::from_slice(data)?;
        Ok(broker.publish(&down.topic, down.payload.into_bytes()))
    }
}
