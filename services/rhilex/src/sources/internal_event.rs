//! `INTERNAL_EVENT`: forward gateway events into rules
//!
//! Subscribes to the event bus and queues `{"type","event","ts","info"}`.

use async_trait::async_trait;
use common::bind_config;
use errors::{RhilexError, RhilexResult};
use parking_lot::{Mutex, RwLock};
use rhilex_bus::EventMessage;
use rhilex_core::{ResourceState, RuntimeContext, StateCell, XSource, XStatus};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::engine::EngineRef;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InternalEventConfig {
    /// `ALL`, `SOURCE`, `DEVICE`, `TARGET`, `CECOLLA`, `TRANSCEIVER` or `SYSTEM`
    #[serde(rename = "type")]
    pub kind: String,
}

impl Default for InternalEventConfig {
    fn default() -> Self {
        Self {
            kind: "ALL".to_string(),
        }
    }
}

impl InternalEventConfig {
    /// Bus patterns covering the selected event family
    pub fn patterns(&self) -> RhilexResult<Vec<&'static str>> {
        let patterns = match self.kind.as_str() {
            "ALL" => vec![
                "event.source.down.*",
                "event.device.down.*",
                "event.target.down.*",
                "event.cecolla.down.*",
                "event.multimedia.down.*",
                "transceiver.up.data.*",
                "system.usb.event.*",
            ],
            "SOURCE" => vec!["event.source.down.*"],
            "DEVICE" => vec!["event.device.down.*"],
            "TARGET" => vec!["event.target.down.*"],
            "CECOLLA" => vec!["event.cecolla.down.*"],
            "TRANSCEIVER" => vec!["transceiver.up.data.*"],
            "SYSTEM" => vec!["system.usb.event.*"],
            other => {
                return Err(RhilexError::InvalidConfig {
                    field: "type".to_string(),
                    reason: format!("unknown event type: {}", other),
                })
            },
        };
        Ok(patterns)
    }
}

#[derive(Serialize)]
struct ForwardedEvent<'a> {
    #[serde(rename = "type")]
    kind: &'a str,
    event: &'a str,
    ts: u64,
    info: &'a serde_json::Value,
}

pub struct InternalEventSource {
    runtime: RuntimeContext,
    engine: EngineRef,
    state: StateCell,
    source_id: RwLock<String>,
    config: RwLock<InternalEventConfig>,
    subscriptions: Mutex<Vec<String>>,
}

impl InternalEventSource {
    pub fn new(runtime: RuntimeContext, engine: EngineRef) -> Self {
        Self {
            runtime,
            engine,
            state: StateCell::default(),
            source_id: RwLock::new(String::new()),
            config: RwLock::new(InternalEventConfig::default()),
            subscriptions: Mutex::new(Vec::new()),
        }
    }

    fn unsubscribe_all(&self) {
        for id in self.subscriptions.lock().drain(..) {
            self.runtime.bus.unsubscribe(&id);
        }
    }
}

#[async_trait]
impl XStatus for InternalEventSource {
    async fn init(&self, uuid: &str, config: &serde_json::Value) -> RhilexResult<()> {
        let config: InternalEventConfig = bind_config(config)?;
        config.patterns()?;
        *self.source_id.write() = uuid.to_string();
        *self.config.write() = config;
        Ok(())
    }

    async fn start(&self, _ctx: CancellationToken) -> RhilexResult<()> {
        self.unsubscribe_all();
        let patterns = self.config.read().patterns()?;
        let source_id = self.source_id.read().clone();

        let mut ids = Vec::with_capacity(patterns.len());
        for pattern in patterns {
            let engine = self.engine.clone();
            let source_id = source_id.clone();
            let id = self.runtime.bus.subscribe(pattern, move |msg: EventMessage| {
                let engine = engine.clone();
                let source_id = source_id.clone();
                async move {
                    let forwarded = ForwardedEvent {
                        kind: &msg.kind,
                        event: &msg.event,
                        ts: msg.ts,
                        info: &msg.payload,
                    };
                    match serde_json::to_string(&forwarded) {
                        Ok(data) => {
                            super::forward(&engine, &source_id, &data);
                        },
                        Err(e) => debug!("Encode internal event failed: {}", e),
                    }
                }
            });
            ids.push(id);
        }
        *self.subscriptions.lock() = ids;
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
        self.unsubscribe_all();
        self.state.set(ResourceState::Stop);
    }
}

#[async_trait]
impl XSource for InternalEventSource {}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use super::*;
    use common::RhilexConfig;

    #[test]
    fn test_patterns_by_type() {
        assert_eq!(InternalEventConfig::default().patterns().unwrap().len(), 7);
        let device = InternalEventConfig {
            kind: "DEVICE".into(),
        };
        assert_eq!(device.patterns().unwrap(), vec!["event.device.down.*"]);
        let bad = InternalEventConfig { kind: "NOPE".into() };
        assert!(bad.patterns().is_err());
    }

    #[tokio::test]
    async fn test_stop_releases_subscriptions() {
        let runtime = RuntimeContext::new(RhilexConfig::default());
        let source = InternalEventSource::new(runtime.clone(), EngineRef::detached());
        source
            .init("ev1", &serde_json::json!({ "type": "SOURCE" }))
            .await
            .unwrap();
        source.start(CancellationToken::new()).await.unwrap();
        assert_eq!(runtime.bus.subscriber_count(), 1);

        source.stop().await;
        assert_eq!(runtime.bus.subscriber_count(), 0);
        source.stop().await;
    }
}
