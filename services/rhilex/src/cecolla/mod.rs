//! Cloud platform adapters (cecollas)
//!
//! - [`IthingsCecolla`]: iThings IoT hub, device or gateway mode
//! - [`TencentCecolla`]: Tencent IoT Explorer hub
//!
//! Both keep one MQTT session to the platform. Downlink property/action
//! messages go to the device bound through `cecollaConfig` and to the
//! cecolla's action applet, if it has one.

mod auth;
mod ithings;
mod tencent;

use std::sync::Arc;
use std::time::Duration;

use errors::{RhilexError, RhilexResult};
use rhilex_core::binding;
use rhilex_core::{AppletDef, EngineHandle, ResourceKind, ResourceState, RuntimeContext, StateCell};
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use serde_json::json;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::engine::EngineRef;
use crate::sources::await_connack;

pub use auth::{AuthInfo, SignMethod};
pub use ithings::{IthingsCecolla, IthingsConfig};
pub use tencent::{TencentCecolla, TencentConfig};

pub(crate) const MODE_DEVICE: &str = "DEVICE";
pub(crate) const MODE_GATEWAY: &str = "GATEWAY";

/// Cloud schema type of a point `dataType`
pub fn point_value_type(data_type: &str) -> &'static str {
    match data_type.to_ascii_uppercase().as_str() {
        "BOOL" => "bool",
        "INT" | "UINT" | "INT16" | "UINT16" | "INT32" | "UINT32" | "SHORT" | "USHORT" | "LONG"
        | "ULONG" | "BYTE" => "int",
        "FLOAT" | "FLOAT32" => "float",
        _ => "NULL",
    }
}

/// Fresh `msgToken` / `clientToken`
pub(crate) fn message_token() -> String {
    uuid::Uuid::new_v4().to_string()
}

pub(crate) fn check_mode(mode: &str) -> RhilexResult<()> {
    if mode == MODE_DEVICE || mode == MODE_GATEWAY {
        Ok(())
    } else {
        Err(RhilexError::InvalidConfig {
            field: "mode".to_string(),
            reason: format!("unsupported mode '{}', only DEVICE or GATEWAY", mode),
        })
    }
}

/// Split `tcp://host:port` into host and port
pub(crate) fn parse_endpoint(endpoint: &str) -> RhilexResult<(String, u16)> {
    let rest = endpoint
        .strip_prefix("tcp://")
        .or_else(|| endpoint.strip_prefix("mqtt://"))
        .unwrap_or(endpoint);
    let invalid = || RhilexError::InvalidConfig {
        field: "serverEndpoint".to_string(),
        reason: format!("invalid endpoint: {}", endpoint),
    };
    match rest.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() => {
            let port = port.parse().map_err(|_| invalid())?;
            Ok((host.to_string(), port))
        },
        None if !rest.is_empty() => Ok((rest.to_string(), 1883)),
        _ => Err(invalid()),
    }
}

/// `$thing/down/<kind>/<product>/<device>` -> (product, device)
pub(crate) fn topic_owner(topic: &str) -> Option<(&str, &str)> {
    let fields: Vec<&str> = topic.split('/').collect();
    match fields.as_slice() {
        [_, _, _, product, device] => Some((product, device)),
        _ => None,
    }
}

/// MQTT session shared by the adapters
pub(crate) struct CloudLink {
    client: AsyncClient,
    task: JoinHandle<()>,
}

impl CloudLink {
    /// Connect and spawn the event loop; `on_message` sees every inbound
    /// PUBLISH. A lost session marks `state` DOWN.
    pub(crate) async fn connect<F>(
        endpoint: &str,
        auth: &AuthInfo,
        ctx: CancellationToken,
        state: Arc<StateCell>,
        on_message: F,
    ) -> RhilexResult<Self>
    where
        F: Fn(&str, &[u8]) + Send + 'static,
    {
        let (host, port) = parse_endpoint(endpoint)?;
        let mut options = MqttOptions::new(&auth.client_id, &host, port);
        options.set_credentials(&auth.username, &auth.password);
        options.set_keep_alive(Duration::from_secs(60));
        options.set_clean_session(true);

        let (client, mut eventloop) = AsyncClient::new(options, 64);
        await_connack(&mut eventloop, endpoint).await?;
        info!("Cloud connected: {} as {}", endpoint, auth.client_id);

        let task = tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = ctx.cancelled() => break,
                    e = eventloop.poll() => e,
                };
                match event {
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        on_message(&publish.topic, &publish.payload);
                    },
                    Ok(_) => {},
                    Err(e) => {
                        warn!("Cloud disconnect: {}", e);
                        state.set(ResourceState::Down);
                        break;
                    },
                }
            }
        });
        Ok(Self { client, task })
    }

    pub(crate) async fn subscribe(&self, topic: &str) -> RhilexResult<()> {
        self.client
            .subscribe(topic, QoS::AtLeastOnce)
            .await
            .map_err(|e| RhilexError::Mqtt(e.to_string()))
    }

    pub(crate) async fn publish(&self, topic: &str, payload: String) -> RhilexResult<()> {
        debug!("Cloud publish: {} {}", topic, payload);
        self.client
            .publish(topic, QoS::AtLeastOnce, false, payload.into_bytes())
            .await
            .map_err(|e| RhilexError::Mqtt(e.to_string()))
    }

    pub(crate) fn close(&self) {
        let _ = self.client.try_disconnect();
        self.task.abort();
    }
}

/// Register the cecolla's action script as an applet under its own id;
/// false when there is none
pub(crate) fn load_action(engine: &EngineRef, cecolla_id: &str) -> RhilexResult<bool> {
    let Ok(engine) = engine.get() else {
        return Ok(false);
    };
    let Some(def) = engine.resource_def(ResourceKind::Cecolla, cecolla_id) else {
        return Ok(false);
    };
    match def.action {
        Some(script) if !script.trim().is_empty() => {
            engine.load_applet(AppletDef {
                uuid: cecolla_id.to_string(),
                name: format!("Action: {}", cecolla_id),
                version: "v1.0.0".to_string(),
                auto_start: false,
                script,
                description: String::new(),
            })?;
            Ok(true)
        },
        _ => Ok(false),
    }
}

pub(crate) fn unload_action(engine: &EngineRef, cecolla_id: &str) {
    if let Ok(engine) = engine.get() {
        let _ = engine.stop_applet(cecolla_id);
        let _ = engine.remove_applet(cecolla_id);
    }
}

/// Hand a downlink message to the bound device and, when `run_action`,
/// to the action applet
pub(crate) fn dispatch_downlink(
    runtime: &RuntimeContext,
    engine: &EngineRef,
    cecolla_id: &str,
    run_action: bool,
    topic: &str,
    payload: &[u8],
) {
    let text = String::from_utf8_lossy(payload);
    let engine = match engine.get() {
        Ok(e) => e,
        Err(e) => {
            warn!("Cecolla {} dropped downlink: {}", cecolla_id, e);
            return;
        },
    };
    if let Some(device_id) = binding::bound_device(&runtime.cache, cecolla_id) {
        if let Err(e) = engine.work_device(&device_id, &text) {
            warn!("Cecolla {} forward to {} failed: {}", cecolla_id, device_id, e);
        }
    }
    if run_action {
        let (product, device) = topic_owner(topic).unwrap_or_default();
        let env = json!({ "Product": product, "Device": device, "Payload": text });
        start_action(engine.as_ref(), cecolla_id, env);
    }
}

/// Run the action applet for one downlink; returns whether it started
///
/// Applets run one `Main` at a time, so a downlink that lands while the
/// previous action is still running is skipped.
pub(crate) fn start_action(engine: &dyn EngineHandle, cecolla_id: &str, env: serde_json::Value) -> bool {
    match engine.start_applet(cecolla_id, env) {
        Ok(()) => true,
        Err(RhilexError::AlreadyRunning(_)) => {
            warn!(
                "Cecolla {} action still running, downlink action skipped",
                cecolla_id
            );
            false
        },
        Err(RhilexError::NotFound { .. }) => {
            debug!("Cecolla {} has no action applet", cecolla_id);
            false
        },
        Err(e) => {
            warn!("Cecolla {} action failed: {}", cecolla_id, e);
            false
        },
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_point_value_type() {
        assert_eq!(point_value_type("BOOL"), "bool");
        for t in ["INT", "UINT", "INT16", "UINT16", "INT32", "UINT32", "SHORT", "USHORT", "LONG", "ULONG", "BYTE"] {
            assert_eq!(point_value_type(t), "int", "{}", t);
        }
        assert_eq!(point_value_type("FLOAT"), "float");
        assert_eq!(point_value_type("float32"), "float");
        assert_eq!(point_value_type("FLOAT64"), "NULL");
        assert_eq!(point_value_type("STRING"), "NULL");
    }

    #[test]
    fn test_tokens_are_unique() {
        let tokens: HashSet<String> = (0..1000).map(|_| message_token()).collect();
        assert_eq!(tokens.len(), 1000);
    }

    #[test]
    fn test_parse_endpoint() {
        assert_eq!(parse_endpoint("tcp://127.0.0.1:1883").unwrap(), ("127.0.0.1".to_string(), 1883));
        assert_eq!(parse_endpoint("hub.example.com").unwrap(), ("hub.example.com".to_string(), 1883));
        assert!(parse_endpoint("tcp://:1883").is_err());
        assert!(parse_endpoint("tcp://host:port").is_err());
    }

    #[test]
    fn test_topic_owner() {
        assert_eq!(topic_owner("$thing/down/action/P1/D1"), Some(("P1", "D1")));
        assert_eq!(topic_owner("a/b"), None);
    }

    #[tracing_test::traced_test]
    #[tokio::test(flavor = "multi_thread")]
    async fn test_overlapping_action_is_skipped_and_logged() {
        let runtime = RuntimeContext::new(common::RhilexConfig::default());
        let engine = crate::RuleEngine::new(runtime, Arc::new(crate::MemoryStore::new()));
        assert!(!start_action(engine.as_ref(), "cec1", json!({})));

        engine
            .load_applet(AppletDef {
                uuid: "cec1".to_string(),
                name: "action".to_string(),
                version: "v1.0.0".to_string(),
                auto_start: false,
                script: "function Main(uuid, env) while true do end end".to_string(),
                description: String::new(),
            })
            .unwrap();
        assert!(start_action(engine.as_ref(), "cec1", json!({ "Payload": "1" })));
        assert!(!start_action(engine.as_ref(), "cec1", json!({ "Payload": "2" })));
        assert!(logs_contain("Cecolla cec1 action still running, downlink action skipped"));

        engine.stop_applet("cec1").unwrap();
        engine.stop().await;
    }

    #[test]
    fn test_mode() {
        assert!(check_mode("DEVICE").is_ok());
        assert!(check_mode("GATEWAY").is_ok());
        assert!(check_mode("BRIDGE").is_err());
    }
}
