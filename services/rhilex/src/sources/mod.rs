//! Ingress resources (InEnds)
//!
//! Each source turns whatever arrives on its transport into a string and
//! queues it for the rules bound to it through
//! [`EngineHandle::work_in_end`](rhilex_core::EngineHandle::work_in_end).

mod http;
mod internal_event;
mod mqtt;
mod mqtt_server;
mod udp;

use tracing::warn;

use crate::engine::EngineRef;

pub use http::{HttpSource, HttpSourceConfig};
pub use internal_event::{InternalEventConfig, InternalEventSource};
pub(crate) use mqtt::{await_connack, qos_of};
pub use mqtt::{MqttSource, MqttSourceConfig};
pub use mqtt_server::MqttServerSource;
pub use udp::{UdpSource, UdpSourceConfig};

/// Queue `data` for the rules bound to `source_id`
pub(crate) fn forward(engine: &EngineRef, source_id: &str, data: &str) -> bool {
    match engine.get().and_then(|e| e.work_in_end(source_id, data)) {
        Ok(()) => true,
        Err(e) => {
            warn!("Source {} dropped input: {}", source_id, e);
            false
        },
    }
}
