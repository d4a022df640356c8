//! `RHILEX_UDP`: datagram ingress
//!
//! Every datagram is queued as `{"clientAddr":"ip:port","data":".."}`, with
//! non-UTF-8 payloads hex encoded, and acknowledged with `ok`.

use std::sync::Arc;

use async_trait::async_trait;
use common::bind_config;
use errors::RhilexResult;
use parking_lot::{Mutex, RwLock};
use rhilex_core::{ResourceState, RuntimeContext, StateCell, XSource, XStatus};
use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::engine::EngineRef;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UdpSourceConfig {
    pub host: String,
    pub port: u16,
    pub max_data_length: usize,
}

impl Default for UdpSourceConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 6200,
            max_data_length: 1024,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct UdpClientData {
    client_addr: String,
    data: String,
}

fn encode_datagram(data: &[u8]) -> String {
    match std::str::from_utf8(data) {
        Ok(text) => text.to_string(),
        Err(_) => hex::encode(data),
    }
}

pub struct UdpSource {
    engine: EngineRef,
    state: StateCell,
    source_id: RwLock<String>,
    config: RwLock<UdpSourceConfig>,
    socket: RwLock<Option<Arc<UdpSocket>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl UdpSource {
    pub fn new(_runtime: RuntimeContext, engine: EngineRef) -> Self {
        Self {
            engine,
            state: StateCell::default(),
            source_id: RwLock::new(String::new()),
            config: RwLock::new(UdpSourceConfig::default()),
            socket: RwLock::new(None),
            task: Mutex::new(None),
        }
    }

    pub fn local_addr(&self) -> Option<std::net::SocketAddr> {
        self.socket.read().as_ref().and_then(|s| s.local_addr().ok())
    }
}

#[async_trait]
impl XStatus for UdpSource {
    async fn init(&self, uuid: &str, config: &serde_json::Value) -> RhilexResult<()> {
        let mut config: UdpSourceConfig = bind_config(config)?;
        config.max_data_length = config.max_data_length.max(1);
        *self.source_id.write() = uuid.to_string();
        *self.config.write() = config;
        Ok(())
    }

    async fn start(&self, ctx: CancellationToken) -> RhilexResult<()> {
        let config = self.config.read().clone();
        let socket = Arc::new(UdpSocket::bind((config.host.as_str(), config.port)).await?);
        info!("UDP source started on [{}]:{}", config.host, config.port);

        let source_id = self.source_id.read().clone();
        let engine = self.engine.clone();
        let reader = Arc::clone(&socket);
        let handle = tokio::spawn(async move {
            let mut buffer = vec![0u8; config.max_data_length];
            loop {
                let received = tokio::select! {
                    _ = ctx.cancelled() => break,
                    r = reader.recv_from(&mut buffer) => r,
                };
                let (n, peer) = match received {
                    Ok(r) => r,
                    Err(e) => {
                        warn!("UDP source {} receive failed: {}", source_id, e);
                        continue;
                    },
                };
                debug!("UDP Server Received: {:?}", &buffer[..n]);
                let payload = UdpClientData {
                    client_addr: peer.to_string(),
                    data: encode_datagram(&buffer[..n]),
                };
                if let Ok(data) = serde_json::to_string(&payload) {
                    super::forward(&engine, &source_id, &data);
                }
                if let Err(e) = reader.send_to(b"ok", peer).await {
                    debug!("UDP ack to {} failed: {}", peer, e);
                }
            }
        });

        if let Some(old) = self.task.lock().replace(handle) {
            old.abort();
        }
        *self.socket.write() = Some(socket);
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
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
        self.socket.write().take();
        self.state.set(ResourceState::Stop);
    }
}

#[async_trait]
impl XSource for UdpSource {}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use super::*;
    use common::RhilexConfig;

    #[test]
    fn test_binary_datagrams_are_hex_encoded() {
        assert_eq!(encode_datagram(b"hello"), "hello");
        assert_eq!(encode_datagram(&[0xFF, 0x00, 0x10]), "ff0010");
    }

    #[tokio::test]
    async fn test_datagram_is_acknowledged() {
        let source = UdpSource::new(RuntimeContext::new(RhilexConfig::default()), EngineRef::detached());
        source
            .init("udp1", &serde_json::json!({ "host": "127.0.0.1", "port": 0 }))
            .await
            .unwrap();
        source.start(CancellationToken::new()).await.unwrap();
        let addr = source.local_addr().unwrap();

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.send_to(b"ping", addr).await.unwrap();
        let mut buf = [0u8; 8];
        let (n, _) = tokio::time::timeout(std::time::Duration::from_secs(2), client.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..n], b"ok");

        source.stop().await;
        assert_eq!(source.status(), ResourceState::Stop);
    }
}
