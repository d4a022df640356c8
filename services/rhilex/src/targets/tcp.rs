//! `TCP_TRANSPORT`: one persistent connection
//!
//! A failed write or ping marks the target DOWN so the supervisor
//! reconnects it.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common::bind_config;
use errors::{RhilexError, RhilexResult};
use parking_lot::{Mutex, RwLock};
use rhilex_core::{ResourceState, RuntimeContext, StateCell, XStatus, XTarget};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::{encode_payload, TransportConfig};

const PING_INTERVAL: Duration = Duration::from_secs(5);

type SharedStream = Arc<tokio::sync::Mutex<Option<TcpStream>>>;

async fn write_all(stream: &SharedStream, bytes: &[u8], timeout: Duration) -> RhilexResult<()> {
    let mut guard = stream.lock().await;
    let conn = guard
        .as_mut()
        .ok_or_else(|| RhilexError::Communication("tcp target not connected".to_string()))?;
    match tokio::time::timeout(timeout, conn.write_all(bytes)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => {
            guard.take();
            Err(e.into())
        },
        Err(_) => {
            guard.take();
            Err(RhilexError::Timeout("tcp target write".to_string()))
        },
    }
}

pub struct TcpTarget {
    state: Arc<StateCell>,
    config: RwLock<TransportConfig>,
    stream: SharedStream,
    pinger: Mutex<Option<JoinHandle<()>>>,
}

impl TcpTarget {
    pub fn new(_runtime: RuntimeContext) -> Self {
        Self {
            state: Arc::new(StateCell::default()),
            config: RwLock::new(TransportConfig::default()),
            stream: Arc::new(tokio::sync::Mutex::new(None)),
            pinger: Mutex::new(None),
        }
    }

    fn timeout(&self) -> Duration {
        Duration::from_millis(self.config.read().timeout.max(1))
    }
}

#[async_trait]
impl XStatus for TcpTarget {
    async fn init(&self, _uuid: &str, config: &serde_json::Value) -> RhilexResult<()> {
        let config: TransportConfig = bind_config(config)?;
        config.validate()?;
        *self.config.write() = config;
        Ok(())
    }

    async fn start(&self, ctx: CancellationToken) -> RhilexResult<()> {
        let config = self.config.read().clone();
        let endpoint = config.endpoint();
        let conn = tokio::time::timeout(self.timeout(), TcpStream::connect(&endpoint))
            .await
            .map_err(|_| RhilexError::Timeout(endpoint.clone()))?
            .map_err(|e| RhilexError::ConnectionFailed {
                endpoint: endpoint.clone(),
                reason: e.to_string(),
            })?;
        *self.stream.lock().await = Some(conn);
        info!("TTcpTarget success connect to: {}", endpoint);

        if config.allow_ping {
            let stream = Arc::clone(&self.stream);
            let state = Arc::clone(&self.state);
            let timeout = self.timeout();
            let packet = config.ping_packet.into_bytes();
            let handle = tokio::spawn(async move {
                let mut ticker = tokio::time::interval(PING_INTERVAL);
                ticker.tick().await;
                loop {
                    tokio::select! {
                        _ = ctx.cancelled() => break,
                        _ = ticker.tick() => {},
                    }
                    if let Err(e) = write_all(&stream, &packet, timeout).await {
                        warn!("TTcpTarget Ping Error: {}", e);
                        state.set(ResourceState::Down);
                        break;
                    }
                }
            });
            if let Some(old) = self.pinger.lock().replace(handle) {
                old.abort();
            }
        }
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
        if let Some(handle) = self.pinger.lock().take() {
            handle.abort();
        }
        if let Some(mut conn) = self.stream.lock().await.take() {
            let _ = conn.shutdown().await;
        }
        self.state.set(ResourceState::Stop);
    }
}

#[async_trait]
impl XTarget for TcpTarget {
    async fn to(&self, data: serde_json::Value) -> RhilexResult<serde_json::Value> {
        let (mode, label) = {
            let config = self.config.read();
            (config.data_mode, config.ping_packet.clone())
        };
        let bytes = encode_payload(mode, &label, &data)?;
        if let Err(e) = write_all(&self.stream, &bytes, self.timeout()).await {
            self.state.set(ResourceState::Down);
            return Err(e);
        }
        Ok(serde_json::Value::Null)
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use super::*;
    use common::RhilexConfig;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_write_and_reconnect_state() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let target = TcpTarget::new(RuntimeContext::new(RhilexConfig::default()));
        target
            .init(
                "tcp-out",
                &serde_json::json!({ "host": "127.0.0.1", "port": port, "dataMode": "HEX_STRING" }),
            )
            .await
            .unwrap();
        target.start(CancellationToken::new()).await.unwrap();
        let (mut peer, _) = listener.accept().await.unwrap();

        target.to(serde_json::json!("a1b2")).await.unwrap();
        let mut buf = [0u8; 2];
        peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, [0xA1, 0xB2]);

        target.stop().await;
        assert!(target.to(serde_json::json!("00")).await.is_err());
        assert_eq!(target.status(), ResourceState::Down);
    }

    #[tokio::test]
    async fn test_unreachable_peer_fails_start() {
        let target = TcpTarget::new(RuntimeContext::new(RhilexConfig::default()));
        let port = {
            let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            l.local_addr().unwrap().port()
        };
        target
            .init("tcp-out", &serde_json::json!({ "host": "127.0.0.1", "port": port, "timeout": 500 }))
            .await
            .unwrap();
        assert!(target.start(CancellationToken::new()).await.is_err());
    }
}
