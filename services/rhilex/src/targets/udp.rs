//! `UDP_TARGET`

use async_trait::async_trait;
use common::bind_config;
use errors::RhilexResult;
use parking_lot::RwLock;
use rhilex_core::{ResourceState, RuntimeContext, StateCell, XStatus, XTarget};
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{encode_payload, TransportConfig};

pub struct UdpTarget {
    state: StateCell,
    config: RwLock<TransportConfig>,
}

impl UdpTarget {
    pub fn new(_runtime: RuntimeContext) -> Self {
        Self {
            state: StateCell::default(),
            config: RwLock::new(TransportConfig::default()),
        }
    }
}

#[async_trait]
impl XStatus for UdpTarget {
    async fn init(&self, _uuid: &str, config: &serde_json::Value) -> RhilexResult<()> {
        let config: TransportConfig = bind_config(config)?;
        config.validate()?;
        *self.config.write() = config;
        Ok(())
    }

    async fn start(&self, _ctx: CancellationToken) -> RhilexResult<()> {
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
        self.state.set(ResourceState::Stop);
    }
}

#[async_trait]
impl XTarget for UdpTarget {
    /// One datagram per call, sent from an ephemeral port
    async fn to(&self, data: serde_json::Value) -> RhilexResult<serde_json::Value> {
        let config = self.config.read().clone();
        let bytes = encode_payload(config.data_mode, &config.ping_packet, &data)?;
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        let sent = socket.send_to(&bytes, config.endpoint()).await?;
        debug!("UDP target sent {} bytes to {}", sent, config.endpoint());
        Ok(serde_json::Value::Null)
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use super::*;
    use common::RhilexConfig;

    #[tokio::test]
    async fn test_datagram_reaches_peer() {
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = peer.local_addr().unwrap().port();

        let target = UdpTarget::new(RuntimeContext::new(RhilexConfig::default()));
        target
            .init("udp-out", &serde_json::json!({ "host": "127.0.0.1", "port": port }))
            .await
            .unwrap();
        target.start(CancellationToken::new()).await.unwrap();
        target.to(serde_json::json!("hello")).await.unwrap();

        let mut buf = [0u8; 16];
        let (n, _) = peer.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hello");
    }
}
