//! `HTTP`: POST every payload to a URL
//!
//! Body is `{"label":<pingPacket>,"body":<payload>}`.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common::bind_config;
use errors::{RhilexError, RhilexResult};
use parking_lot::{Mutex, RwLock};
use rhilex_core::{ResourceState, RuntimeContext, StateCell, XStatus, XTarget};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::payload_text;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HttpTargetConfig {
    pub url: String,
    pub headers: BTreeMap<String, String>,
    /// Periodically POST `pingPacket` and go DOWN when it fails
    pub allow_ping: bool,
    pub ping_packet: String,
    /// Milliseconds; request timeout and ping period
    pub timeout: u64,
}

impl Default for HttpTargetConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            headers: BTreeMap::new(),
            allow_ping: false,
            ping_packet: "rhilex".to_string(),
            timeout: 3000,
        }
    }
}

async fn post(
    client: &reqwest::Client,
    config: &HttpTargetConfig,
    body: String,
) -> RhilexResult<String> {
    let mut request = client
        .post(&config.url)
        .timeout(Duration::from_millis(config.timeout.max(1)))
        .header("Content-Type", "application/json")
        .body(body);
    for (key, value) in &config.headers {
        request = request.header(key.as_str(), value.as_str());
    }
    let response = request.send().await?;
    let status = response.status();
    let text = response.text().await?;
    if status.is_success() {
        Ok(text)
    } else {
        Err(RhilexError::Communication(format!(
            "POST {} returned {}: {}",
            config.url, status, text
        )))
    }
}

pub struct HttpTarget {
    state: Arc<StateCell>,
    config: RwLock<HttpTargetConfig>,
    client: reqwest::Client,
    pinger: Mutex<Option<JoinHandle<()>>>,
}

impl HttpTarget {
    pub fn new(_runtime: RuntimeContext) -> Self {
        Self {
            state: Arc::new(StateCell::default()),
            config: RwLock::new(HttpTargetConfig::default()),
            client: reqwest::Client::new(),
            pinger: Mutex::new(None),
        }
    }
}

#[async_trait]
impl XStatus for HttpTarget {
    async fn init(&self, _uuid: &str, config: &serde_json::Value) -> RhilexResult<()> {
        let config: HttpTargetConfig = bind_config(config)?;
        if !config.url.starts_with("http://") && !config.url.starts_with("https://") {
            return Err(RhilexError::InvalidConfig {
                field: "url".to_string(),
                reason: format!("invalid url: {}", config.url),
            });
        }
        *self.config.write() = config;
        Ok(())
    }

    async fn start(&self, ctx: CancellationToken) -> RhilexResult<()> {
        let config = self.config.read().clone();
        if config.allow_ping {
            let client = self.client.clone();
            let state = Arc::clone(&self.state);
            let handle = tokio::spawn(async move {
                let period = Duration::from_millis(config.timeout.max(1000));
                loop {
                    if let Err(e) = post(&client, &config, config.ping_packet.clone()).await {
                        warn!("HTTP target ping failed: {}", e);
                        state.set(ResourceState::Down);
                        break;
                    }
                    tokio::select! {
                        _ = ctx.cancelled() => break,
                        _ = tokio::time::sleep(period) => {},
                    }
                }
            });
            if let Some(old) = self.pinger.lock().replace(handle) {
                old.abort();
            }
        }
        info!("HTTP Target started");
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
        self.state.set(ResourceState::Stop);
    }
}

#[async_trait]
impl XTarget for HttpTarget {
    /// Returns the response body as a JSON string
    async fn to(&self, data: serde_json::Value) -> RhilexResult<serde_json::Value> {
        let config = self.config.read().clone();
        let body = json!({ "label": config.ping_packet, "body": payload_text(&data) }).to_string();
        let text = post(&self.client, &config, body).await?;
        Ok(serde_json::Value::String(text))
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use super::*;
    use axum::routing::post as post_route;
    use axum::{Json, Router};
    use common::RhilexConfig;

    #[tokio::test]
    async fn test_posts_label_and_body() {
        let (tx, mut rx) = tokio::sync::mpsc::channel::<serde_json::Value>(1);
        let app = Router::new().route(
            "/ingest",
            post_route(move |Json(body): Json<serde_json::Value>| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send(body).await;
                    "accepted"
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });

        let target = HttpTarget::new(RuntimeContext::new(RhilexConfig::default()));
        target
            .init(
                "http-out",
                &json!({ "url": format!("http://{}/ingest", addr), "headers": { "X-Token": "t" } }),
            )
            .await
            .unwrap();
        target.start(CancellationToken::new()).await.unwrap();

        let reply = target.to(json!("temperature=21")).await.unwrap();
        assert_eq!(reply, json!("accepted"));
        let received = rx.recv().await.unwrap();
        assert_eq!(received, json!({ "label": "rhilex", "body": "temperature=21" }));
    }

    #[tokio::test]
    async fn test_rejects_bad_url() {
        let target = HttpTarget::new(RuntimeContext::new(RhilexConfig::default()));
        assert!(target.init("h", &json!({ "url": "ftp://x" })).await.is_err());
    }
}
