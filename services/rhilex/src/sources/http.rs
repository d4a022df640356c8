//! `HTTP`: `POST /in` ingress
//!
//! Accepts `{"data":"..."}` and queues `data` as-is.

use std::net::SocketAddr;

use async_trait::async_trait;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use common::bind_config;
use errors::{RhilexError, RhilexResult};
use parking_lot::{Mutex, RwLock};
use rhilex_core::{ResourceState, RuntimeContext, StateCell, XSource, XStatus};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::engine::EngineRef;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HttpSourceConfig {
    pub host: String,
    pub port: u16,
}

impl Default for HttpSourceConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8088,
        }
    }
}

#[derive(Clone)]
struct IngressState {
    source_id: String,
    engine: EngineRef,
}

#[derive(Deserialize)]
struct InForm {
    data: String,
}

async fn handle_in(
    State(state): State<IngressState>,
    Json(form): Json<InForm>,
) -> (StatusCode, Json<serde_json::Value>) {
    match state
        .engine
        .get()
        .and_then(|e| e.work_in_end(&state.source_id, &form.data))
    {
        Ok(()) => (
            StatusCode::OK,
            Json(json!({ "code": 200, "message": "success" })),
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "code": 500, "message": e.to_string() })),
        ),
    }
}

pub(crate) fn router(source_id: String, engine: EngineRef) -> Router {
    Router::new()
        .route("/in", post(handle_in))
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
        .with_state(IngressState { source_id, engine })
}

pub struct HttpSource {
    engine: EngineRef,
    state: StateCell,
    source_id: RwLock<String>,
    config: RwLock<HttpSourceConfig>,
    local_addr: Mutex<Option<SocketAddr>>,
    server: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl HttpSource {
    pub fn new(_runtime: RuntimeContext, engine: EngineRef) -> Self {
        Self {
            engine,
            state: StateCell::default(),
            source_id: RwLock::new(String::new()),
            config: RwLock::new(HttpSourceConfig::default()),
            local_addr: Mutex::new(None),
            server: Mutex::new(None),
        }
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }
}

#[async_trait]
impl XStatus for HttpSource {
    async fn init(&self, uuid: &str, config: &serde_json::Value) -> RhilexResult<()> {
        let config: HttpSourceConfig = bind_config(config)?;
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
        let config = self.config.read().clone();
        let listener = TcpListener::bind((config.host.as_str(), config.port)).await?;
        let addr = listener.local_addr()?;
        info!("HTTP source started on {}", addr);

        let app = router(self.source_id.read().clone(), self.engine.clone());
        let token = ctx.child_token();
        let shutdown = token.clone();
        let handle = tokio::spawn(async move {
            let served = axum::serve(listener, app)
                .with_graceful_shutdown(async move { shutdown.cancelled().await })
                .await;
            if let Err(e) = served {
                warn!("HTTP server error: {}", e);
            }
        });

        if let Some((old_token, old_handle)) = self.server.lock().replace((token, handle)) {
            old_token.cancel();
            old_handle.abort();
        }
        *self.local_addr.lock() = Some(addr);
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
        if let Some((token, handle)) = self.server.lock().take() {
            token.cancel();
            handle.abort();
        }
        self.local_addr.lock().take();
        self.state.set(ResourceState::Stop);
    }
}

#[async_trait]
impl XSource for HttpSource {}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use super::*;
    use common::RhilexConfig;

    #[tokio::test]
    async fn test_post_without_engine_reports_error() {
        let source = HttpSource::new(RuntimeContext::new(RhilexConfig::default()), EngineRef::detached());
        source
            .init("http1", &json!({ "host": "127.0.0.1", "port": 0 }))
            .await
            .unwrap();
        source.start(CancellationToken::new()).await.unwrap();
        let addr = source.local_addr().unwrap();

        let resp = reqwest::Client::new()
            .post(format!("http://{}/in", addr))
            .json(&json!({ "data": "hello" }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status().as_u16(), 500);

        let bad = reqwest::Client::new()
            .post(format!("http://{}/in", addr))
            .body("not json")
            .header("content-type", "application/json")
            .send()
            .await
            .unwrap();
        assert!(bad.status().is_client_error());

        source.stop().await;
        source.stop().await;
        assert_eq!(source.status(), ResourceState::Stop);
    }
}
