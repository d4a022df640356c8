//! Gateway startup and shutdown
//!
//! Order: config, logging, runtime context, store, engine, plugins,
//! transceivers, then everything persisted in the store.

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use common::logging::{self, LogConfig};
use common::LoadedConfig;
use errors::RhilexResult;
use rhilex_core::RuntimeContext;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::engine::RuleEngine;
use crate::store::{ConfigStore, MemoryStore, SqliteStore};
use crate::transceiver::TransceiverManager;

/// A booted gateway
pub struct Gateway {
    engine: Arc<RuleEngine>,
    transceivers: TransceiverManager,
    root: CancellationToken,
}

/// Open the SQLite store, or fall back to an in-memory one when the
/// database cannot be opened
pub async fn open_store(db_path: &str) -> Arc<dyn ConfigStore> {
    match SqliteStore::connect(db_path).await {
        Ok(store) => Arc::new(store),
        Err(e) => {
            warn!("Open database {} failed, using in-memory store: {}", db_path, e);
            Arc::new(MemoryStore::new())
        },
    }
}

impl Gateway {
    /// Build the runtime from an already loaded config and boot it.
    /// Logging must be set up by the caller.
    pub async fn start(loaded: LoadedConfig, root: CancellationToken) -> RhilexResult<Self> {
        let runtime = RuntimeContext::with_root(loaded.app.clone(), root.clone());
        let store = open_store(&loaded.app.db_path).await;

        let engine = RuleEngine::new(runtime.clone(), store);
        engine.start();
        engine
            .plugins()
            .load_all(&loaded.plugins, &engine.engine_ref())
            .await;

        let transceivers = TransceiverManager::new(Arc::clone(&runtime.bus), root.child_token());
        transceivers.start_all(&loaded.transceivers);

        engine.boot().await?;
        info!("rhilex {} started", engine.version());
        Ok(Self {
            engine,
            transceivers,
            root,
        })
    }

    pub fn engine(&self) -> &Arc<RuleEngine> {
        &self.engine
    }

    pub fn transceivers(&self) -> &TransceiverManager {
        &self.transceivers
    }

    /// Block until a shutdown signal arrives or the root token is cancelled
    pub async fn wait(&self) {
        common::shutdown::cancel_on_shutdown(self.root.clone()).await;
    }

    pub async fn stop(self) {
        self.transceivers.stop_all();
        self.engine.stop().await;
        self.root.cancel();
        info!("rhilex stopped");
    }
}

/// `rhilex run`: load the INI file, start the gateway and serve until a
/// shutdown signal
pub async fn run(config_path: impl AsRef<Path>) -> anyhow::Result<()> {
    let config_path = config_path.as_ref();
    let loaded = LoadedConfig::load(config_path)
        .with_context(|| format!("Failed to load config {}", config_path.display()))?;

    logging::init_with_config(LogConfig::from_app(&loaded.app))
        .map_err(|e| anyhow::anyhow!("Failed to init logging: {}", e))?;
    info!("Config loaded from {}", config_path.display());

    let gateway = Gateway::start(loaded, CancellationToken::new())
        .await
        .context("Failed to start rhilex")?;
    gateway.wait().await;
    gateway.stop().await;
    Ok(())
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use super::*;
    use common::{IniSection, PluginSection, TransceiverConfig};

    fn loaded(db_path: &str) -> LoadedConfig {
        let mut app = common::RhilexConfig::default();
        app.db_path = db_path.to_string();
        let mut mqtt = IniSection::new("plugin.mqtt_server");
        mqtt.insert("host", "127.0.0.1");
        mqtt.insert("port", "0");
        LoadedConfig {
            app,
            plugins: vec![PluginSection {
                name: "mqtt_server".to_string(),
                enable: true,
                section: mqtt,
            }],
            transceivers: vec![TransceiverConfig {
                name: "atk01".to_string(),
                enable: false,
                address: "COM1".to_string(),
                baud_rate: 9600,
                data_bits: 8,
                parity: "N".to_string(),
                stop_bits: 1,
                io_timeout: 0,
                transport_protocol: 1,
            }],
        }
    }

    #[tokio::test]
    async fn test_start_and_stop() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("rhilex.db");
        let root = CancellationToken::new();

        let gateway = Gateway::start(loaded(db.to_str().unwrap()), root.clone())
            .await
            .unwrap();
        assert!(db.exists());
        assert_eq!(gateway.engine().plugins().len(), 1);
        assert!(gateway.transceivers().names().is_empty());

        root.cancel();
        tokio::time::timeout(std::time::Duration::from_secs(2), gateway.wait())
            .await
            .unwrap();
        gateway.stop().await;
    }

    #[tokio::test]
    async fn test_unusable_database_falls_back_to_memory() {
        let dir = tempfile::tempdir().unwrap();
        let bad = dir.path().join("missing").join("nested").join("rhilex.db");
        let store = open_store(bad.to_str().unwrap()).await;
        assert!(store.list_rules().await.unwrap().is_empty());
    }
}
