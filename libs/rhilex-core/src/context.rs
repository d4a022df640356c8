//! Process-wide services shared by the engine, resources and script VMs

use std::sync::Arc;
use std::time::Duration;

use common::RhilexConfig;
use rhilex_bus::EventBus;
use rhilex_cache::{DataCenter, KvStore, PointCache};
use tokio_util::sync::CancellationToken;

use crate::hwport::HwPortManager;
use crate::supervisor::SupervisorAdmin;

/// Supervisor timing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SupervisorTiming {
    /// Interval between `status()` checks
    pub tick: Duration,
    /// Pause between a DOWN report and the reload
    pub reload_delay: Duration,
}

impl Default for SupervisorTiming {
    fn default() -> Self {
        Self {
            tick: Duration::from_secs(5),
            reload_delay: Duration::from_secs(4),
        }
    }
}

/// Explicit replacement for the gateway's global singletons
#[derive(Clone)]
pub struct RuntimeContext {
    pub config: Arc<RhilexConfig>,
    pub cache: Arc<PointCache>,
    pub bus: Arc<EventBus>,
    pub kv: Arc<KvStore>,
    pub datacenter: Arc<DataCenter>,
    pub hwports: Arc<HwPortManager>,
    pub supervisors: Arc<SupervisorAdmin>,
    pub timing: SupervisorTiming,
    /// Cancelled once on shutdown
    pub root: CancellationToken,
}

impl RuntimeContext {
    pub fn new(config: RhilexConfig) -> Self {
        Self::with_root(config, CancellationToken::new())
    }

    pub fn with_root(config: RhilexConfig, root: CancellationToken) -> Self {
        Self {
            cache: Arc::new(PointCache::new()),
            bus: Arc::new(EventBus::new()),
            kv: Arc::new(KvStore::new(config.max_kv_store_size)),
            datacenter: Arc::new(DataCenter::new(config.max_lost_cache_size)),
            hwports: Arc::new(HwPortManager::new()),
            supervisors: Arc::new(SupervisorAdmin::new(root.child_token())),
            timing: SupervisorTiming::default(),
            config: Arc::new(config),
            root,
        }
    }

    pub fn with_timing(mut self, timing: SupervisorTiming) -> Self {
        self.timing = timing;
        self
    }
}

impl std::fmt::Debug for RuntimeContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeContext")
            .field("app_id", &self.config.app_id)
            .field("slots", &self.cache.size())
            .field("supervisors", &self.supervisors.len())
            .finish()
    }
}
