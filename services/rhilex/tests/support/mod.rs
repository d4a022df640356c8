//! Shared fixtures for the engine integration tests
#![allow(dead_code)]

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common::RhilexConfig;
use errors::{RhilexError, RhilexResult};
use parking_lot::Mutex;
use rhilex::engine::TypeRegistry;
use rhilex::store::{ConfigStore, MemoryStore};
use rhilex::RuleEngine;
use rhilex_core::{
    ResourceState, RuleDef, RuleStatus, RuntimeContext, StateCell, SupervisorTiming, XDevice,
    XSource, XStatus,
};
use tokio_util::sync::CancellationToken;

pub const FAKE_SOURCE: &str = "FAKE_SOURCE";
pub const FAKE_DEVICE: &str = "FAKE_DEVICE";

/// Shared view into every instance the fake factories build
#[derive(Default)]
pub struct Probe {
    /// Number of `start` calls that should fail before one succeeds
    pub failures: AtomicU32,
    pub starts: AtomicU32,
    pub stops: AtomicU32,
    pub configs: Mutex<Vec<serde_json::Value>>,
}

pub struct FakeSource {
    probe: Arc<Probe>,
    state: StateCell,
}

#[async_trait]
impl XStatus for FakeSource {
    async fn init(&self, _uuid: &str, config: &serde_json::Value) -> RhilexResult<()> {
        if config.get("broken").is_some() {
            return Err(RhilexError::InvalidConfig {
                field: "broken".to_string(),
                reason: "set by test".to_string(),
            });
        }
        self.probe.configs.lock().push(config.clone());
        Ok(())
    }

    async fn start(&self, _ctx: CancellationToken) -> RhilexResult<()> {
        self.probe.starts.fetch_add(1, Ordering::SeqCst);
        let remaining = self.probe.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.probe.failures.store(remaining - 1, Ordering::SeqCst);
            return Err(RhilexError::ConnectionFailed {
                endpoint: "fake".to_string(),
                reason: "refused".to_string(),
            });
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
        self.probe.stops.fetch_add(1, Ordering::SeqCst);
        self.state.set(ResourceState::Stop);
    }
}

impl XSource for FakeSource {}

#[async_trait]
impl XDevice for FakeSource {}

pub struct Harness {
    pub engine: Arc<RuleEngine>,
    pub runtime: RuntimeContext,
    pub store: Arc<MemoryStore>,
    pub probe: Arc<Probe>,
}

pub fn fast_timing() -> SupervisorTiming {
    SupervisorTiming {
        tick: Duration::from_millis(30),
        reload_delay: Duration::from_millis(30),
    }
}

/// Engine with the built-in types plus [`FAKE_SOURCE`] and [`FAKE_DEVICE`]
pub fn harness(config: RhilexConfig) -> Harness {
    let runtime = RuntimeContext::new(config).with_timing(fast_timing());
    let store = Arc::new(MemoryStore::new());
    let probe = Arc::new(Probe::default());

    let registry = TypeRegistry::with_builtin();
    let shared = Arc::clone(&probe);
    registry.sources.register(FAKE_SOURCE, move |_, _| {
        Arc::new(FakeSource {
            probe: Arc::clone(&shared),
            state: StateCell::default(),
        })
    });
    let shared = Arc::clone(&probe);
    registry.devices.register(FAKE_DEVICE, move |_, _| {
        Arc::new(FakeSource {
            probe: Arc::clone(&shared),
            state: StateCell::default(),
        })
    });
    let dyn_store: Arc<dyn ConfigStore> = store.clone();
    let engine = RuleEngine::with_registry(runtime.clone(), dyn_store, registry);
    Harness {
        engine,
        runtime,
        store,
        probe,
    }
}

pub fn rule(uuid: &str, source: &str, actions: &str) -> RuleDef {
    RuleDef {
        uuid: uuid.to_string(),
        name: uuid.to_string(),
        from_source: Some(source.to_string()),
        from_device: None,
        actions: actions.to_string(),
        success: "function Success() end".to_string(),
        failed: r#"function Failed(err) kv:VSet("failed", err) end"#.to_string(),
        description: String::new(),
        status: RuleStatus::Running,
    }
}

pub fn device_rule(uuid: &str, device: &str, actions: &str) -> RuleDef {
    RuleDef {
        from_source: None,
        from_device: Some(device.to_string()),
        ..rule(uuid, "", actions)
    }
}

/// Poll `check` until it holds or `timeout` passes
pub async fn wait_until<F>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
