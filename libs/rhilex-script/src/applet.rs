//! Applet (cecollalet) runtime
//!
//! An applet is a long-lived script whose `Main(uuid, env)` runs once per
//! start on a blocking thread. Every start builds a fresh VM with a fresh
//! cancellation token, so a stop never races with a VM that is still
//! unwinding. When `Main` throws, the applet is restarted after the rescue
//! delay if it is marked auto-start and nobody stopped or removed it in the
//! meantime.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use common::logging::SCRIPT_TARGET;
use dashmap::DashMap;
use errors::{RhilexError, RhilexResult};
use mlua::Value;
use parking_lot::Mutex;
use rhilex_core::AppletDef;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::env::{ScriptEnv, ScriptScope, VmContext};
use crate::error::{describe, ScriptErrorRecord};
use crate::libs::json::json_to_lua;
use crate::vm::{applet_main, new_vm, validate_applet_script};

pub const DEFAULT_RESCUE_DELAY: Duration = Duration::from_secs(5);

/// How the last run of an applet ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KilledBy {
    /// Still running or never started
    #[default]
    None,
    /// `Main` returned
    Normal,
    /// Stopped by the gateway
    Rhilex,
    /// `Main` raised an error
    Except,
}

impl KilledBy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "",
            Self::Normal => "NORMAL",
            Self::Rhilex => "RHILEX",
            Self::Except => "EXCEPT",
        }
    }
}

impl Serialize for KilledBy {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AppletInfo {
    pub uuid: String,
    pub name: String,
    pub version: String,
    pub auto_start: bool,
    /// 1 while `Main` is running
    pub app_state: u8,
    pub killed_by: KilledBy,
    pub description: String,
}

struct AppletEntry {
    def: Mutex<AppletDef>,
    running: AtomicBool,
    killed_by: Mutex<KilledBy>,
    token: Mutex<Option<CancellationToken>>,
    // bumped on every start so a finished run can tell whether it is stale
    generation: AtomicU64,
}

impl AppletEntry {
    fn new(def: AppletDef) -> Self {
        Self {
            def: Mutex::new(def),
            running: AtomicBool::new(false),
            killed_by: Mutex::new(KilledBy::None),
            token: Mutex::new(None),
            generation: AtomicU64::new(0),
        }
    }

    fn info(&self) -> AppletInfo {
        let def = self.def.lock();
        AppletInfo {
            uuid: def.uuid.clone(),
            name: def.name.clone(),
            version: def.version.clone(),
            auto_start: def.auto_start,
            app_state: u8::from(self.running.load(Ordering::SeqCst)),
            killed_by: *self.killed_by.lock(),
            description: def.description.clone(),
        }
    }

    fn cancel(&self) {
        if let Some(token) = self.token.lock().take() {
            token.cancel();
        }
    }
}

fn not_found(id: &str) -> RhilexError {
    RhilexError::not_found("Cecollalet", id)
}

pub struct AppletRuntime {
    env: ScriptEnv,
    applets: DashMap<String, Arc<AppletEntry>>,
    rescue_delay: Duration,
}

impl AppletRuntime {
    pub fn new(env: ScriptEnv) -> Arc<Self> {
        Self::with_rescue_delay(env, DEFAULT_RESCUE_DELAY)
    }

    pub fn with_rescue_delay(env: ScriptEnv, rescue_delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            env,
            applets: DashMap::new(),
            rescue_delay,
        })
    }

    /// Validate and register `def`; a loaded applet with the same id is
    /// replaced
    pub fn load(&self, def: AppletDef) -> RhilexResult<()> {
        validate_applet_script(&def.script)?;
        if let Some(old) = self.applets.get(&def.uuid) {
            old.cancel();
        }
        info!("Applet loaded: {} ({})", def.name, def.uuid);
        self.applets
            .insert(def.uuid.clone(), Arc::new(AppletEntry::new(def)));
        Ok(())
    }

    /// Run `Main(uuid, env)` once in the background
    pub fn start(self: &Arc<Self>, id: &str, env: serde_json::Value) -> RhilexResult<()> {
        let entry = self.applets.get(id).map(|e| Arc::clone(&e)).ok_or_else(|| not_found(id))?;
        if entry.running.swap(true, Ordering::SeqCst) {
            return Err(RhilexError::AlreadyRunning(id.to_string()));
        }
        let launched = self.launch(id, &entry, env);
        if launched.is_err() {
            entry.running.store(false, Ordering::SeqCst);
        }
        launched
    }

    fn launch(
        self: &Arc<Self>,
        id: &str,
        entry: &Arc<AppletEntry>,
        env: serde_json::Value,
    ) -> RhilexResult<()> {
        let handle = tokio::runtime::Handle::try_current()
            .map_err(|_| RhilexError::runtime("applets need a tokio runtime"))?;
        let script = entry.def.lock().script.clone();

        let token = self.env.runtime().root.child_token();
        let ctx = VmContext::new(id, ScriptScope::Applet, token.clone(), self.env.clone());
        let lua = new_vm(&ctx)?;
        lua.load(script.as_str())
            .set_name("Main")
            .exec()
            .map_err(crate::error::invalid_script)?;
        applet_main(&lua)?;

        let generation = entry.generation.fetch_add(1, Ordering::SeqCst) + 1;
        *entry.token.lock() = Some(token.clone());
        *entry.killed_by.lock() = KilledBy::None;

        let runtime = Arc::clone(self);
        let entry = Arc::clone(entry);
        let uuid = id.to_string();
        let topic = ctx.log_topic();
        info!("Applet started: {}", uuid);

        handle.spawn(async move {
            let run_uuid = uuid.clone();
            let joined = tokio::task::spawn_blocking(move || -> mlua::Result<()> {
                let main = applet_main(&lua).map_err(|e| mlua::Error::runtime(e.to_string()))?;
                let env = json_to_lua(&lua, &env)?;
                main.call::<_, Value>((run_uuid, env)).map(|_| ())
            })
            .await;

            if entry.generation.load(Ordering::SeqCst) != generation {
                return;
            }
            entry.running.store(false, Ordering::SeqCst);
            let result = match joined {
                Ok(r) => r,
                Err(e) => Err(mlua::Error::runtime(e.to_string())),
            };
            match result {
                Ok(()) => {
                    *entry.killed_by.lock() = KilledBy::Normal;
                    info!(target: SCRIPT_TARGET, topic = %topic, "Applet exited normally: {}", uuid);
                },
                Err(_) if token.is_cancelled() => {
                    *entry.killed_by.lock() = KilledBy::Rhilex;
                    info!(target: SCRIPT_TARGET, topic = %topic, "Applet stopped: {}", uuid);
                },
                Err(e) => {
                    *entry.killed_by.lock() = KilledBy::Except;
                    let record = ScriptErrorRecord::from_error("Main", &e);
                    warn!(target: SCRIPT_TARGET, topic = %topic, "{}", record);
                    runtime.rescue(uuid, entry, generation, describe(&e)).await;
                },
            }
        });
        Ok(())
    }

    /// Wait out the rescue delay, then restart if still wanted
    async fn rescue(self: Arc<Self>, uuid: String, entry: Arc<AppletEntry>, generation: u64, reason: String) {
        if !entry.def.lock().auto_start {
            return;
        }
        warn!("Applet {} crashed ({}), restarting in {:?}", uuid, reason, self.rescue_delay);
        let root = self.env.runtime().root.clone();
        tokio::select! {
            _ = root.cancelled() => return,
            _ = tokio::time::sleep(self.rescue_delay) => {},
        }
        let still_loaded = self
            .applets
            .get(&uuid)
            .is_some_and(|current| Arc::ptr_eq(&current, &entry));
        let untouched = entry.generation.load(Ordering::SeqCst) == generation
            && *entry.killed_by.lock() == KilledBy::Except;
        if !still_loaded || !untouched {
            return;
        }
        if let Err(e) = self.start(&uuid, serde_json::Value::Null) {
            warn!("Applet {} restart failed: {}", uuid, e);
        }
    }

    pub fn stop(&self, id: &str) -> RhilexResult<()> {
        let entry = self.applets.get(id).map(|e| Arc::clone(&e)).ok_or_else(|| not_found(id))?;
        // invalidate the running task so it does not overwrite the state
        entry.generation.fetch_add(1, Ordering::SeqCst);
        entry.cancel();
        entry.running.store(false, Ordering::SeqCst);
        *entry.killed_by.lock() = KilledBy::Rhilex;
        info!("Applet stopped: {}", id);
        Ok(())
    }

    pub fn remove(&self, id: &str) -> RhilexResult<()> {
        let (_, entry) = self.applets.remove(id).ok_or_else(|| not_found(id))?;
        entry.generation.fetch_add(1, Ordering::SeqCst);
        entry.cancel();
        info!("Applet removed: {}", id);
        Ok(())
    }

    /// Replace the definition; a running applet, or one marked auto-start,
    /// is restarted with the new script
    pub fn update(self: &Arc<Self>, def: AppletDef) -> RhilexResult<()> {
        validate_applet_script(&def.script)?;
        let entry = self
            .applets
            .get(&def.uuid)
            .map(|e| Arc::clone(&e))
            .ok_or_else(|| not_found(&def.uuid))?;
        let was_running = entry.running.load(Ordering::SeqCst);
        if was_running {
            self.stop(&def.uuid)?;
        }
        let restart = was_running || def.auto_start;
        let id = def.uuid.clone();
        *entry.def.lock() = def;
        if restart {
            self.start(&id, serde_json::Value::Null)?;
        }
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<AppletInfo> {
        self.applets.get(id).map(|e| e.info())
    }

    pub fn list(&self) -> Vec<AppletInfo> {
        let mut all: Vec<AppletInfo> = self.applets.iter().map(|e| e.info()).collect();
        all.sort_by(|a, b| a.uuid.cmp(&b.uuid));
        all
    }

    pub fn killed_by(&self, id: &str) -> Option<KilledBy> {
        self.applets.get(id).map(|e| *e.killed_by.lock())
    }

    /// Start every applet marked auto-start
    pub fn start_auto(self: &Arc<Self>) {
        let ids: Vec<String> = self
            .applets
            .iter()
            .filter(|e| e.def.lock().auto_start)
            .map(|e| e.key().clone())
            .collect();
        for id in ids {
            if let Err(e) = self.start(&id, serde_json::Value::Null) {
                warn!("Applet {} auto start failed: {}", id, e);
            }
        }
    }

    pub fn stop_all(&self) {
        let ids: Vec<String> = self.applets.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            let _ = self.stop(&id);
        }
    }

    pub fn len(&self) -> usize {
        self.applets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.applets.is_empty()
    }
}

impl std::fmt::Debug for AppletRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppletRuntime")
            .field("applets", &self.applets.len())
            .field("rescue_delay", &self.rescue_delay)
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use common::RhilexConfig;
    use rhilex_core::RuntimeContext;

    use super::*;

    fn runtime(delay: Duration) -> (Arc<AppletRuntime>, RuntimeContext) {
        let ctx = RuntimeContext::new(RhilexConfig::default());
        let env = ScriptEnv::detached(ctx.clone());
        (AppletRuntime::with_rescue_delay(env, delay), ctx)
    }

    fn def(id: &str, script: &str, auto_start: bool) -> AppletDef {
        AppletDef {
            uuid: id.into(),
            name: format!("applet-{}", id),
            version: "v1.0.0".into(),
            auto_start,
            script: script.into(),
            description: String::new(),
        }
    }

    async fn wait_for(rt: &AppletRuntime, id: &str, want: KilledBy) {
        for _ in 0..200 {
            if rt.killed_by(id) == Some(want) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("applet {id} never reached {want:?}, got {:?}", rt.killed_by(id));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_normal_exit_and_kv_side_effect() {
        let (rt, ctx) = runtime(Duration::from_millis(50));
        rt.load(def("a1", r#"function Main(uuid, env) kv:VSet("from", uuid) return 0 end"#, false))
            .unwrap();
        rt.start("a1", serde_json::Value::Null).unwrap();
        wait_for(&rt, "a1", KilledBy::Normal).await;
        assert_eq!(ctx.kv.get("from"), "a1");
        assert_eq!(rt.get("a1").unwrap().app_state, 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_double_start_and_stop() {
        let (rt, _) = runtime(Duration::from_millis(50));
        rt.load(def("a2", "function Main(uuid, env) while true do end end", false))
            .unwrap();
        rt.start("a2", serde_json::Value::Null).unwrap();
        let err = rt.start("a2", serde_json::Value::Null).unwrap_err();
        assert_eq!(err.to_string(), "Cecollalet already started:a2");
        rt.stop("a2").unwrap();
        assert_eq!(rt.killed_by("a2"), Some(KilledBy::Rhilex));
        assert_eq!(rt.get("a2").unwrap().app_state, 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_missing_applet() {
        let (rt, _) = runtime(Duration::from_millis(50));
        let err = rt.start("nope", serde_json::Value::Null).unwrap_err();
        assert_eq!(err.to_string(), "Cecollalet not exists:nope");
        assert!(rt.stop("nope").is_err());
        assert!(rt.remove("nope").is_err());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_exception_triggers_rescue_when_auto_start() {
        let (rt, ctx) = runtime(Duration::from_millis(50));
        let script = r#"
            function Main(uuid, env)
                local n = tonumber(kv:VGet("runs")) or 0
                kv:VSet("runs", tostring(n + 1))
                if n == 0 then error("first run fails") end
                return 0
            end
        "#;
        rt.load(def("a3", script, true)).unwrap();
        rt.start("a3", serde_json::Value::Null).unwrap();
        wait_for(&rt, "a3", KilledBy::Normal).await;
        assert_eq!(ctx.kv.get("runs"), "2");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_exception_without_auto_start_stays_down() {
        let (rt, _) = runtime(Duration::from_millis(20));
        rt.load(def("a4", "function Main(uuid, env) error('x') end", false))
            .unwrap();
        rt.start("a4", serde_json::Value::Null).unwrap();
        wait_for(&rt, "a4", KilledBy::Except).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(rt.killed_by("a4"), Some(KilledBy::Except));
    }

    #[test]
    fn test_load_rejects_bad_script() {
        let (rt, _) = runtime(Duration::from_millis(20));
        assert!(rt.load(def("a5", "x = 1", false)).is_err());
        assert!(rt.is_empty());
    }
}
