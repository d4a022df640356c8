//! What a VM can reach: the runtime context and a weak handle to the engine

use std::future::Future;
use std::sync::{Arc, Weak};

use rhilex_core::{EngineHandle, RuntimeContext};
use tokio_util::sync::CancellationToken;

use crate::vm::VM_CANCELLED;

#[derive(Clone)]
pub struct ScriptEnv {
    runtime: RuntimeContext,
    engine: Option<Weak<dyn EngineHandle>>,
}

impl ScriptEnv {
    pub fn new(runtime: RuntimeContext, engine: Weak<dyn EngineHandle>) -> Self {
        Self {
            runtime,
            engine: Some(engine),
        }
    }

    /// Environment without an engine; device/data libraries report an error
    pub fn detached(runtime: RuntimeContext) -> Self {
        Self {
            runtime,
            engine: None,
        }
    }

    pub fn runtime(&self) -> &RuntimeContext {
        &self.runtime
    }

    pub fn engine(&self) -> mlua::Result<Arc<dyn EngineHandle>> {
        self.engine
            .as_ref()
            .and_then(Weak::upgrade)
            .ok_or_else(|| mlua::Error::runtime("rule engine not available"))
    }
}

impl std::fmt::Debug for ScriptEnv {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptEnv")
            .field("runtime", &self.runtime)
            .field("attached", &self.engine.is_some())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptScope {
    Rule,
    Applet,
}

impl ScriptScope {
    /// Log topic that script output and VM errors are tagged with
    pub fn log_topic(&self, uuid: &str) -> String {
        match self {
            Self::Rule => format!("rule/log/{}", uuid),
            Self::Applet => format!("cecollalet/console/{}", uuid),
        }
    }
}

/// Per-VM state captured by library closures
#[derive(Debug)]
pub struct VmContext {
    pub uuid: String,
    pub scope: ScriptScope,
    pub token: CancellationToken,
    pub env: ScriptEnv,
}

impl VmContext {
    pub fn new(
        uuid: impl Into<String>,
        scope: ScriptScope,
        token: CancellationToken,
        env: ScriptEnv,
    ) -> Arc<Self> {
        Arc::new(Self {
            uuid: uuid.into(),
            scope,
            token,
            env,
        })
    }

    pub fn log_topic(&self) -> String {
        self.scope.log_topic(&self.uuid)
    }

    /// Drive `fut` to completion from the VM thread, giving up when the VM
    /// is cancelled
    pub(crate) fn block_on<F: Future>(&self, fut: F) -> mlua::Result<F::Output> {
        let handle = tokio::runtime::Handle::try_current()
            .map_err(|_| mlua::Error::runtime("no async runtime available"))?;
        let token = self.token.clone();
        handle.block_on(async move {
            tokio::select! {
                _ = token.cancelled() => Err(mlua::Error::runtime(VM_CANCELLED)),
                out = fut => Ok(out),
            }
        })
    }
}
