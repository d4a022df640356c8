//! Lifecycle traits implemented by every resource
//!
//! All methods take `&self`: implementations keep their mutable state behind
//! locks so the engine can share one `Arc` between the registry, the
//! supervisor and script libraries.

use async_trait::async_trait;
use errors::{RhilexError, RhilexResult};
use tokio_util::sync::CancellationToken;

use crate::state::ResourceState;

// ============================================================================
// Core Traits
// ============================================================================

/// Init -> Start -> Status -> Stop lifecycle shared by all resources
///
/// @lifecycle `init` once per load, `start` once per successful init,
/// `stop` any number of times
#[async_trait]
pub trait XStatus: Send + Sync {
    /// Bind `config` and prepare internal state
    async fn init(&self, uuid: &str, config: &serde_json::Value) -> RhilexResult<()>;

    /// Begin work; long-running loops must exit when `ctx` is cancelled
    async fn start(&self, ctx: CancellationToken) -> RhilexResult<()>;

    fn status(&self) -> ResourceState;

    fn set_state(&self, state: ResourceState);

    /// Release everything acquired by init/start. Idempotent.
    async fn stop(&self);
}

/// Ingress resource (InEnd)
#[async_trait]
pub trait XSource: XStatus {
    /// Cheap reachability probe
    async fn test(&self, _uuid: &str) -> bool {
        true
    }

    /// Push bytes back towards the peer that produced the data
    async fn down_stream(&self, _data: &[u8]) -> RhilexResult<usize> {
        Err(RhilexError::Unsupported("down_stream".to_string()))
    }

    async fn up_stream(&self, _data: &[u8]) -> RhilexResult<usize> {
        Err(RhilexError::Unsupported("up_stream".to_string()))
    }
}

/// Polled fieldbus endpoint
#[async_trait]
pub trait XDevice: XStatus {
    async fn on_read(&self, _cmd: &[u8]) -> RhilexResult<Vec<u8>> {
        Err(RhilexError::Unsupported("on_read".to_string()))
    }

    /// Returns the number of bytes or registers written
    async fn on_write(&self, _cmd: &[u8], _data: &[u8]) -> RhilexResult<usize> {
        Err(RhilexError::Unsupported("on_write".to_string()))
    }

    async fn on_ctrl(&self, _cmd: &[u8], _args: &[u8]) -> RhilexResult<Vec<u8>> {
        Err(RhilexError::Unsupported("on_ctrl".to_string()))
    }
}

/// Egress sink (OutEnd)
#[async_trait]
pub trait XTarget: XStatus {
    async fn to(&self, data: serde_json::Value) -> RhilexResult<serde_json::Value>;
}

/// Cloud platform adapter
#[async_trait]
pub trait XCecolla: XStatus {
    /// Run a named vendor operation, returning the response body
    async fn on_ctrl(&self, cmd: &str, args: &[u8]) -> RhilexResult<Vec<u8>>;
}
