//! Narrow view of the rule engine handed to resources and script libraries

use std::sync::Arc;

use errors::RhilexResult;

use crate::context::RuntimeContext;
use crate::model::{AppletDef, ResourceDef};
use crate::state::ResourceState;
use crate::traits::{XCecolla, XDevice, XSource, XTarget};
use crate::types::ResourceKind;

/// Callbacks a resource may make into the engine that owns it
pub trait EngineHandle: Send + Sync {
    fn runtime(&self) -> &RuntimeContext;

    /// Queue `data` produced by source `source_id` for its bound rules
    fn work_in_end(&self, source_id: &str, data: &str) -> RhilexResult<()>;

    /// Queue `data` produced by device `device_id` for its bound rules
    fn work_device(&self, device_id: &str, data: &str) -> RhilexResult<()>;

    fn get_source(&self, id: &str) -> Option<Arc<dyn XSource>>;
    fn get_device(&self, id: &str) -> Option<Arc<dyn XDevice>>;
    fn get_target(&self, id: &str) -> Option<Arc<dyn XTarget>>;
    fn get_cecolla(&self, id: &str) -> Option<Arc<dyn XCecolla>>;

    /// Stored definition of a loaded resource
    fn resource_def(&self, kind: ResourceKind, id: &str) -> Option<ResourceDef>;

    fn set_device_status(&self, id: &str, state: ResourceState);
    fn set_source_status(&self, id: &str, state: ResourceState);

    /// Compile and register an applet without starting it
    fn load_applet(&self, def: AppletDef) -> RhilexResult<()>;

    /// Run the applet's `Main(uuid, env)` once in the background
    fn start_applet(&self, id: &str, env: serde_json::Value) -> RhilexResult<()>;

    fn stop_applet(&self, id: &str) -> RhilexResult<()>;

    fn remove_applet(&self, id: &str) -> RhilexResult<()>;
}
