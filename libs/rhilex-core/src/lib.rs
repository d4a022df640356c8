//! Resource model and runtime fabric for the rhilex gateway
//!
//! Defines the lifecycle traits every source, device, target and cecolla
//! implements, the narrow [`EngineHandle`] they call back through, and the
//! [`RuntimeContext`] that carries the shared cache, bus and stores.

pub mod binding;
pub mod context;
pub mod engine;
pub mod hwport;
pub mod model;
pub mod state;
pub mod supervisor;
pub mod traits;
pub mod types;

pub use context::{RuntimeContext, SupervisorTiming};
pub use engine::EngineHandle;
pub use hwport::{HwPortManager, SystemUart, UartConfig, UartOccupy};
pub use model::{AppletDef, RegisterWrite, ResourceDef, RuleDef};
pub use state::{ResourceState, RuleStatus, StateCell};
pub use supervisor::{Supervisor, SupervisorAdmin};
pub use traits::{XCecolla, XDevice, XSource, XStatus, XTarget};
pub use types::ResourceKind;
