//! Lua VM host
//!
//! Every rule and every applet owns an isolated VM with a memory cap, a
//! cancellation hook and the gateway library namespaces installed
//! (`data`, `kv`, `time`, `hex`, `binary`, `json`, `string`, `device`,
//! `modbus`, `modbus_slaver`, `ithings`, `tciothub`, `math`, `misc`, `http`,
//! `rpc`, `jq`, `network`, `rds`, `audio`).
//!
//! VMs are synchronous. Callers run them on blocking threads
//! (`tokio::task::spawn_blocking`); library functions that need async engine
//! operations block on the current runtime handle.

pub mod applet;
pub mod env;
pub mod error;
mod libs;
pub mod rule;
pub mod vm;

pub use applet::{AppletInfo, AppletRuntime, KilledBy};
pub use env::{ScriptEnv, ScriptScope, VmContext};
pub use error::ScriptErrorRecord;
pub use rule::{RuleOutcome, RuleVm};
pub use vm::{new_vm, validate_applet_script, verify_applet, verify_rule_syntax, VM_CANCELLED};
