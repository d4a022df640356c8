//! rhilex gateway service
//!
//! Wires the runtime fabric together: the [`engine::RuleEngine`] owns every
//! loaded source, device, target, cecolla and rule, feeds the internal
//! queues into the rule VMs and supervises resources so a DOWN resource is
//! reloaded from the [`store::ConfigStore`].
//!
//! ```text
//!  device / source ──► work_device / work_in_end ──► queue ──► drainer
//!                                                              │
//!                                     RuleVm::execute ◄────────┘
//!                                          │
//!                              data:ToMqtt / ToHttp ... ──► targets
//! ```
//!
//! Built-in resource types live in [`sources`], [`devices`], [`targets`] and
//! [`cecolla`]; the embedded MQTT [`broker`] backs both the
//! `GENERIC_MQTT_SERVER` source and the `mqtt_server` plugin.

pub mod bootstrap;
pub mod broker;
pub mod cecolla;
pub mod devices;
pub mod engine;
pub mod maintenance;
pub mod plugins;
pub mod sources;
pub mod store;
pub mod targets;
pub mod transceiver;

pub use engine::{EngineRef, RuleEngine};
pub use store::{ConfigStore, MemoryStore, SqliteStore};
