//! Rule loading and execution

use std::sync::Arc;

use errors::{RhilexError, RhilexResult};
use parking_lot::Mutex;
use rhilex_core::{ResourceKind, RuleDef, RuleStatus};
use rhilex_script::{RuleOutcome, RuleVm};
use tracing::{debug, info, warn};

use super::RuleEngine;

/// A compiled rule
pub struct RuleEntry {
    pub def: RuleDef,
    pub vm: Arc<RuleVm>,
    status: Mutex<RuleStatus>,
}

impl RuleEntry {
    pub fn status(&self) -> RuleStatus {
        *self.status.lock()
    }

    fn bound_to(&self, kind: ResourceKind, resource_id: &str) -> bool {
        let id = match kind {
            ResourceKind::Source => self.def.from_source.as_deref(),
            ResourceKind::Device => self.def.from_device.as_deref(),
            _ => None,
        };
        id == Some(resource_id)
    }
}

impl std::fmt::Debug for RuleEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuleEntry")
            .field("uuid", &self.def.uuid)
            .field("status", &self.status())
            .finish()
    }
}

impl RuleEngine {
    /// Compile `def` and bind it to its resource.
    ///
    /// The bound source or device must already be loaded. Loading a uuid
    /// that exists replaces the old rule in place and stops its VM.
    pub fn load_rule(&self, def: RuleDef) -> RhilexResult<()> {
        def.validate()?;
        if let Some(id) = def.from_source.as_deref().filter(|s| !s.is_empty()) {
            if !self.sources.contains(id) {
                return Err(RhilexError::not_found("source", id));
            }
        }
        if let Some(id) = def.from_device.as_deref().filter(|s| !s.is_empty()) {
            if !self.devices.contains(id) {
                return Err(RhilexError::not_found("device", id));
            }
        }

        let vm = Arc::new(RuleVm::compile(&def, self.script_env())?);
        let entry = Arc::new(RuleEntry {
            status: Mutex::new(def.status),
            def,
            vm,
        });

        let old = {
            let mut rules = self.rules.write();
            match rules.iter_mut().find(|r| r.def.uuid == entry.def.uuid) {
                Some(slot) => Some(std::mem::replace(slot, Arc::clone(&entry))),
                None => {
                    rules.push(Arc::clone(&entry));
                    None
                },
            }
        };
        if let Some(old) = old {
            old.vm.stop();
            debug!("Rule {} replaced", entry.def.uuid);
        }
        info!("Rule loaded: {} ({})", entry.def.name, entry.def.uuid);
        Ok(())
    }

    pub fn get_rule(&self, id: &str) -> Option<Arc<RuleEntry>> {
        self.rules.read().iter().find(|r| r.def.uuid == id).cloned()
    }

    pub fn all_rules(&self) -> Vec<Arc<RuleEntry>> {
        self.rules.read().clone()
    }

    pub fn remove_rule(&self, id: &str) -> RhilexResult<()> {
        let removed = {
            let mut rules = self.rules.write();
            let pos = rules
                .iter()
                .position(|r| r.def.uuid == id)
                .ok_or_else(|| RhilexError::not_found("rule", id))?;
            rules.remove(pos)
        };
        removed.vm.stop();
        info!("Rule removed: {}", id);
        Ok(())
    }

    pub fn start_rule(&self, id: &str) -> RhilexResult<()> {
        self.set_rule_status(id, RuleStatus::Running)
    }

    pub fn stop_rule(&self, id: &str) -> RhilexResult<()> {
        self.set_rule_status(id, RuleStatus::Stop)
    }

    fn set_rule_status(&self, id: &str, status: RuleStatus) -> RhilexResult<()> {
        let rule = self
            .get_rule(id)
            .ok_or_else(|| RhilexError::not_found("rule", id))?;
        *rule.status.lock() = status;
        Ok(())
    }

    /// Running rules bound to `resource_id`, in registration order
    pub fn bound_rules(&self, kind: ResourceKind, resource_id: &str) -> Vec<Arc<RuleEntry>> {
        self.rules
            .read()
            .iter()
            .filter(|r| r.status() == RuleStatus::Running && r.bound_to(kind, resource_id))
            .cloned()
            .collect()
    }

    pub(crate) async fn run_source_callbacks(&self, source_id: &str, data: &str) {
        self.run_callbacks(ResourceKind::Source, source_id, data).await
    }

    pub(crate) async fn run_device_callbacks(&self, device_id: &str, data: &str) {
        self.run_callbacks(ResourceKind::Device, device_id, data).await
    }

    async fn run_callbacks(&self, kind: ResourceKind, resource_id: &str, data: &str) {
        for rule in self.bound_rules(kind, resource_id) {
            let vm = Arc::clone(&rule.vm);
            let payload = data.to_string();
            match tokio::task::spawn_blocking(move || vm.execute(&payload)).await {
                Ok(RuleOutcome::Success) => self.stats.inc_out(true),
                Ok(RuleOutcome::Failed(msg)) => {
                    debug!("Rule {} failed on {}: {}", rule.def.uuid, resource_id, msg);
                    self.stats.inc_out(false);
                },
                Ok(RuleOutcome::Stopped) => {},
                Err(e) => {
                    warn!("Rule {} panicked: {}", rule.def.uuid, e);
                    self.stats.inc_out(false);
                },
            }
        }
    }
}
