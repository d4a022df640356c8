//! Live state dump for telemetry

use common::SystemMetrics;
use serde_json::{json, Value};

use rhilex_core::ResourceDef;

use super::collection::Entry;
use super::{RuleEngine, VERSION};

fn describe<T: ?Sized + rhilex_core::XStatus>(entry: &Entry<T>) -> Value {
    let ResourceDef {
        uuid,
        name,
        type_tag,
        description,
        ..
    } = &entry.def;
    json!({
        "uuid": uuid,
        "name": name,
        "type": type_tag,
        "description": description,
        "state": entry.instance.status(),
    })
}

impl RuleEngine {
    pub fn snapshot_dump(&self) -> Value {
        let rules: Vec<Value> = self
            .all_rules()
            .iter()
            .map(|r| {
                json!({
                    "uuid": r.def.uuid,
                    "name": r.def.name,
                    "fromSource": r.def.from_source,
                    "fromDevice": r.def.from_device,
                    "status": r.status(),
                })
            })
            .collect();

        let metrics = SystemMetrics::collect();
        json!({
            "rules": rules,
            "plugins": self.plugins.metas(),
            "inends": self.sources.all().iter().map(describe).collect::<Vec<_>>(),
            "outends": self.targets.all().iter().map(describe).collect::<Vec<_>>(),
            "devices": self.devices.all().iter().map(describe).collect::<Vec<_>>(),
            "cecollas": self.cecollas.all().iter().map(describe).collect::<Vec<_>>(),
            "statistics": self.stats.snapshot(),
            "system": {
                "version": VERSION,
                "osArch": format!("{}-{}", std::env::consts::OS, std::env::consts::ARCH),
                "memory": metrics.process_memory,
                "totalMemory": metrics.memory_total,
                "cpus": metrics.cpu_count,
            },
            "config": &*self.runtime.config,
        })
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use std::sync::Arc;

    use rhilex_core::RuntimeContext;

    use crate::store::MemoryStore;
    use crate::RuleEngine;

    #[tokio::test]
    async fn test_snapshot_reports_process_memory() {
        let runtime = RuntimeContext::new(common::RhilexConfig::default());
        let engine = RuleEngine::new(runtime, Arc::new(MemoryStore::new()));
        let dump = engine.snapshot_dump();
        assert!(dump["system"]["memory"].as_u64().unwrap() > 0);
        assert!(dump["system"]["totalMemory"].as_u64().unwrap() > 0);
        assert_eq!(dump["system"]["version"], super::VERSION);
        assert!(dump["rules"].as_array().unwrap().is_empty());
    }
}
