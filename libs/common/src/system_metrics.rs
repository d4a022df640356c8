//! Process and host metrics reported in the engine snapshot

use serde::Serialize;
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemMetrics {
    pub cpu_count: usize,
    /// Can exceed 100 on multi-core hosts
    pub process_cpu_percent: f32,
    /// Resident memory of this process, bytes
    pub process_memory: u64,
    /// Bytes
    pub memory_total: u64,
}

impl SystemMetrics {
    pub fn collect() -> Self {
        let mut sys = System::new();
        sys.refresh_memory();
        sys.refresh_cpu_usage();

        let pid = Pid::from_u32(std::process::id());
        sys.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[pid]),
            true,
            ProcessRefreshKind::new().with_cpu().with_memory(),
        );
        let (process_cpu_percent, process_memory) = sys
            .process(pid)
            .map(|p| (p.cpu_usage(), p.memory()))
            .unwrap_or((0.0, 0));

        Self {
            cpu_count: sys.cpus().len(),
            process_cpu_percent,
            process_memory,
            memory_total: sys.total_memory(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collect_sees_this_process() {
        let metrics = SystemMetrics::collect();
        assert!(metrics.memory_total > 0);
        assert!(metrics.process_memory > 0);
        assert!(metrics.process_memory <= metrics.memory_total);
    }
}
