//! Pipeline counters

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// `in*` count queue admissions, `out*` count rule outcomes
#[derive(Debug, Default)]
pub struct Statistics {
    in_success: AtomicU64,
    in_failed: AtomicU64,
    out_success: AtomicU64,
    out_failed: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatisticsSnapshot {
    pub in_success: u64,
    pub in_failed: u64,
    pub out_success: u64,
    pub out_failed: u64,
}

impl Statistics {
    pub fn inc_in(&self, ok: bool) {
        let counter = if ok { &self.in_success } else { &self.in_failed };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_out(&self, ok: bool) {
        let counter = if ok { &self.out_success } else { &self.out_failed };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatisticsSnapshot {
        StatisticsSnapshot {
            in_success: self.in_success.load(Ordering::Relaxed),
            in_failed: self.in_failed.load(Ordering::Relaxed),
            out_success: self.out_success.load(Ordering::Relaxed),
            out_failed: self.out_failed.load(Ordering::Relaxed),
        }
    }
}
