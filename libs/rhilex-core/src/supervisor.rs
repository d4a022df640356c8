//! Per-resource cancellation handles

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use errors::{RhilexError, RhilexResult};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Cancellation handle held by one resource's supervisor task
#[derive(Debug, Clone)]
pub struct Supervisor {
    pub id: String,
    pub token: CancellationToken,
    /// Distinguishes successive registrations under the same id
    pub generation: u64,
}

/// Owns `resource id -> cancellation handle`; every handle is a child of the
/// admin's root token
#[derive(Debug)]
pub struct SupervisorAdmin {
    root: CancellationToken,
    supervisors: Mutex<HashMap<String, Supervisor>>,
    generation: AtomicU64,
}

impl SupervisorAdmin {
    pub fn new(root: CancellationToken) -> Self {
        Self {
            root,
            supervisors: Mutex::new(HashMap::new()),
            generation: AtomicU64::new(0),
        }
    }

    /// Issue a fresh handle for `id`, cancelling any previous one
    pub fn register(&self, id: &str) -> Supervisor {
        let mut map = self.supervisors.lock();
        if let Some(old) = map.remove(id) {
            debug!("Replacing supervisor {}", id);
            old.token.cancel();
        }
        let supervisor = Supervisor {
            id: id.to_string(),
            token: self.root.child_token(),
            generation: self.generation.fetch_add(1, Ordering::Relaxed) + 1,
        };
        map.insert(id.to_string(), supervisor.clone());
        supervisor
    }

    /// Cancel and forget the handle for `id`
    pub fn unregister(&self, id: &str) -> RhilexResult<()> {
        match self.supervisors.lock().remove(id) {
            Some(sv) => {
                sv.token.cancel();
                Ok(())
            },
            None => Err(RhilexError::SupervisorNotFound(id.to_string())),
        }
    }

    /// Cancel the handle for `id` but keep the entry
    pub fn stop_supervisor(&self, id: &str) -> RhilexResult<()> {
        match self.supervisors.lock().get(id) {
            Some(sv) => {
                sv.token.cancel();
                Ok(())
            },
            None => Err(RhilexError::SupervisorNotFound(id.to_string())),
        }
    }

    /// Remove `id` only while it is still the registration `generation`
    ///
    /// A supervisor task that exits after being replaced must not tear down
    /// its successor's entry.
    pub fn unregister_if_current(&self, id: &str, generation: u64) {
        let mut map = self.supervisors.lock();
        if map.get(id).is_some_and(|sv| sv.generation == generation) {
            if let Some(sv) = map.remove(id) {
                sv.token.cancel();
            }
        }
    }

    pub fn stop_all(&self) {
        for sv in self.supervisors.lock().values() {
            sv.token.cancel();
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.supervisors.lock().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.supervisors.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use super::*;

    #[test]
    fn test_register_cancels_previous_handle() {
        let admin = SupervisorAdmin::new(CancellationToken::new());
        let first = admin.register("d1");
        let second = admin.register("d1");
        assert!(first.token.is_cancelled());
        assert!(!second.token.is_cancelled());
        assert_eq!(admin.len(), 1);
    }

    #[test]
    fn test_unregister_unknown_fails() {
        let admin = SupervisorAdmin::new(CancellationToken::new());
        let err = admin.unregister("nope").unwrap_err();
        assert_eq!(err.to_string(), "supervisor with UUID nope not found");
        assert!(admin.stop_supervisor("nope").is_err());
    }

    #[test]
    fn test_stop_keeps_entry_unregister_removes() {
        let admin = SupervisorAdmin::new(CancellationToken::new());
        let sv = admin.register("d1");
        admin.stop_supervisor("d1").unwrap();
        assert!(sv.token.is_cancelled());
        assert!(admin.contains("d1"));
        admin.unregister("d1").unwrap();
        assert!(admin.is_empty());
    }

    #[test]
    fn test_stale_generation_does_not_remove_successor() {
        let admin = SupervisorAdmin::new(CancellationToken::new());
        let old = admin.register("d1");
        let new = admin.register("d1");
        admin.unregister_if_current("d1", old.generation);
        assert!(admin.contains("d1"));
        admin.unregister_if_current("d1", new.generation);
        assert!(!admin.contains("d1"));
    }

    #[test]
    fn test_root_and_stop_all_cancel_children() {
        let root = CancellationToken::new();
        let admin = SupervisorAdmin::new(root.clone());
        let a = admin.register("a");
        let b = admin.register("b");
        admin.stop_all();
        assert!(a.token.is_cancelled() && b.token.is_cancelled());

        let c = admin.register("c");
        root.cancel();
        assert!(c.token.is_cancelled());
    }
}
