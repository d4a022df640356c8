//! Shared key/value store backing the `kv` script namespace
//!
//! Bounded by entry count. Entries may carry a TTL; expired entries vanish on
//! read and are swept periodically.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use errors::{RhilexError, RhilexResult};
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|t| now >= t)
    }
}

#[derive(Default)]
struct Inner {
    items: HashMap<String, Entry>,
    // insertion order for fuzzy lookups
    order: Vec<String>,
}

pub struct KvStore {
    inner: RwLock<Inner>,
    max_size: usize,
}

impl KvStore {
    pub fn new(max_size: usize) -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            max_size,
        }
    }

    fn insert(&self, key: &str, value: &str, expires_at: Option<Instant>) -> RhilexResult<()> {
        let mut inner = self.inner.write();
        let now = Instant::now();
        if !inner.items.contains_key(key) {
            let live = inner.items.values().filter(|e| !e.expired(now)).count();
            if live + 1 > self.max_size {
                error!("Max store size reached: {}", live);
                return Err(RhilexError::StoreFull);
            }
            inner.order.push(key.to_string());
        }
        inner.items.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at,
            },
        );
        Ok(())
    }

    pub fn set(&self, key: &str, value: &str) -> RhilexResult<()> {
        self.insert(key, value, None)
    }

    pub fn set_with_duration(&self, key: &str, value: &str, ttl: Duration) -> RhilexResult<()> {
        self.insert(key, value, Some(Instant::now() + ttl))
    }

    /// Value for `key`, empty string when missing or expired
    pub fn get(&self, key: &str) -> String {
        let now = Instant::now();
        {
            let inner = self.inner.read();
            match inner.items.get(key) {
                Some(entry) if !entry.expired(now) => return entry.value.clone(),
                Some(_) => {},
                None => return String::new(),
            }
        }
        self.delete(key);
        String::new()
    }

    pub fn delete(&self, key: &str) {
        let mut inner = self.inner.write();
        if inner.items.remove(key).is_some() {
            inner.order.retain(|k| k != key);
        }
    }

    pub fn count(&self) -> usize {
        let now = Instant::now();
        self.inner
            .read()
            .items
            .values()
            .filter(|e| !e.expired(now))
            .count()
    }

    /// First live value whose key matches `pattern`
    ///
    /// `abc*` matches by prefix, `*abc` by suffix, anything else by
    /// case-insensitive substring.
    pub fn fuzzy_get(&self, pattern: &str) -> String {
        let pattern = pattern.to_lowercase();
        let matcher: Box<dyn Fn(&str) -> bool> = if let Some(p) = pattern.strip_suffix('*') {
            let p = p.to_string();
            Box::new(move |k: &str| k.starts_with(&p))
        } else if let Some(p) = pattern.strip_prefix('*') {
            let p = p.to_string();
            Box::new(move |k: &str| k.ends_with(&p))
        } else {
            let p = pattern.clone();
            Box::new(move |k: &str| k.contains(&p))
        };

        let now = Instant::now();
        let inner = self.inner.read();
        inner
            .order
            .iter()
            .filter(|k| matcher(&k.to_lowercase()))
            .filter_map(|k| inner.items.get(k))
            .find(|e| !e.expired(now))
            .map(|e| e.value.clone())
            .unwrap_or_default()
    }

    /// Remove expired entries, returning how many were dropped
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut inner = self.inner.write();
        let before = inner.items.len();
        inner.items.retain(|_, e| !e.expired(now));
        let Inner { items, order } = &mut *inner;
        order.retain(|k| items.contains_key(k));
        before - inner.items.len()
    }

    /// Periodic sweeper bound to `token`
    pub fn start_sweeper(self: &Arc<Self>, interval: Duration, token: CancellationToken) {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let dropped = store.sweep();
                        if dropped > 0 {
                            debug!("kv sweeper removed {} expired entries", dropped);
                        }
                    }
                }
            }
        });
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use super::*;

    #[test]
    fn test_set_get_delete() {
        let kv = KvStore::new(8);
        kv.set("k1", "v1").unwrap();
        assert_eq!(kv.get("k1"), "v1");
        assert_eq!(kv.get("missing"), "");
        kv.delete("k1");
        assert_eq!(kv.count(), 0);
    }

    #[test]
    fn test_max_size_rejects_new_keys_only() {
        let kv = KvStore::new(2);
        kv.set("a", "1").unwrap();
        kv.set("b", "2").unwrap();
        let err = kv.set("c", "3").unwrap_err();
        assert_eq!(err.to_string(), "max store size reached");
        // overwriting an existing key is allowed
        kv.set("a", "10").unwrap();
        assert_eq!(kv.get("a"), "10");
    }

    #[test]
    fn test_ttl_expiry_and_sweep() {
        let kv = KvStore::new(8);
        kv.set_with_duration("tmp", "x", Duration::from_millis(10)).unwrap();
        kv.set("keep", "y").unwrap();
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(kv.count(), 1);
        assert_eq!(kv.sweep(), 1);
        assert_eq!(kv.get("tmp"), "");
        assert_eq!(kv.get("keep"), "y");
    }

    #[test]
    fn test_fuzzy_get() {
        let kv = KvStore::new(8);
        kv.set("Sensor.Temp", "21").unwrap();
        kv.set("sensor.hum", "40").unwrap();
        assert_eq!(kv.fuzzy_get("sensor*"), "21");
        assert_eq!(kv.fuzzy_get("*hum"), "40");
        assert_eq!(kv.fuzzy_get("TEMP"), "21");
        assert_eq!(kv.fuzzy_get("pressure"), "");
    }

    #[tokio::test]
    async fn test_sweeper_task_stops_on_cancel() {
        let kv = Arc::new(KvStore::new(8));
        let token = CancellationToken::new();
        kv.set_with_duration("t", "v", Duration::from_millis(5)).unwrap();
        kv.start_sweeper(Duration::from_millis(10), token.clone());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(kv.inner.read().items.len(), 0);
        token.cancel();
    }
}
