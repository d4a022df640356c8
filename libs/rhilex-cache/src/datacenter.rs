//! In-memory data center backing the `rds` script namespace
//!
//! Each table is a ring of JSON rows bounded by `MaxLostCacheSize`; the
//! oldest row is evicted when the ring is full.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use errors::{RhilexError, RhilexResult};
use parking_lot::RwLock;
use serde_json::{Map, Value};

const RESERVED_FIELDS: [&str; 2] = ["id", "create_at"];

pub struct DataCenter {
    tables: DashMap<String, RwLock<VecDeque<Map<String, Value>>>>,
    max_rows: usize,
    next_id: AtomicU64,
}

impl DataCenter {
    pub fn new(max_rows: usize) -> Self {
        Self {
            tables: DashMap::new(),
            max_rows: max_rows.max(1),
            next_id: AtomicU64::new(1),
        }
    }

    /// Append a row, returning its id. `id` and `create_at` are assigned here.
    pub fn save(&self, table: &str, fields: Map<String, Value>) -> RhilexResult<u64> {
        if table.is_empty() {
            return Err(RhilexError::Validation("missing table name".to_string()));
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut row = Map::new();
        row.insert("id".to_string(), Value::from(id));
        row.insert(
            "create_at".to_string(),
            Value::from(common::time::now_ms()),
        );
        for (k, v) in fields {
            if !RESERVED_FIELDS.contains(&k.as_str()) {
                row.insert(k, v);
            }
        }

        let ring = self.tables.entry(table.to_string()).or_default();
        let mut rows = ring.write();
        if rows.len() >= self.max_rows {
            rows.pop_front();
        }
        rows.push_back(row);
        Ok(id)
    }

    /// Page through a table oldest-first; `page` starts at 1
    pub fn list(&self, table: &str, page: usize, size: usize) -> Vec<Value> {
        let Some(ring) = self.tables.get(table) else {
            return Vec::new();
        };
        let skip = page.saturating_sub(1) * size;
        let rows = ring.read();
        rows.iter()
            .skip(skip)
            .take(size)
            .cloned()
            .map(Value::Object)
            .collect()
    }

    pub fn last(&self, table: &str) -> Option<Value> {
        self.tables
            .get(table)
            .and_then(|ring| ring.read().back().cloned().map(Value::Object))
    }

    /// Merge `fields` into the newest row instead of appending
    pub fn update_last(&self, table: &str, fields: Map<String, Value>) -> RhilexResult<()> {
        let ring = self
            .tables
            .get(table)
            .ok_or_else(|| RhilexError::not_found("table", table))?;
        let mut rows = ring.write();
        let last = rows
            .back_mut()
            .ok_or_else(|| RhilexError::runtime(format!("table is empty:{}", table)))?;
        for (k, v) in fields {
            if !RESERVED_FIELDS.contains(&k.as_str()) {
                last.insert(k, v);
            }
        }
        Ok(())
    }

    pub fn count(&self, table: &str) -> usize {
        self.tables.get(table).map(|r| r.read().len()).unwrap_or(0)
    }

    pub fn tables(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tables.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fields(v: Value) -> Map<String, Value> {
        v.as_object().unwrap().clone()
    }

    #[test]
    fn test_save_assigns_reserved_fields() {
        let dc = DataCenter::new(10);
        let id = dc
            .save("meter", fields(json!({"id": 99, "kwh": 1.5})))
            .unwrap();
        let last = dc.last("meter").unwrap();
        assert_eq!(last["id"], json!(id));
        assert_eq!(last["kwh"], json!(1.5));
        assert!(last["create_at"].as_u64().unwrap() > 0);
    }

    #[test]
    fn test_ring_evicts_oldest() {
        let dc = DataCenter::new(2);
        for i in 0..3 {
            dc.save("t", fields(json!({"n": i}))).unwrap();
        }
        assert_eq!(dc.count("t"), 2);
        let rows = dc.list("t", 1, 10);
        assert_eq!(rows[0]["n"], json!(1));
        assert_eq!(rows[1]["n"], json!(2));
    }

    #[test]
    fn test_paging() {
        let dc = DataCenter::new(100);
        for i in 0..5 {
            dc.save("t", fields(json!({"n": i}))).unwrap();
        }
        let page2 = dc.list("t", 2, 2);
        assert_eq!(page2.len(), 2);
        assert_eq!(page2[0]["n"], json!(2));
        assert!(dc.list("missing", 1, 2).is_empty());
    }

    #[test]
    fn test_update_last() {
        let dc = DataCenter::new(10);
        assert!(dc.update_last("t", Map::new()).is_err());
        dc.save("t", fields(json!({"a": 1}))).unwrap();
        dc.update_last("t", fields(json!({"a": 2, "b": true}))).unwrap();
        let last = dc.last("t").unwrap();
        assert_eq!(last["a"], json!(2));
        assert_eq!(last["b"], json!(true));
        assert_eq!(dc.tables(), vec!["t"]);
    }
}
