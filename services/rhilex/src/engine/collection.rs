//! Ordered resource collections

use std::sync::Arc;

use parking_lot::RwLock;
use rhilex_core::{ResourceDef, ResourceState, XStatus};

pub struct Entry<T: ?Sized> {
    pub def: ResourceDef,
    pub instance: Arc<T>,
}

impl<T: ?Sized> Clone for Entry<T> {
    fn clone(&self) -> Self {
        Self {
            def: self.def.clone(),
            instance: Arc::clone(&self.instance),
        }
    }
}

/// Resources of one kind in load order; a single lock guards writes
pub struct Collection<T: ?Sized> {
    entries: RwLock<Vec<Entry<T>>>,
}

impl<T: ?Sized + XStatus> Collection<T> {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
        }
    }

    /// Store `instance` under `def.uuid`, replacing in place when present
    pub fn insert(&self, def: ResourceDef, instance: Arc<T>) -> Option<Entry<T>> {
        let mut entries = self.entries.write();
        let entry = Entry { def, instance };
        match entries.iter_mut().find(|e| e.def.uuid == entry.def.uuid) {
            Some(slot) => Some(std::mem::replace(slot, entry)),
            None => {
                entries.push(entry);
                None
            },
        }
    }

    pub fn get(&self, id: &str) -> Option<Arc<T>> {
        self.entries
            .read()
            .iter()
            .find(|e| e.def.uuid == id)
            .map(|e| Arc::clone(&e.instance))
    }

    pub fn entry(&self, id: &str) -> Option<Entry<T>> {
        self.entries.read().iter().find(|e| e.def.uuid == id).cloned()
    }

    pub fn def(&self, id: &str) -> Option<ResourceDef> {
        self.entries
            .read()
            .iter()
            .find(|e| e.def.uuid == id)
            .map(|e| e.def.clone())
    }

    pub fn status(&self, id: &str) -> Option<ResourceState> {
        self.get(id).map(|r| r.status())
    }

    pub fn remove(&self, id: &str) -> Option<Entry<T>> {
        let mut entries = self.entries.write();
        let pos = entries.iter().position(|e| e.def.uuid == id)?;
        Some(entries.remove(pos))
    }

    /// Remove `id` only while it still holds `instance`
    pub fn remove_if_same(&self, id: &str, instance: &Arc<T>) -> bool {
        let mut entries = self.entries.write();
        match entries
            .iter()
            .position(|e| e.def.uuid == id && Arc::ptr_eq(&e.instance, instance))
        {
            Some(pos) => {
                entries.remove(pos);
                true
            },
            None => false,
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.read().iter().any(|e| e.def.uuid == id)
    }

    pub fn all(&self) -> Vec<Entry<T>> {
        self.entries.read().clone()
    }

    pub fn drain(&self) -> Vec<Entry<T>> {
        std::mem::take(&mut *self.entries.write())
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl<T: ?Sized + XStatus> Default for Collection<T> {
    fn default() -> Self {
        Self::new()
    }
}
