//! Per-engine map of host name to connection manager.

use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use super::connection::ConnectionManager;

/// Lock-free map of managed hosts, keyed by host name.
#[derive(Default)]
pub struct HostRegistry {
    managers: DashMap<String, Arc<ConnectionManager>>,
}

impl HostRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `manager` unless its host name is taken; returns the manager
    /// now registered under that name.
    pub fn insert(&self, manager: Arc<ConnectionManager>) -> Arc<ConnectionManager> {
        match self.managers.entry(manager.host().name.clone()) {
            Entry::Occupied(existing) => Arc::clone(existing.get()),
            Entry::Vacant(slot) => Arc::clone(slot.insert(manager).value()),
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<ConnectionManager>> {
        self.managers.get(name).map(|m| Arc::clone(m.value()))
    }

    pub fn remove(&self, name: &str) -> Option<Arc<ConnectionManager>> {
        self.managers.remove(name).map(|(_, m)| m)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.managers.iter().map(|m| m.key().clone()).collect();
        names.sort();
        names
    }

    pub fn all(&self) -> Vec<Arc<ConnectionManager>> {
        self.managers.iter().map(|m| Arc::clone(m.value())).collect()
    }

    pub fn len(&self) -> usize {
        self.managers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.managers.is_empty()
    }
}
