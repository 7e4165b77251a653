use std::sync::Arc;

use tracing::info;

use super::snapshot::ServiceImportSnapshot;
use crate::endpoints::EndpointWatcher;

/// Last-seen snapshots of deleted Headless imports whose cleanup has not
/// completed yet. Safe for concurrent get/put/delete.
#[derive(Clone, Default)]
pub struct DeletedImportCache(Arc<scc::HashMap<String, ServiceImportSnapshot>>);

impl DeletedImportCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or refresh the snapshot for `key`.
    pub fn store(&self, key: &str, snapshot: ServiceImportSnapshot) {
        let _ = self.0.upsert(key.to_string(), snapshot);
    }

    pub fn get(&self, key: &str) -> Option<ServiceImportSnapshot> {
        self.0.read(key, |_, v| v.clone())
    }

    pub fn take(&self, key: &str) -> Option<ServiceImportSnapshot> {
        self.0.remove(key).map(|(_, v)| v)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Live endpoint watchers keyed by import. At most one per key.
#[derive(Clone, Default)]
pub struct WatcherRegistry(Arc<scc::HashMap<String, Box<dyn EndpointWatcher>>>);

impl WatcherRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `watcher` unless `key` already has one, in which case the
    /// rejected watcher is handed back.
    pub fn insert(
        &self,
        key: &str,
        watcher: Box<dyn EndpointWatcher>,
    ) -> Result<(), Box<dyn EndpointWatcher>> {
        self.0
            .insert(key.to_string(), watcher)
            .map_err(|(_, rejected)| rejected)
    }

    pub fn remove(&self, key: &str) -> Option<Box<dyn EndpointWatcher>> {
        self.0.remove(key).map(|(_, w)| w)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains(key)
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys = Vec::with_capacity(self.0.len());
        self.0.scan(|k, _| keys.push(k.clone()));
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Stops and drops every registered watcher.
    pub fn stop_all(&self) {
        for key in self.keys() {
            if let Some(watcher) = self.remove(&key) {
                watcher.stop();
                info!(%key, "registry: endpoint watcher stopped");
            }
        }
    }
}
