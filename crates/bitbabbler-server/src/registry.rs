//! Maps source identities to the live `HealthMonitor` handles the control
//! socket snapshots for `GetIDs`/`ReportStats`/`GetRawData`. Built once at
//! startup from the spawned workers and shared read-only across
//! connection threads.

use std::collections::BTreeMap;

use bitbabbler_core::SharedHealthMonitor;

/// One registered acquisition source, keyed by the identity string it was
/// configured or enumerated with (a device serial, or a group id).
pub struct SourceRegistry {
    sources: BTreeMap<String, SharedHealthMonitor>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self { sources: BTreeMap::new() }
    }

    pub fn register(&mut self, id: impl Into<String>, monitor: SharedHealthMonitor) {
        self.sources.insert(id.into(), monitor);
    }

    pub fn ids(&self) -> Vec<String> {
        self.sources.keys().cloned().collect()
    }

    pub fn get(&self, id: &str) -> Option<&SharedHealthMonitor> {
        self.sources.get(id)
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }
}

impl Default for SourceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitbabbler_core::HealthMonitor;
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[test]
    fn ids_are_returned_sorted() {
        let mut registry = SourceRegistry::new();
        registry.register("S-2", Arc::new(Mutex::new(HealthMonitor::new(1_000_000))));
        registry.register("S-1", Arc::new(Mutex::new(HealthMonitor::new(1_000_000))));
        assert_eq!(registry.ids(), vec!["S-1".to_owned(), "S-2".to_owned()]);
    }

    #[test]
    fn unknown_id_returns_none() {
        let registry = SourceRegistry::new();
        assert!(registry.get("nope").is_none());
    }
}
