//! # Memory Backend
//!
//! Volatile storage engine with the same contract as [`SqliteBackend`](super::SqliteBackend).
//! Used when configured explicitly or when the durable engine cannot open.

use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use super::{StorageBackend, StoreEntry, StoreError};

type Namespaces = HashMap<String, BTreeMap<String, StoreEntry>>;

/// In-process map keyed by namespace, then key
#[derive(Default)]
pub struct MemoryBackend {
    data: Mutex<Namespaces>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Namespaces>, StoreError> {
        self.data
            .lock()
            .map_err(|e| StoreError::LockPoisoned(e.to_string()))
    }
}

impl StorageBackend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn is_durable(&self) -> bool {
        false
    }

    fn put(&self, mut entry: StoreEntry) -> Result<(), StoreError> {
        let mut data = self.lock()?;
        let namespace = data.entry(entry.namespace.clone()).or_default();
        if let Some(existing) = namespace.get(&entry.key) {
            entry.created_at = existing.created_at;
        }
        namespace.insert(entry.key.clone(), entry);
        Ok(())
    }

    fn fetch(&self, namespace: &str, key: &str) -> Result<Option<StoreEntry>, StoreError> {
        let data = self.lock()?;
        Ok(data.get(namespace).and_then(|ns| ns.get(key)).cloned())
    }

    fn remove(&self, namespace: &str, key: &str) -> Result<bool, StoreError> {
        let mut data = self.lock()?;
        let Some(ns) = data.get_mut(namespace) else {
            return Ok(false);
        };
        let removed = ns.remove(key).is_some();
        if ns.is_empty() {
            data.remove(namespace);
        }
        Ok(removed)
    }

    fn remove_if_expired(
        &self,
        namespace: &str,
        key: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut data = self.lock()?;
        let Some(ns) = data.get_mut(namespace) else {
            return Ok(false);
        };
        if !ns.get(key).is_some_and(|entry| entry.is_expired(now)) {
            return Ok(false);
        }
        ns.remove(key);
        if ns.is_empty() {
            data.remove(namespace);
        }
        Ok(true)
    }

    fn entries(&self, namespace: &str) -> Result<Vec<StoreEntry>, StoreError> {
        let data = self.lock()?;
        Ok(data
            .get(namespace)
            .map(|ns| ns.values().cloned().collect())
            .unwrap_or_default())
    }

    fn clear_namespace(&self, namespace: &str) -> Result<usize, StoreError> {
        let mut data = self.lock()?;
        Ok(data.remove(namespace).map(|ns| ns.len()).unwrap_or(0))
    }

    fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let mut data = self.lock()?;
        let mut purged = 0;
        for ns in data.values_mut() {
            let before = ns.len();
            ns.retain(|_, entry| !entry.is_expired(now));
            purged += before - ns.len();
        }
        data.retain(|_, ns| !ns.is_empty());
        Ok(purged)
    }

    fn namespaces(&self) -> Result<Vec<String>, StoreError> {
        let data = self.lock()?;
        let mut names: Vec<String> = data.keys().cloned().collect();
        names.sort();
        Ok(names)
    }
}
