//! # Store Facade
//!
//! Typed, TTL-aware access to a [`StorageBackend`]. Expiry is lazy: an entry
//! past its deadline is deleted when a read touches it, or by the maintenance
//! sweep ([`Store::purge_expired`], [`Store::spawn_sweeper`]).

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use super::{MemoryBackend, SqliteBackend, StorageBackend, StoreEntry, StoreError};
use crate::config::{BackendKind, StoreConfig};

/// Options for [`Store::set`]
#[derive(Debug, Clone, Default)]
pub struct SetOptions {
    /// Lifetime measured from the write
    pub ttl: Option<Duration>,
    /// Free-form metadata stored beside the value
    pub metadata: Option<Value>,
}

impl SetOptions {
    pub fn ttl(ttl: Duration) -> Self {
        Self {
            ttl: Some(ttl),
            metadata: None,
        }
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// Namespaced key-value store shared by the bus and the state machines
#[derive(Clone)]
pub struct Store {
    backend: Arc<dyn StorageBackend>,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("backend", &self.backend.name())
            .finish()
    }
}

impl Store {
    /// Open the backend selected by `config`.
    ///
    /// A SQLite engine that fails to open degrades to the memory backend with
    /// a warning; callers keep the same contract with weaker crash guarantees.
    pub fn open(config: &StoreConfig) -> Self {
        match config.backend {
            BackendKind::Memory => Self::memory(),
            BackendKind::Sqlite => match SqliteBackend::open_at(&config.path) {
                Ok(backend) => {
                    tracing::debug!(path = %config.path.display(), "Durable store opened");
                    Self::with_backend(Arc::new(backend))
                }
                Err(e) => {
                    tracing::warn!(
                        path = %config.path.display(),
                        "Durable store unavailable, falling back to volatile memory: {}",
                        e
                    );
                    Self::memory()
                }
            },
        }
    }

    /// Volatile store
    pub fn memory() -> Self {
        Self::with_backend(Arc::new(MemoryBackend::new()))
    }

    pub fn with_backend(backend: Arc<dyn StorageBackend>) -> Self {
        Self { backend }
    }

    /// Whether writes survive a restart
    pub fn is_durable(&self) -> bool {
        self.backend.is_durable()
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// Upsert `value` under `(namespace, key)`. Last write wins.
    pub fn set<T: Serialize + ?Sized>(
        &self,
        namespace: &str,
        key: &str,
        value: &T,
        options: SetOptions,
    ) -> Result<(), StoreError> {
        let now = Utc::now();
        let expires_at = options.ttl.and_then(|ttl| expiry_after(now, ttl));

        self.backend.put(StoreEntry {
            namespace: namespace.to_string(),
            key: key.to_string(),
            value: serde_json::to_value(value)?,
            metadata: options.metadata,
            created_at: now,
            updated_at: now,
            expires_at,
        })
    }

    /// Read and decode a value; `None` if absent or expired
    pub fn get<T: DeserializeOwned>(
        &self,
        namespace: &str,
        key: &str,
    ) -> Result<Option<T>, StoreError> {
        match self.get_value(namespace, key)? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    /// Read the raw JSON value; `None` if absent or expired
    pub fn get_value(&self, namespace: &str, key: &str) -> Result<Option<Value>, StoreError> {
        Ok(self.get_entry(namespace, key)?.map(|entry| entry.value))
    }

    /// Read the full entry, deleting it if it has expired
    pub fn get_entry(&self, namespace: &str, key: &str) -> Result<Option<StoreEntry>, StoreError> {
        let Some(entry) = self.backend.fetch(namespace, key)? else {
            return Ok(None);
        };

        let now = Utc::now();
        if entry.is_expired(now) {
            if self.backend.remove_if_expired(namespace, key, now)? {
                tracing::trace!(namespace, key, "Expired entry removed on read");
            }
            return Ok(None);
        }

        Ok(Some(entry))
    }

    /// Returns whether an entry was removed
    pub fn delete(&self, namespace: &str, key: &str) -> Result<bool, StoreError> {
        self.backend.remove(namespace, key)
    }

    pub fn has(&self, namespace: &str, key: &str) -> Result<bool, StoreError> {
        Ok(self.get_entry(namespace, key)?.is_some())
    }

    /// Live keys of a namespace, sorted
    pub fn keys(&self, namespace: &str) -> Result<Vec<String>, StoreError> {
        Ok(self
            .live_entries(namespace)?
            .into_iter()
            .map(|entry| entry.key)
            .collect())
    }

    /// Every live `key -> value` pair of a namespace
    pub fn get_all(&self, namespace: &str) -> Result<HashMap<String, Value>, StoreError> {
        Ok(self
            .live_entries(namespace)?
            .into_iter()
            .map(|entry| (entry.key, entry.value))
            .collect())
    }

    /// Every live entry of a namespace, sorted by key
    pub fn entries(&self, namespace: &str) -> Result<Vec<StoreEntry>, StoreError> {
        self.live_entries(namespace)
    }

    pub fn count(&self, namespace: &str) -> Result<usize, StoreError> {
        Ok(self.live_entries(namespace)?.len())
    }

    /// Returns the number of removed entries
    pub fn clear_namespace(&self, namespace: &str) -> Result<usize, StoreError> {
        let removed = self.backend.clear_namespace(namespace)?;
        tracing::debug!(namespace, removed, "Namespace cleared");
        Ok(removed)
    }

    pub fn namespaces(&self) -> Result<Vec<String>, StoreError> {
        self.backend.namespaces()
    }

    /// Maintenance sweep: delete every expired entry in every namespace
    pub fn purge_expired(&self) -> Result<usize, StoreError> {
        let purged = self.backend.purge_expired(Utc::now())?;
        if purged > 0 {
            tracing::debug!(purged, "Expired entries purged");
        }
        Ok(purged)
    }

    /// Run [`Store::purge_expired`] every `interval` until the task is aborted
    pub fn spawn_sweeper(&self, interval: Duration) -> JoinHandle<()> {
        let store = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if let Err(e) = store.purge_expired() {
                    tracing::error!("Expired-entry sweep failed: {}", e);
                }
            }
        })
    }

    fn live_entries(&self, namespace: &str) -> Result<Vec<StoreEntry>, StoreError> {
        let now = Utc::now();
        let (live, expired): (Vec<_>, Vec<_>) = self
            .backend
            .entries(namespace)?
            .into_iter()
            .partition(|entry| !entry.is_expired(now));

        for entry in expired {
            self.backend.remove_if_expired(namespace, &entry.key, now)?;
        }

        Ok(live)
    }
}

/// Deadline `ttl` after `now`. A TTL past the representable range means the
/// entry never expires.
fn expiry_after(now: DateTime<Utc>, ttl: Duration) -> Option<DateTime<Utc>> {
    let deadline = chrono::Duration::from_std(ttl)
        .ok()
        .and_then(|ttl| now.checked_add_signed(ttl));
    if deadline.is_none() {
        tracing::debug!(?ttl, "TTL out of range, entry will not expire");
    }
    deadline
}
