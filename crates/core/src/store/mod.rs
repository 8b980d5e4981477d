//! # Durable Store
//!
//! Namespaced key-value persistence with per-entry expiry. Backs the bus
//! (crash-recoverable messages) and the state machines (last known state).
//!
//! ## Architecture
//!
//! ```text
//!            Store (typed facade, lazy TTL)
//!                       ↓
//!              dyn StorageBackend
//!                       ↓
//!   SqliteBackend (durable) or MemoryBackend (volatile)
//! ```
//!
//! The backend is chosen by [`StoreConfig`](crate::config::StoreConfig). If the
//! SQLite engine cannot be opened the store logs a warning and degrades to the
//! memory backend; the contract seen by callers does not change.

pub mod db;
pub mod error;
pub mod kv;
pub mod memory;

pub use db::SqliteBackend;
pub use error::StoreError;
pub use kv::{SetOptions, Store};
pub use memory::MemoryBackend;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One stored value, unique by `(namespace, key)`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StoreEntry {
    pub namespace: String,
    pub key: String,
    pub value: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl StoreEntry {
    /// Whether the entry is past its expiry at `now`
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Storage engine behind a [`Store`].
///
/// Every method is individually atomic; there are no cross-key transactions.
/// Backends do not evaluate expiry on reads, the [`Store`] facade does.
pub trait StorageBackend: Send + Sync {
    /// Short engine name for logs and stats
    fn name(&self) -> &'static str;

    /// Whether writes survive a process restart
    fn is_durable(&self) -> bool;

    /// Upsert an entry. An existing row keeps its `created_at`.
    fn put(&self, entry: StoreEntry) -> Result<(), StoreError>;

    fn fetch(&self, namespace: &str, key: &str) -> Result<Option<StoreEntry>, StoreError>;

    /// Returns whether a row was removed
    fn remove(&self, namespace: &str, key: &str) -> Result<bool, StoreError>;

    /// Remove the entry only if it is expired at `now`, checked and deleted
    /// atomically so a concurrent fresh write survives. Returns whether a row
    /// was removed.
    fn remove_if_expired(
        &self,
        namespace: &str,
        key: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// All entries of a namespace ordered by key, expired ones included
    fn entries(&self, namespace: &str) -> Result<Vec<StoreEntry>, StoreError>;

    /// Returns the number of removed rows
    fn clear_namespace(&self, namespace: &str) -> Result<usize, StoreError>;

    /// Delete every entry whose expiry is at or before `now`
    fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize, StoreError>;

    fn namespaces(&self) -> Result<Vec<String>, StoreError>;
}
