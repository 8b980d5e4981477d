//! # SQLite Backend
//!
//! Durable storage engine. All namespaces share one `kv_entries` table in
//! `.hive/hive.db`; values and metadata are JSON text, timestamps are epoch
//! milliseconds.

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use super::{StorageBackend, StoreEntry, StoreError};

/// Schema version for migrations
const SCHEMA_VERSION: i32 = 1;

const SELECT_COLUMNS: &str =
    "namespace, key, value, metadata, created_at, updated_at, expires_at";

/// SQLite-backed storage engine
pub struct SqliteBackend {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteBackend {
    /// Open database at a specific path (useful for testing)
    pub fn open_at<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path.as_ref())?;
        Self::from_connection(conn)
    }

    /// Private in-memory SQLite database (durable engine, volatile file)
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, StoreError> {
        let backend = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        backend.run_migrations()?;
        Ok(backend)
    }

    /// Get a shared connection for use by other modules
    pub fn connection(&self) -> Arc<Mutex<Connection>> {
        Arc::clone(&self.conn)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn
            .lock()
            .map_err(|e| StoreError::LockPoisoned(e.to_string()))
    }

    /// Run schema migrations
    fn run_migrations(&self) -> Result<(), StoreError> {
        let conn = self.lock()?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER PRIMARY KEY)",
            [],
        )?;

        let current_version: i32 = conn.query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )?;

        if current_version < 1 {
            Self::migrate_v1(&conn)?;
            conn.execute(
                "INSERT OR REPLACE INTO schema_version (version) VALUES (?1)",
                [1],
            )?;
        }

        Ok(())
    }

    /// Migration to version 1 - key-value table
    fn migrate_v1(conn: &Connection) -> Result<(), StoreError> {
        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS kv_entries (
                namespace TEXT NOT NULL,
                key TEXT NOT NULL,
                value TEXT NOT NULL,
                metadata TEXT,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                expires_at INTEGER,
                PRIMARY KEY (namespace, key)
            )
            "#,
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_kv_expires ON kv_entries(expires_at)",
            [],
        )?;

        tracing::info!("Hive store initialized with schema version {}", SCHEMA_VERSION);

        Ok(())
    }

    fn row_to_entry(row: &rusqlite::Row) -> rusqlite::Result<(StoreEntry, String, Option<String>)> {
        let value_json: String = row.get(2)?;
        let metadata_json: Option<String> = row.get(3)?;

        let entry = StoreEntry {
            namespace: row.get(0)?,
            key: row.get(1)?,
            value: serde_json::Value::Null,
            metadata: None,
            created_at: millis_to_datetime(row.get(4)?),
            updated_at: millis_to_datetime(row.get(5)?),
            expires_at: row.get::<_, Option<i64>>(6)?.map(millis_to_datetime),
        };

        Ok((entry, value_json, metadata_json))
    }

    fn decode(
        (mut entry, value_json, metadata_json): (StoreEntry, String, Option<String>),
    ) -> Result<StoreEntry, StoreError> {
        entry.value = serde_json::from_str(&value_json)?;
        entry.metadata = metadata_json
            .map(|m| serde_json::from_str(&m))
            .transpose()?;
        Ok(entry)
    }
}

impl StorageBackend for SqliteBackend {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    fn is_durable(&self) -> bool {
        true
    }

    fn put(&self, entry: StoreEntry) -> Result<(), StoreError> {
        let value_json = serde_json::to_string(&entry.value)?;
        let metadata_json = entry
            .metadata
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        let conn = self.lock()?;
        conn.execute(
            r#"
            INSERT INTO kv_entries (namespace, key, value, metadata, created_at, updated_at, expires_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT(namespace, key) DO UPDATE SET
                value = ?3,
                metadata = ?4,
                updated_at = ?6,
                expires_at = ?7
            "#,
            params![
                entry.namespace,
                entry.key,
                value_json,
                metadata_json,
                entry.created_at.timestamp_millis(),
                entry.updated_at.timestamp_millis(),
                entry.expires_at.map(|t| t.timestamp_millis()),
            ],
        )?;

        Ok(())
    }

    fn fetch(&self, namespace: &str, key: &str) -> Result<Option<StoreEntry>, StoreError> {
        let conn = self.lock()?;
        let raw = conn
            .query_row(
                &format!(
                    "SELECT {} FROM kv_entries WHERE namespace = ?1 AND key = ?2",
                    SELECT_COLUMNS
                ),
                params![namespace, key],
                Self::row_to_entry,
            )
            .optional()?;

        raw.map(Self::decode).transpose()
    }

    fn remove(&self, namespace: &str, key: &str) -> Result<bool, StoreError> {
        let conn = self.lock()?;
        let affected = conn.execute(
            "DELETE FROM kv_entries WHERE namespace = ?1 AND key = ?2",
            params![namespace, key],
        )?;
        Ok(affected > 0)
    }

    fn remove_if_expired(
        &self,
        namespace: &str,
        key: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let conn = self.lock()?;
        let affected = conn.execute(
            "DELETE FROM kv_entries
             WHERE namespace = ?1 AND key = ?2 AND expires_at IS NOT NULL AND expires_at <= ?3",
            params![namespace, key, now.timestamp_millis()],
        )?;
        Ok(affected > 0)
    }

    fn entries(&self, namespace: &str) -> Result<Vec<StoreEntry>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM kv_entries WHERE namespace = ?1 ORDER BY key",
            SELECT_COLUMNS
        ))?;

        let rows = stmt
            .query_map(params![namespace], Self::row_to_entry)?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter().map(Self::decode).collect()
    }

    fn clear_namespace(&self, namespace: &str) -> Result<usize, StoreError> {
        let conn = self.lock()?;
        let affected = conn.execute(
            "DELETE FROM kv_entries WHERE namespace = ?1",
            params![namespace],
        )?;
        Ok(affected)
    }

    fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let conn = self.lock()?;
        let affected = conn.execute(
            "DELETE FROM kv_entries WHERE expires_at IS NOT NULL AND expires_at <= ?1",
            params![now.timestamp_millis()],
        )?;
        Ok(affected)
    }

    fn namespaces(&self) -> Result<Vec<String>, StoreError> {
        let conn = self.lock()?;
        let mut stmt =
            conn.prepare("SELECT DISTINCT namespace FROM kv_entries ORDER BY namespace")?;
        let namespaces = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(namespaces)
    }
}

fn millis_to_datetime(millis: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .unwrap_or_else(Utc::now)
}
