//! `SQLite`-backed host key-value store.
//!
//! All values live in a single `kv` table. The store enforces the same
//! byte ceiling as the in-memory host so quota recovery behaves the same
//! on disk.

use crate::persistence::host::{entry_size, HostError, KeyValueHost, DEFAULT_CAPACITY_BYTES};
use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};

/// The database filename used inside a data directory.
pub const DATABASE_FILENAME: &str = "tasksync.sqlite3";

/// SQLite-based host store.
///
/// Each operation opens a new connection to the database file on Tokio's
/// blocking pool. This avoids sharing a non-`Sync` connection and is
/// acceptable for the low write rate the debounced gateway produces.
#[derive(Debug, Clone)]
pub struct SqliteHost {
    db_path: PathBuf,
    capacity: u64,
}

impl SqliteHost {
    /// Open (creating if needed) the store in `data_dir`.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be initialized.
    pub fn in_dir(data_dir: &Path) -> crate::Result<Self> {
        Self::with_path(data_dir.join(DATABASE_FILENAME), DEFAULT_CAPACITY_BYTES)
    }

    /// Open (creating if needed) the store at a specific database path.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be initialized.
    pub fn with_path(db_path: PathBuf, capacity: u64) -> crate::Result<Self> {
        let store = Self { db_path, capacity };
        store.init_schema()?;
        Ok(store)
    }

    /// Get the database path.
    #[must_use]
    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    fn open(&self) -> crate::Result<Connection> {
        if let Some(parent) = self.db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(&self.db_path)?;
        conn.execute_batch("PRAGMA journal_mode = WAL;")?;
        Ok(conn)
    }

    fn init_schema(&self) -> crate::Result<()> {
        let conn = self.open()?;
        conn.execute_batch(
            r"
            CREATE TABLE IF NOT EXISTS kv (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );
            ",
        )?;
        Ok(())
    }

    fn connect(&self) -> Result<Connection, HostError> {
        self.open().map_err(|e| HostError::Unavailable(e.to_string()))
    }

    /// Run a blocking database call off the async runtime.
    async fn blocking<T, F>(&self, call: F) -> Result<T, HostError>
    where
        T: Send + 'static,
        F: FnOnce(&Self) -> Result<T, HostError> + Send + 'static,
    {
        let host = self.clone();
        tokio::task::spawn_blocking(move || call(&host))
            .await
            .map_err(|e| HostError::Unavailable(format!("database task failed: {e}")))?
    }

    fn get_now(&self, key: &str) -> Result<Option<String>, HostError> {
        let conn = self.connect()?;
        conn.query_row("SELECT value FROM kv WHERE key = ?1", params![key], |row| row.get(0))
            .optional()
            .map_err(|e| unavailable(&e))
    }

    fn set_now(&self, key: &str, value: &str) -> Result<(), HostError> {
        let mut conn = self.connect()?;
        let tx = conn.transaction().map_err(|e| unavailable(&e))?;

        let others: i64 = tx
            .query_row(
                "SELECT COALESCE(SUM(LENGTH(CAST(key AS BLOB)) + LENGTH(CAST(value AS BLOB))), 0)
                 FROM kv WHERE key != ?1",
                params![key],
                |row| row.get(0),
            )
            .map_err(|e| unavailable(&e))?;
        let needed = u64::try_from(others).unwrap_or(0) + entry_size(key, value);
        if needed > self.capacity {
            return Err(HostError::QuotaExceeded { needed, capacity: self.capacity });
        }

        tx.execute(
            "INSERT INTO kv (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )
        .map_err(|e| unavailable(&e))?;
        tx.commit().map_err(|e| unavailable(&e))
    }

    fn remove_now(&self, key: &str) -> Result<(), HostError> {
        let conn = self.connect()?;
        conn.execute("DELETE FROM kv WHERE key = ?1", params![key]).map_err(|e| unavailable(&e))?;
        Ok(())
    }

    fn used_bytes_now(&self) -> Result<u64, HostError> {
        let conn = self.connect()?;
        let used: i64 = conn
            .query_row(
                "SELECT COALESCE(SUM(LENGTH(CAST(key AS BLOB)) + LENGTH(CAST(value AS BLOB))), 0)
                 FROM kv",
                [],
                |row| row.get(0),
            )
            .map_err(|e| unavailable(&e))?;
        Ok(u64::try_from(used).unwrap_or(0))
    }
}

fn unavailable(e: &rusqlite::Error) -> HostError {
    HostError::Unavailable(e.to_string())
}

#[async_trait]
impl KeyValueHost for SqliteHost {
    async fn get(&self, key: &str) -> Result<Option<String>, HostError> {
        let key = key.to_string();
        self.blocking(move |host| host.get_now(&key)).await
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), HostError> {
        let (key, value) = (key.to_string(), value.to_string());
        self.blocking(move |host| host.set_now(&key, &value)).await
    }

    async fn remove(&self, key: &str) -> Result<(), HostError> {
        let key = key.to_string();
        self.blocking(move |host| host.remove_now(&key)).await
    }

    async fn used_bytes(&self) -> Result<u64, HostError> {
        self.blocking(Self::used_bytes_now).await
    }

    fn capacity_bytes(&self) -> u64 {
        self.capacity
    }
}
