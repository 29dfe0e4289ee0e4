//! Durable key/value object store.
//!
//! Checkpoints, work list snapshots and classification records are stored
//! as opaque blobs under collection-namespaced keys. Every put replaces one
//! row in a single statement, so readers never see a half-written object.

use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Mutex;

/// Blob storage with atomic per-key writes and consistent reads
pub trait ObjectStore: Send + Sync {
    fn get_object(&self, key: &str) -> Result<Option<Vec<u8>>>;

    fn put_object(&self, key: &str, value: &[u8]) -> Result<()>;

    /// Write `value` only if the current content equals `expected`
    /// (`None` = key must be absent). Returns whether the write happened.
    fn compare_and_swap(&self, key: &str, expected: Option<&[u8]>, value: &[u8]) -> Result<bool>;

    /// Returns true if something was deleted
    fn delete_object(&self, key: &str) -> Result<bool>;

    fn list_keys(&self, prefix: &str) -> Result<Vec<String>>;
}

/// SQLite-backed object store
pub struct SqliteObjectStore {
    conn: Mutex<Connection>,
}

impl SqliteObjectStore {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create data directory: {}", parent.display()))?;
        }

        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database: {}", path.display()))?;

        // Another CLI instance (status/report) may be reading while a run writes
        conn.busy_timeout(std::time::Duration::from_secs(30))?;

        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init()?;
        Ok(store)
    }

    /// Open an in-memory database
    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;

        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init()?;
        Ok(store)
    }

    fn init(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA temp_store = MEMORY;

            CREATE TABLE IF NOT EXISTS objects (
                key TEXT PRIMARY KEY NOT NULL,
                value BLOB NOT NULL,
                updated_at TEXT NOT NULL
            );
            ",
        )?;
        Ok(())
    }

}

impl ObjectStore for SqliteObjectStore {
    fn get_object(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let conn = self.conn.lock().unwrap();
        let value = conn
            .query_row(
                "SELECT value FROM objects WHERE key = ?1",
                params![key],
                |row| row.get::<_, Vec<u8>>(0),
            )
            .optional()
            .with_context(|| format!("Failed to read object {}", key))?;
        Ok(value)
    }

    fn put_object(&self, key: &str, value: &[u8]) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO objects (key, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![key, value, now],
        )
        .with_context(|| format!("Failed to write object {}", key))?;
        Ok(())
    }

    fn compare_and_swap(&self, key: &str, expected: Option<&[u8]>, value: &[u8]) -> Result<bool> {
        let now = Utc::now().to_rfc3339();
        let mut conn = self.conn.lock().unwrap();

        // IMMEDIATE takes the write lock up front so the read and write are one unit
        let tx = conn.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;

        let current: Option<Vec<u8>> = tx
            .query_row(
                "SELECT value FROM objects WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;

        if current.as_deref() != expected {
            tx.rollback()?;
            return Ok(false);
        }

        tx.execute(
            "INSERT INTO objects (key, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![key, value, now],
        )?;
        tx.commit()?;
        Ok(true)
    }

    fn delete_object(&self, key: &str) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let deleted = conn.execute("DELETE FROM objects WHERE key = ?1", params![key])?;
        Ok(deleted > 0)
    }

    fn list_keys(&self, prefix: &str) -> Result<Vec<String>> {
        let conn = self.conn.lock().unwrap();
        // substr comparison avoids LIKE wildcard escaping for '_' in repo names
        let mut stmt = conn.prepare(
            "SELECT key FROM objects WHERE substr(key, 1, length(?1)) = ?1 ORDER BY key",
        )?;
        let keys = stmt.query_map(params![prefix], |row| row.get::<_, String>(0))?;

        keys.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Helper to create a test store
    fn test_store() -> SqliteObjectStore {
        SqliteObjectStore::open_in_memory().expect("Failed to create test store")
    }

    #[test]
    fn test_put_then_get() {
        let store = test_store();

        assert!(store.get_object("org/checkpoint").unwrap().is_none());

        store.put_object("org/checkpoint", b"v1").unwrap();
        assert_eq!(store.get_object("org/checkpoint").unwrap().unwrap(), b"v1");

        // Overwrite replaces in place
        store.put_object("org/checkpoint", b"v2").unwrap();
        assert_eq!(store.get_object("org/checkpoint").unwrap().unwrap(), b"v2");
    }

    #[test]
    fn test_compare_and_swap_absent() {
        let store = test_store();

        // Key must be absent for the first swap
        assert!(store.compare_and_swap("org/lease", None, b"a").unwrap());
        // Second absent-swap loses
        assert!(!store.compare_and_swap("org/lease", None, b"b").unwrap());
        assert_eq!(store.get_object("org/lease").unwrap().unwrap(), b"a");
    }

    #[test]
    fn test_compare_and_swap_expected_value() {
        let store = test_store();
        store.put_object("org/lease", b"a").unwrap();

        assert!(!store.compare_and_swap("org/lease", Some(b"stale"), b"c").unwrap());
        assert!(store.compare_and_swap("org/lease", Some(b"a"), b"c").unwrap());
        assert_eq!(store.get_object("org/lease").unwrap().unwrap(), b"c");
    }

    #[test]
    fn test_delete() {
        let store = test_store();
        store.put_object("org/worklist", b"[]").unwrap();

        assert!(store.delete_object("org/worklist").unwrap());
        assert!(!store.delete_object("org/worklist").unwrap());
        assert!(store.get_object("org/worklist").unwrap().is_none());
    }

    #[test]
    fn test_list_keys_by_prefix() {
        let store = test_store();
        store.put_object("org_a/results/records/org_a/x", b"1").unwrap();
        store.put_object("org_a/results/records/org_a/y", b"2").unwrap();
        store.put_object("org_a/checkpoint", b"3").unwrap();
        // '_' must not act as a wildcard
        store.put_object("orgXa/results/records/z", b"4").unwrap();

        let keys = store.list_keys("org_a/results/").unwrap();
        assert_eq!(
            keys,
            vec!["org_a/results/records/org_a/x", "org_a/results/records/org_a/y"]
        );
    }
}
