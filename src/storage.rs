//! Durable key-value backing store used by the state recorder.
//!
//! Values are serde_json-encoded into a single `kv` table so the store can be
//! read from other processes (sqlite handles cross-process locking).

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use rusqlite::{params, Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::Result;

pub struct KvStore {
    conn: Mutex<Connection>,
}

impl KvStore {
    /// Opens (and initializes) the store at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent).ok();
            }
        }
        Self::from_connection(Connection::open(path)?)
    }

    /// Opens the store at the platform data directory, namespaced by `name`.
    pub fn open_default(name: &str) -> Result<Self> {
        Self::open(&default_db_path(&format!("{name}.db")))
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS kv (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            )",
            [],
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn put<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let encoded = serde_json::to_string(value)?;
        let conn = self.conn.lock().expect("kv store lock poisoned");
        conn.execute(
            "INSERT INTO kv (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, encoded],
        )?;
        Ok(())
    }

    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let conn = self.conn.lock().expect("kv store lock poisoned");
        let encoded: Option<String> = conn
            .query_row("SELECT value FROM kv WHERE key = ?1", params![key], |row| {
                row.get(0)
            })
            .optional()?;

        match encoded {
            Some(encoded) => Ok(Some(serde_json::from_str(&encoded)?)),
            None => Ok(None),
        }
    }

    pub fn remove(&self, key: &str) -> Result<()> {
        let conn = self.conn.lock().expect("kv store lock poisoned");
        conn.execute("DELETE FROM kv WHERE key = ?1", params![key])?;
        Ok(())
    }

    /// Removes every key under `prefix`; used to reset one instance id.
    pub fn remove_prefix(&self, prefix: &str) -> Result<()> {
        let conn = self.conn.lock().expect("kv store lock poisoned");
        conn.execute(
            "DELETE FROM kv WHERE key LIKE ?1 || '%'",
            params![prefix],
        )?;
        Ok(())
    }
}

/// Platform data directory for spindle databases.
pub(crate) fn default_db_path(file_name: &str) -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("spindle")
        .join(file_name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_get_round_trip() {
        let store = KvStore::open_in_memory().unwrap();
        store.put("answer", &42_u64).unwrap();
        assert_eq!(store.get::<u64>("answer").unwrap(), Some(42));
    }

    #[test]
    fn test_get_missing_key_is_none() {
        let store = KvStore::open_in_memory().unwrap();
        assert_eq!(store.get::<String>("missing").unwrap(), None);
    }

    #[test]
    fn test_put_overwrites_existing_value() {
        let store = KvStore::open_in_memory().unwrap();
        store.put("k", &"first").unwrap();
        store.put("k", &"second").unwrap();
        assert_eq!(store.get::<String>("k").unwrap(), Some("second".into()));
    }

    #[test]
    fn test_remove_prefix_only_touches_matching_keys() {
        let store = KvStore::open_in_memory().unwrap();
        store.put("a:x", &1_u32).unwrap();
        store.put("a:y", &2_u32).unwrap();
        store.put("b:x", &3_u32).unwrap();
        store.remove_prefix("a:").unwrap();
        assert_eq!(store.get::<u32>("a:x").unwrap(), None);
        assert_eq!(store.get::<u32>("a:y").unwrap(), None);
        assert_eq!(store.get::<u32>("b:x").unwrap(), Some(3));
    }

    #[test]
    fn test_reopening_the_same_file_sees_written_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kv.db");
        {
            let store = KvStore::open(&path).unwrap();
            store.put("persisted", &"yes").unwrap();
        }
        let store = KvStore::open(&path).unwrap();
        assert_eq!(
            store.get::<String>("persisted").unwrap(),
            Some("yes".into())
        );
    }
}
