//! Key-value storage backends for the atomic store and the record table.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use super::atomic::AtomicEntry;

/// Associative store backing one of the engine's tables.
///
/// The engine assumes no eviction policy. Anything a backend drops on its
/// own is simply re-fetched on the next miss.
pub trait KeyValueStore<V>: Send + Sync {
  fn get(&self, key: &str) -> Result<Option<V>>;

  fn put(&self, key: &str, value: V) -> Result<()>;

  /// Remove one key. Returns whether it was present.
  fn remove(&self, key: &str) -> Result<bool>;

  fn remove_all(&self) -> Result<()>;

  /// Every key currently stored.
  fn keys(&self) -> Result<Vec<String>>;

  fn contains(&self, key: &str) -> Result<bool> {
    Ok(self.get(key)?.is_some())
  }
}

/// In-process `HashMap` storage.
pub struct MemoryStore<V> {
  entries: Mutex<HashMap<String, V>>,
}

impl<V> MemoryStore<V> {
  pub fn new() -> Self {
    Self {
      entries: Mutex::new(HashMap::new()),
    }
  }

  fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, V>>> {
    self.entries.lock().map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}

impl<V> Default for MemoryStore<V> {
  fn default() -> Self {
    Self::new()
  }
}

impl<V: Clone + Send> KeyValueStore<V> for MemoryStore<V> {
  fn get(&self, key: &str) -> Result<Option<V>> {
    Ok(self.lock()?.get(key).cloned())
  }

  fn put(&self, key: &str, value: V) -> Result<()> {
    self.lock()?.insert(key.to_string(), value);
    Ok(())
  }

  fn remove(&self, key: &str) -> Result<bool> {
    Ok(self.lock()?.remove(key).is_some())
  }

  fn remove_all(&self) -> Result<()> {
    self.lock()?.clear();
    Ok(())
  }

  fn keys(&self) -> Result<Vec<String>> {
    Ok(self.lock()?.keys().cloned().collect())
  }

  fn contains(&self, key: &str) -> Result<bool> {
    Ok(self.lock()?.contains_key(key))
  }
}

/// Storage that doesn't retain anything.
/// Every lookup misses, so every request goes to the network.
pub struct NoopStore;

impl<V> KeyValueStore<V> for NoopStore {
  fn get(&self, _key: &str) -> Result<Option<V>> {
    Ok(None) // Always miss
  }

  fn put(&self, _key: &str, _value: V) -> Result<()> {
    Ok(()) // Discard
  }

  fn remove(&self, _key: &str) -> Result<bool> {
    Ok(false)
  }

  fn remove_all(&self) -> Result<()> {
    Ok(())
  }

  fn keys(&self) -> Result<Vec<String>> {
    Ok(Vec::new())
  }
}

/// SQLite-backed atomic entry storage.
///
/// Entries survive restarts, so a fresh engine can answer single and
/// collection lookups without the network.
pub struct SqliteStore {
  conn: Mutex<Connection>,
}

impl SqliteStore {
  /// Open the store at the default location.
  pub fn open() -> Result<Self> {
    let path = Self::default_path()?;
    Self::open_at(&path)
  }

  pub fn open_at(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;

    Self::with_connection(conn)
  }

  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory cache database: {}", e))?;
    Self::with_connection(conn)
  }

  fn with_connection(conn: Connection) -> Result<Self> {
    let storage = Self {
      conn: Mutex::new(conn),
    };
    storage.run_migrations()?;
    Ok(storage)
  }

  /// Get the default database path.
  fn default_path() -> Result<std::path::PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("wres").join("cache.db"))
  }

  fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
    self.conn.lock().map_err(|e| eyre!("Lock poisoned: {}", e))
  }

  fn run_migrations(&self) -> Result<()> {
    self
      .lock()?
      .execute_batch(ATOMIC_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;

    Ok(())
  }
}

const ATOMIC_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS atomic_entries (
    cache_key TEXT PRIMARY KEY,
    resource_type TEXT NOT NULL,
    resource_id TEXT NOT NULL,
    payload BLOB NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_atomic_entries_type
    ON atomic_entries(resource_type);
"#;

impl KeyValueStore<AtomicEntry> for SqliteStore {
  fn get(&self, key: &str) -> Result<Option<AtomicEntry>> {
    let conn = self.lock()?;

    let row: Option<(String, String, Vec<u8>, String, String)> = conn
      .query_row(
        "SELECT resource_type, resource_id, payload, created_at, updated_at
         FROM atomic_entries WHERE cache_key = ?",
        params![key],
        |row| {
          Ok((
            row.get(0)?,
            row.get(1)?,
            row.get(2)?,
            row.get(3)?,
            row.get(4)?,
          ))
        },
      )
      .optional()
      .map_err(|e| eyre!("Failed to read atomic entry {}: {}", key, e))?;

    let Some((resource_type, id, payload, created_at, updated_at)) = row else {
      return Ok(None);
    };

    Ok(Some(AtomicEntry {
      resource_type,
      id: serde_json::from_str(&id)
        .map_err(|e| eyre!("Failed to parse id of {}: {}", key, e))?,
      payload: serde_json::from_slice(&payload)
        .map_err(|e| eyre!("Failed to deserialize entry {}: {}", key, e))?,
      created_at: parse_datetime(&created_at)?,
      updated_at: parse_datetime(&updated_at)?,
    }))
  }

  fn put(&self, key: &str, entry: AtomicEntry) -> Result<()> {
    let conn = self.lock()?;
    let id =
      serde_json::to_string(&entry.id).map_err(|e| eyre!("Failed to serialize id: {}", e))?;
    let payload = serde_json::to_vec(&entry.payload)
      .map_err(|e| eyre!("Failed to serialize entry: {}", e))?;

    conn
      .execute(
        "INSERT OR REPLACE INTO atomic_entries
           (cache_key, resource_type, resource_id, payload, created_at, updated_at)
         VALUES (?, ?, ?, ?, ?, ?)",
        params![
          key,
          entry.resource_type,
          id,
          payload,
          entry.created_at.to_rfc3339(),
          entry.updated_at.to_rfc3339()
        ],
      )
      .map_err(|e| eyre!("Failed to store atomic entry {}: {}", key, e))?;

    Ok(())
  }

  fn remove(&self, key: &str) -> Result<bool> {
    let removed = self
      .lock()?
      .execute("DELETE FROM atomic_entries WHERE cache_key = ?", params![key])
      .map_err(|e| eyre!("Failed to remove atomic entry {}: {}", key, e))?;
    Ok(removed > 0)
  }

  fn remove_all(&self) -> Result<()> {
    self
      .lock()?
      .execute("DELETE FROM atomic_entries", [])
      .map_err(|e| eyre!("Failed to clear atomic entries: {}", e))?;
    Ok(())
  }

  fn keys(&self) -> Result<Vec<String>> {
    let conn = self.lock()?;
    let mut stmt = conn
      .prepare("SELECT cache_key FROM atomic_entries")
      .map_err(|e| eyre!("Failed to prepare key query: {}", e))?;

    let keys = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to query keys: {}", e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read keys: {}", e))?;

    Ok(keys)
  }
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::key::ResourceId;
  use serde_json::json;

  fn entry(id: ResourceId, name: &str) -> AtomicEntry {
    let now = Utc::now();
    AtomicEntry {
      resource_type: "users".to_string(),
      id,
      payload: json!({ "name": name }),
      created_at: now,
      updated_at: now,
    }
  }

  #[test]
  fn test_memory_store_basic_ops() {
    let store: MemoryStore<u32> = MemoryStore::new();
    store.put("a", 1).unwrap();
    store.put("b", 2).unwrap();

    assert_eq!(store.get("a").unwrap(), Some(1));
    assert!(store.contains("b").unwrap());
    assert!(store.remove("a").unwrap());
    assert!(!store.remove("a").unwrap());
    assert_eq!(store.keys().unwrap(), vec!["b".to_string()]);

    store.remove_all().unwrap();
    assert!(store.keys().unwrap().is_empty());
  }

  #[test]
  fn test_noop_store_never_retains() {
    let store = NoopStore;
    KeyValueStore::<u32>::put(&store, "a", 1).unwrap();
    assert_eq!(KeyValueStore::<u32>::get(&store, "a").unwrap(), None);
  }

  #[test]
  fn test_sqlite_store_round_trip() {
    let store = SqliteStore::open_in_memory().unwrap();
    let original = entry(ResourceId::Int(512), "Henry");

    store.put("/users/512", original.clone()).unwrap();
    let loaded = store.get("/users/512").unwrap().unwrap();

    assert_eq!(loaded.id, ResourceId::Int(512));
    assert_eq!(loaded.payload, json!({ "name": "Henry" }));
    assert_eq!(loaded.created_at.timestamp(), original.created_at.timestamp());
    assert_eq!(store.get("/users/1").unwrap(), None);
  }

  #[test]
  fn test_sqlite_store_replace_and_remove() {
    let store = SqliteStore::open_in_memory().unwrap();
    store.put("/users/~1", entry(ResourceId::Synthetic(1), "Anon")).unwrap();
    store.put("/users/~1", entry(ResourceId::Synthetic(1), "Renamed")).unwrap();

    let loaded = store.get("/users/~1").unwrap().unwrap();
    assert_eq!(loaded.id, ResourceId::Synthetic(1));
    assert_eq!(loaded.payload["name"], "Renamed");
    assert_eq!(store.keys().unwrap(), vec!["/users/~1".to_string()]);

    assert!(store.remove("/users/~1").unwrap());
    store.put("/users/2", entry(ResourceId::Int(2), "Two")).unwrap();
    store.remove_all().unwrap();
    assert!(store.keys().unwrap().is_empty());
  }
}
