//! Normalized entity storage, one entry per (resource type, id).

use chrono::{DateTime, Utc};
use color_eyre::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

use super::key::{ResourceId, ResourcePointer};
use super::storage::{KeyValueStore, MemoryStore};

/// Smallest cache unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AtomicEntry {
  pub resource_type: String,
  pub id: ResourceId,
  pub payload: Value,
  pub created_at: DateTime<Utc>,
  /// Last network-confirmed write. Local edits leave it untouched.
  pub updated_at: DateTime<Utc>,
}

/// Normalized key -> entity map shared by every record of one engine.
pub struct AtomicStore {
  storage: Box<dyn KeyValueStore<AtomicEntry>>,
  next_synthetic: AtomicU64,
}

impl AtomicStore {
  pub fn new(storage: impl KeyValueStore<AtomicEntry> + 'static) -> Self {
    Self {
      storage: Box::new(storage),
      next_synthetic: AtomicU64::new(1),
    }
  }

  /// Storage key of an entity.
  pub fn key(resource_type: &str, id: &ResourceId) -> String {
    ResourcePointer::atomic(resource_type, id).cache_key().to_string()
  }

  /// Allocate an id for a payload that carries none.
  pub fn synthetic_id(&self) -> ResourceId {
    ResourceId::Synthetic(self.next_synthetic.fetch_add(1, Ordering::Relaxed))
  }

  pub fn exists(&self, resource_type: &str, id: &ResourceId) -> Result<bool> {
    self.storage.contains(&Self::key(resource_type, id))
  }

  pub fn get(&self, resource_type: &str, id: &ResourceId) -> Result<Option<AtomicEntry>> {
    self.get_by_key(&Self::key(resource_type, id))
  }

  pub fn get_by_key(&self, key: &str) -> Result<Option<AtomicEntry>> {
    self.storage.get(key)
  }

  /// Insert or replace an entity seen on the network. Returns its key.
  pub fn upsert(&self, resource_type: &str, id: &ResourceId, payload: Value) -> Result<String> {
    self.write(resource_type, id, payload, true)
  }

  /// Insert or replace an entity from a local edit, keeping `updated_at`
  /// at the last network-confirmed value.
  pub fn upsert_local(
    &self,
    resource_type: &str,
    id: &ResourceId,
    payload: Value,
  ) -> Result<String> {
    self.write(resource_type, id, payload, false)
  }

  fn write(
    &self,
    resource_type: &str,
    id: &ResourceId,
    payload: Value,
    confirmed: bool,
  ) -> Result<String> {
    let key = Self::key(resource_type, id);
    let now = Utc::now();

    let entry = match self.storage.get(&key)? {
      Some(mut entry) => {
        entry.payload = payload;
        if confirmed {
          entry.updated_at = now;
        }
        entry
      }
      None => AtomicEntry {
        resource_type: resource_type.to_string(),
        id: id.clone(),
        payload,
        created_at: now,
        updated_at: now,
      },
    };

    self.storage.put(&key, entry)?;
    Ok(key)
  }

  /// Subset of `ids` with no entry, in input order.
  pub fn find_uncached(&self, resource_type: &str, ids: &[ResourceId]) -> Result<Vec<ResourceId>> {
    let mut uncached = Vec::new();
    for id in ids {
      if !self.exists(resource_type, id)? {
        uncached.push(id.clone());
      }
    }
    Ok(uncached)
  }

  pub fn reset_all(&self) -> Result<()> {
    debug!("resetting all atomic entries");
    self.storage.remove_all()
  }

  /// Remove every entry of one type. Returns how many were removed.
  pub fn reset_type(&self, resource_type: &str) -> Result<usize> {
    let prefix = format!("/{}/", resource_type.trim_matches('/'));
    let mut removed = 0;
    for key in self.storage.keys()? {
      if key.starts_with(&prefix) && self.storage.remove(&key)? {
        removed += 1;
      }
    }
    debug!(resource_type, removed, "reset atomic entries of type");
    Ok(removed)
  }

  pub fn reset(&self, resource_type: &str, id: &ResourceId) -> Result<bool> {
    debug!(resource_type, %id, "reset atomic entry");
    self.storage.remove(&Self::key(resource_type, id))
  }

  /// Every stored entry, for debugging.
  pub fn entries(&self) -> Result<Vec<(String, AtomicEntry)>> {
    let mut entries = Vec::new();
    for key in self.storage.keys()? {
      if let Some(entry) = self.storage.get(&key)? {
        entries.push((key, entry));
      }
    }
    entries.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(entries)
  }
}

impl Default for AtomicStore {
  fn default() -> Self {
    Self::new(MemoryStore::new())
  }
}
