//! The local store: the persistent replica every read resolves against.
//!
//! Five snapshot collections (plants, locations, action times, outbox,
//! sync metadata) plus an image blob cache, each written as an atomic
//! whole-collection replace. A corrupt snapshot is reset to its default
//! rather than crashing the caller; the reset is logged.

mod backend;

pub use backend::{open_backend, MemoryBackend, SqliteBackend, StoreBackend};

use color_eyre::{eyre::eyre, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::api::types::{ActionTimes, Plant};

const PLANTS: &str = "plants";
const LOCATIONS: &str = "locations";
const TIMES: &str = "times";
const SYNC_META: &str = "sync-meta";

/// Synchronization bookkeeping; advances only after a full sync pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncMeta {
  pub last_server_rev: i64,
  pub last_sync_at: Option<i64>,
}

#[derive(Clone)]
pub struct LocalStore {
  backend: Arc<dyn StoreBackend>,
  image_max_entries: usize,
  image_max_age_secs: i64,
}

impl LocalStore {
  pub fn new(backend: Arc<dyn StoreBackend>) -> Self {
    Self {
      backend,
      image_max_entries: 200,
      image_max_age_secs: 30 * 24 * 60 * 60,
    }
  }

  /// Set the image blob cache bounds (count and age).
  pub fn with_image_bounds(mut self, max_entries: usize, max_age_secs: i64) -> Self {
    self.image_max_entries = max_entries;
    self.image_max_age_secs = max_age_secs;
    self
  }

  pub fn backend_kind(&self) -> &'static str {
    self.backend.kind()
  }

  /// Read a collection snapshot, resetting to the default on a corrupt
  /// payload (logged, not fatal).
  pub fn read_collection<T: DeserializeOwned + Default>(&self, name: &str) -> Result<T> {
    match self.backend.get(name)? {
      Some(bytes) => match serde_json::from_slice(&bytes) {
        Ok(value) => Ok(value),
        Err(err) => {
          tracing::warn!(collection = name, error = %err, "corrupt snapshot, resetting to default");
          Ok(T::default())
        }
      },
      None => Ok(T::default()),
    }
  }

  /// Atomically replace a collection snapshot.
  pub fn write_collection<T: Serialize>(&self, name: &str, value: &T) -> Result<()> {
    let bytes =
      serde_json::to_vec(value).map_err(|e| eyre!("Failed to serialize {}: {}", name, e))?;
    self.backend.put(name, &bytes)
  }

  pub fn read_plants(&self) -> Result<Vec<Plant>> {
    self.read_collection(PLANTS)
  }

  pub fn write_plants(&self, plants: &[Plant]) -> Result<()> {
    self.write_collection(PLANTS, &plants)
  }

  pub fn read_locations(&self) -> Result<Vec<String>> {
    self.read_collection(LOCATIONS)
  }

  pub fn write_locations(&self, locations: &[String]) -> Result<()> {
    self.write_collection(LOCATIONS, &locations)
  }

  pub fn read_times(&self) -> Result<ActionTimes> {
    self.read_collection(TIMES)
  }

  pub fn write_times(&self, times: &ActionTimes) -> Result<()> {
    self.write_collection(TIMES, times)
  }

  pub fn read_sync_meta(&self) -> Result<SyncMeta> {
    self.read_collection(SYNC_META)
  }

  pub fn write_sync_meta(&self, meta: &SyncMeta) -> Result<()> {
    self.write_collection(SYNC_META, meta)
  }

  pub fn read_image(&self, key: &str) -> Result<Option<Vec<u8>>> {
    self.backend.get_image(key)
  }

  /// Store an image blob and apply the configured eviction bounds.
  pub fn write_image(&self, key: &str, data: &[u8]) -> Result<()> {
    self.backend.put_image(key, data)?;
    let evicted = self
      .backend
      .prune_images(self.image_max_entries, self.image_max_age_secs)?;
    if evicted > 0 {
      tracing::debug!(evicted, "evicted image cache entries");
    }
    Ok(())
  }

  /// Upsert one plant into the replica snapshot (optimistic local apply).
  pub fn upsert_plant(&self, plant: &Plant) -> Result<()> {
    let mut plants = self.read_plants()?;
    match plants.iter_mut().find(|p| p.merge_key() == plant.merge_key()) {
      Some(existing) => *existing = plant.clone(),
      None => plants.push(plant.clone()),
    }
    self.write_plants(&plants)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn memory_store() -> LocalStore {
    LocalStore::new(Arc::new(MemoryBackend::new()))
  }

  #[test]
  fn test_collections_default_when_absent() {
    let store = memory_store();
    assert!(store.read_plants().unwrap().is_empty());
    assert!(store.read_times().unwrap().is_empty());
    assert_eq!(store.read_sync_meta().unwrap(), SyncMeta::default());
  }

  #[test]
  fn test_snapshot_roundtrip() {
    let store = memory_store();
    let mut plant = Plant::new("Ficus");
    plant.updated_at = 10;
    store.write_plants(&[plant.clone()]).unwrap();

    let read = store.read_plants().unwrap();
    assert_eq!(read, vec![plant]);
  }

  #[test]
  fn test_corrupt_snapshot_resets_to_default() {
    let backend = Arc::new(MemoryBackend::new());
    backend.put("plants", b"not json{{").unwrap();

    let store = LocalStore::new(backend);
    assert!(store.read_plants().unwrap().is_empty());
  }

  #[test]
  fn test_upsert_plant_replaces_by_identity() {
    let store = memory_store();
    let mut plant = Plant::new("Ficus");
    plant.id = Some("p-1".to_string());
    plant.updated_at = 1;
    store.upsert_plant(&plant).unwrap();

    plant.updated_at = 2;
    store.upsert_plant(&plant).unwrap();

    let plants = store.read_plants().unwrap();
    assert_eq!(plants.len(), 1);
    assert_eq!(plants[0].updated_at, 2);
  }

  #[test]
  fn test_image_key_embeds_version() {
    let store = memory_store();
    let mut plant = Plant::new("Ficus");
    plant.id = Some("p-1".to_string());
    plant.updated_at = 1;
    store.write_image(&plant.image_cache_key(), b"v1").unwrap();

    // A new updatedAt must not resolve to the old bytes
    plant.updated_at = 2;
    assert!(store.read_image(&plant.image_cache_key()).unwrap().is_none());

    plant.updated_at = 1;
    assert_eq!(store.read_image(&plant.image_cache_key()).unwrap().unwrap(), b"v1");
  }
}
