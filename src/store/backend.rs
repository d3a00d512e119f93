//! Storage backends for the local replica.
//!
//! One object-safe trait with interchangeable implementations, selected
//! once at startup by [`open_backend`]: SQLite for durability, in-memory
//! as the degraded fallback when the database cannot be opened.

use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

/// Raw snapshot + blob storage underneath the local store.
///
/// `put` replaces a whole collection snapshot in a single statement, so a
/// concurrent `get` observes either the old or the new snapshot, never a
/// partial one. Nothing guards against a second process writing the same
/// database file; each write is still internally atomic.
pub trait StoreBackend: Send + Sync {
  /// Human-readable backend kind for status output ("sqlite", "memory").
  fn kind(&self) -> &'static str;

  /// Read a collection snapshot.
  fn get(&self, collection: &str) -> Result<Option<Vec<u8>>>;

  /// Atomically replace a collection snapshot.
  fn put(&self, collection: &str, data: &[u8]) -> Result<()>;

  /// Read an image blob by its `<id>:<updatedAt>` key.
  fn get_image(&self, key: &str) -> Result<Option<Vec<u8>>>;

  /// Store an image blob.
  fn put_image(&self, key: &str, data: &[u8]) -> Result<()>;

  /// Evict image blobs beyond `max_entries` (oldest first) or older than
  /// `max_age_secs`. Returns the number of evicted blobs.
  fn prune_images(&self, max_entries: usize, max_age_secs: i64) -> Result<usize>;
}

/// Open the durable backend at `path`, degrading to the in-memory
/// implementation (data lost at process exit) when it cannot be opened.
pub fn open_backend(path: &Path) -> Arc<dyn StoreBackend> {
  match SqliteBackend::open(path) {
    Ok(backend) => Arc::new(backend),
    Err(err) => {
      tracing::warn!(
        error = %err,
        path = %path.display(),
        "local store unavailable, falling back to in-memory storage; data will not survive this process"
      );
      Arc::new(MemoryBackend::new())
    }
  }
}

/// Schema for the local replica database.
const SCHEMA: &str = r#"
-- One serialized snapshot per logical collection
CREATE TABLE IF NOT EXISTS collections (
    name TEXT PRIMARY KEY,
    data BLOB NOT NULL,
    saved_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Image blobs keyed by "<id>:<updatedAt>"
CREATE TABLE IF NOT EXISTS images (
    key TEXT PRIMARY KEY,
    data BLOB NOT NULL,
    cached_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE INDEX IF NOT EXISTS idx_images_cached_at ON images(cached_at);
"#;

/// SQLite-backed storage.
pub struct SqliteBackend {
  conn: Mutex<Connection>,
}

impl SqliteBackend {
  pub fn open(path: &Path) -> Result<Self> {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create data directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open store database at {}: {}", path.display(), e))?;

    let backend = Self {
      conn: Mutex::new(conn),
    };
    backend.run_migrations()?;

    Ok(backend)
  }

  #[cfg(test)]
  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory().map_err(|e| eyre!("{}", e))?;
    let backend = Self {
      conn: Mutex::new(conn),
    };
    backend.run_migrations()?;
    Ok(backend)
  }

  fn run_migrations(&self) -> Result<()> {
    let conn = self.lock()?;
    conn
      .execute_batch(SCHEMA)
      .map_err(|e| eyre!("Failed to run store migrations: {}", e))?;
    Ok(())
  }

  fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
    self.conn.lock().map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}

impl StoreBackend for SqliteBackend {
  fn kind(&self) -> &'static str {
    "sqlite"
  }

  fn get(&self, collection: &str) -> Result<Option<Vec<u8>>> {
    let conn = self.lock()?;
    let mut stmt = conn
      .prepare("SELECT data FROM collections WHERE name = ?")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let result: Option<Vec<u8>> = stmt.query_row(params![collection], |row| row.get(0)).ok();
    Ok(result)
  }

  fn put(&self, collection: &str, data: &[u8]) -> Result<()> {
    let conn = self.lock()?;
    conn
      .execute(
        "INSERT OR REPLACE INTO collections (name, data, saved_at)
         VALUES (?, ?, datetime('now'))",
        params![collection, data],
      )
      .map_err(|e| eyre!("Failed to store collection {}: {}", collection, e))?;
    Ok(())
  }

  fn get_image(&self, key: &str) -> Result<Option<Vec<u8>>> {
    let conn = self.lock()?;
    let mut stmt = conn
      .prepare("SELECT data FROM images WHERE key = ?")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let result: Option<Vec<u8>> = stmt.query_row(params![key], |row| row.get(0)).ok();
    Ok(result)
  }

  fn put_image(&self, key: &str, data: &[u8]) -> Result<()> {
    let conn = self.lock()?;
    conn
      .execute(
        "INSERT OR REPLACE INTO images (key, data, cached_at)
         VALUES (?, ?, datetime('now'))",
        params![key, data],
      )
      .map_err(|e| eyre!("Failed to store image {}: {}", key, e))?;
    Ok(())
  }

  fn prune_images(&self, max_entries: usize, max_age_secs: i64) -> Result<usize> {
    let conn = self.lock()?;
    let expired = conn
      .execute(
        "DELETE FROM images WHERE cached_at < datetime('now', ?)",
        params![format!("-{} seconds", max_age_secs)],
      )
      .map_err(|e| eyre!("Failed to prune expired images: {}", e))?;

    let overflow = conn
      .execute(
        "DELETE FROM images WHERE key NOT IN
           (SELECT key FROM images ORDER BY cached_at DESC, key LIMIT ?)",
        params![max_entries as i64],
      )
      .map_err(|e| eyre!("Failed to prune over-capacity images: {}", e))?;

    Ok(expired + overflow)
  }
}

/// In-memory storage, used as the degraded fallback and in tests.
pub struct MemoryBackend {
  collections: Mutex<HashMap<String, Vec<u8>>>,
  // (key, bytes, insertion counter) — the counter stands in for cached_at
  images: Mutex<Vec<(String, Vec<u8>, u64)>>,
  counter: Mutex<u64>,
}

impl MemoryBackend {
  pub fn new() -> Self {
    Self {
      collections: Mutex::new(HashMap::new()),
      images: Mutex::new(Vec::new()),
      counter: Mutex::new(0),
    }
  }
}

impl Default for MemoryBackend {
  fn default() -> Self {
    Self::new()
  }
}

impl StoreBackend for MemoryBackend {
  fn kind(&self) -> &'static str {
    "memory"
  }

  fn get(&self, collection: &str) -> Result<Option<Vec<u8>>> {
    let collections = self
      .collections
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    Ok(collections.get(collection).cloned())
  }

  fn put(&self, collection: &str, data: &[u8]) -> Result<()> {
    let mut collections = self
      .collections
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    collections.insert(collection.to_string(), data.to_vec());
    Ok(())
  }

  fn get_image(&self, key: &str) -> Result<Option<Vec<u8>>> {
    let images = self
      .images
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    Ok(
      images
        .iter()
        .find(|(k, _, _)| k == key)
        .map(|(_, data, _)| data.clone()),
    )
  }

  fn put_image(&self, key: &str, data: &[u8]) -> Result<()> {
    let mut counter = self
      .counter
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    *counter += 1;
    let seq = *counter;
    drop(counter);

    let mut images = self
      .images
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    images.retain(|(k, _, _)| k != key);
    images.push((key.to_string(), data.to_vec(), seq));
    Ok(())
  }

  fn prune_images(&self, max_entries: usize, _max_age_secs: i64) -> Result<usize> {
    // No wall clock here; age-based eviction only applies to the durable
    // backend. Capacity still holds.
    let mut images = self
      .images
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    if images.len() <= max_entries {
      return Ok(0);
    }
    images.sort_by_key(|(_, _, seq)| *seq);
    let evict = images.len() - max_entries;
    images.drain(..evict);
    Ok(evict)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_sqlite_snapshot_replace() {
    let backend = SqliteBackend::open_in_memory().unwrap();
    assert!(backend.get("plants").unwrap().is_none());

    backend.put("plants", b"[1]").unwrap();
    backend.put("plants", b"[1,2]").unwrap();
    assert_eq!(backend.get("plants").unwrap().unwrap(), b"[1,2]");
  }

  #[test]
  fn test_sqlite_image_capacity_eviction() {
    let backend = SqliteBackend::open_in_memory().unwrap();
    for i in 0..5 {
      backend.put_image(&format!("p{}:1", i), &[i as u8]).unwrap();
    }
    let evicted = backend.prune_images(3, 60 * 60).unwrap();
    assert_eq!(evicted, 2);
  }

  #[test]
  fn test_sqlite_image_age_eviction() {
    let backend = SqliteBackend::open_in_memory().unwrap();
    backend.put_image("old:1", b"x").unwrap();
    backend.put_image("new:1", b"y").unwrap();
    {
      let conn = backend.lock().unwrap();
      conn
        .execute(
          "UPDATE images SET cached_at = datetime('now', '-40 days') WHERE key = 'old:1'",
          [],
        )
        .unwrap();
    }

    let evicted = backend.prune_images(100, 30 * 24 * 60 * 60).unwrap();
    assert_eq!(evicted, 1);
    assert!(backend.get_image("old:1").unwrap().is_none());
    assert!(backend.get_image("new:1").unwrap().is_some());
  }

  #[test]
  fn test_memory_backend_roundtrip() {
    let backend = MemoryBackend::new();
    backend.put("times", b"{}").unwrap();
    assert_eq!(backend.get("times").unwrap().unwrap(), b"{}");

    backend.put_image("a:1", b"img").unwrap();
    assert_eq!(backend.get_image("a:1").unwrap().unwrap(), b"img");
    assert!(backend.get_image("a:2").unwrap().is_none());
  }

  #[test]
  fn test_memory_capacity_eviction_drops_oldest() {
    let backend = MemoryBackend::new();
    backend.put_image("a:1", b"1").unwrap();
    backend.put_image("b:1", b"2").unwrap();
    backend.put_image("c:1", b"3").unwrap();

    backend.prune_images(2, 0).unwrap();
    assert!(backend.get_image("a:1").unwrap().is_none());
    assert!(backend.get_image("c:1").unwrap().is_some());
  }
}
