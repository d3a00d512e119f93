//! Response cache storage: trait plus SQLite and in-memory backends.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

/// Eviction buckets: API responses are kept indefinitely (they are always
/// revalidated), image responses are bounded by count and age.
pub const BUCKET_API: &str = "api";
pub const BUCKET_IMG: &str = "img";

/// A cached HTTP response.
#[derive(Debug, Clone)]
pub struct CachedResponse {
  pub status: u16,
  pub content_type: Option<String>,
  pub body: Vec<u8>,
  pub cached_at: DateTime<Utc>,
}

impl CachedResponse {
  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }
}

/// Storage backend for cached responses.
pub trait ResponseStore: Send + Sync {
  fn get(&self, key: &str) -> Result<Option<CachedResponse>>;

  fn put(
    &self,
    key: &str,
    bucket: &str,
    status: u16,
    content_type: Option<&str>,
    body: &[u8],
  ) -> Result<()>;

  /// Evict entries of `bucket` beyond `max_entries` (oldest first) or
  /// older than `max_age_secs`. Returns the number evicted.
  fn prune(&self, bucket: &str, max_entries: usize, max_age_secs: i64) -> Result<usize>;
}

/// Open the durable response cache at `path`, degrading to the in-memory
/// implementation when it cannot be opened.
pub fn open_response_store(path: &Path) -> Arc<dyn ResponseStore> {
  match SqliteResponseStore::open(path) {
    Ok(store) => Arc::new(store),
    Err(err) => {
      tracing::warn!(
        error = %err,
        path = %path.display(),
        "response cache unavailable, using in-memory cache for this process"
      );
      Arc::new(MemoryResponseStore::new())
    }
  }
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS responses (
    key TEXT PRIMARY KEY,
    bucket TEXT NOT NULL,
    status INTEGER NOT NULL,
    content_type TEXT,
    body BLOB NOT NULL,
    cached_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE INDEX IF NOT EXISTS idx_responses_bucket ON responses(bucket, cached_at);
"#;

pub struct SqliteResponseStore {
  conn: Mutex<Connection>,
}

impl SqliteResponseStore {
  pub fn open(path: &Path) -> Result<Self> {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open response cache at {}: {}", path.display(), e))?;

    let store = Self {
      conn: Mutex::new(conn),
    };
    store.run_migrations()?;

    Ok(store)
  }

  fn run_migrations(&self) -> Result<()> {
    let conn = self.lock()?;
    conn
      .execute_batch(SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;
    Ok(())
  }

  fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
    self.conn.lock().map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}

impl ResponseStore for SqliteResponseStore {
  fn get(&self, key: &str) -> Result<Option<CachedResponse>> {
    let conn = self.lock()?;
    let mut stmt = conn
      .prepare("SELECT status, content_type, body, cached_at FROM responses WHERE key = ?")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let row: Option<(u16, Option<String>, Vec<u8>, String)> = stmt
      .query_row(params![key], |row| {
        Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
      })
      .ok();

    match row {
      Some((status, content_type, body, cached_at_str)) => Ok(Some(CachedResponse {
        status,
        content_type,
        body,
        cached_at: parse_datetime(&cached_at_str)?,
      })),
      None => Ok(None),
    }
  }

  fn put(
    &self,
    key: &str,
    bucket: &str,
    status: u16,
    content_type: Option<&str>,
    body: &[u8],
  ) -> Result<()> {
    let conn = self.lock()?;
    conn
      .execute(
        "INSERT OR REPLACE INTO responses (key, bucket, status, content_type, body, cached_at)
         VALUES (?, ?, ?, ?, ?, datetime('now'))",
        params![key, bucket, status, content_type, body],
      )
      .map_err(|e| eyre!("Failed to store response: {}", e))?;
    Ok(())
  }

  fn prune(&self, bucket: &str, max_entries: usize, max_age_secs: i64) -> Result<usize> {
    let conn = self.lock()?;
    let expired = conn
      .execute(
        "DELETE FROM responses WHERE bucket = ? AND cached_at < datetime('now', ?)",
        params![bucket, format!("-{} seconds", max_age_secs)],
      )
      .map_err(|e| eyre!("Failed to prune expired responses: {}", e))?;

    let overflow = conn
      .execute(
        "DELETE FROM responses WHERE bucket = ?1 AND key NOT IN
           (SELECT key FROM responses WHERE bucket = ?1 ORDER BY cached_at DESC, key LIMIT ?2)",
        params![bucket, max_entries as i64],
      )
      .map_err(|e| eyre!("Failed to prune over-capacity responses: {}", e))?;

    Ok(expired + overflow)
  }
}

/// In-memory response cache, used as the degraded fallback and in tests.
pub struct MemoryResponseStore {
  entries: Mutex<HashMap<String, (String, CachedResponse)>>,
}

impl MemoryResponseStore {
  pub fn new() -> Self {
    Self {
      entries: Mutex::new(HashMap::new()),
    }
  }
}

impl Default for MemoryResponseStore {
  fn default() -> Self {
    Self::new()
  }
}

impl ResponseStore for MemoryResponseStore {
  fn get(&self, key: &str) -> Result<Option<CachedResponse>> {
    let entries = self
      .entries
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    Ok(entries.get(key).map(|(_, resp)| resp.clone()))
  }

  fn put(
    &self,
    key: &str,
    bucket: &str,
    status: u16,
    content_type: Option<&str>,
    body: &[u8],
  ) -> Result<()> {
    let mut entries = self
      .entries
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    entries.insert(
      key.to_string(),
      (
        bucket.to_string(),
        CachedResponse {
          status,
          content_type: content_type.map(String::from),
          body: body.to_vec(),
          cached_at: Utc::now(),
        },
      ),
    );
    Ok(())
  }

  fn prune(&self, bucket: &str, max_entries: usize, max_age_secs: i64) -> Result<usize> {
    let mut entries = self
      .entries
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let cutoff = Utc::now() - chrono::Duration::seconds(max_age_secs);
    let before = entries.len();
    entries.retain(|_, (b, resp)| b != bucket || resp.cached_at >= cutoff);

    let mut in_bucket: Vec<(String, DateTime<Utc>)> = entries
      .iter()
      .filter(|(_, (b, _))| b == bucket)
      .map(|(k, (_, resp))| (k.clone(), resp.cached_at))
      .collect();
    if in_bucket.len() > max_entries {
      in_bucket.sort_by_key(|(_, cached_at)| *cached_at);
      for (key, _) in in_bucket.iter().take(in_bucket.len() - max_entries) {
        entries.remove(key);
      }
    }

    Ok(before - entries.len())
  }
}

/// Parse a datetime string from SQLite format.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  // SQLite stores as "YYYY-MM-DD HH:MM:SS"
  chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
    .map(|dt| dt.and_utc())
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_memory_roundtrip() {
    let store = MemoryResponseStore::new();
    store
      .put("k1", BUCKET_API, 200, Some("application/json"), b"[]")
      .unwrap();

    let resp = store.get("k1").unwrap().unwrap();
    assert_eq!(resp.status, 200);
    assert_eq!(resp.body, b"[]");
    assert!(resp.is_success());
  }

  #[test]
  fn test_memory_prune_respects_bucket() {
    let store = MemoryResponseStore::new();
    store.put("api", BUCKET_API, 200, None, b"a").unwrap();
    store.put("i1", BUCKET_IMG, 200, None, b"1").unwrap();
    store.put("i2", BUCKET_IMG, 200, None, b"2").unwrap();
    store.put("i3", BUCKET_IMG, 200, None, b"3").unwrap();

    store.prune(BUCKET_IMG, 2, 60 * 60).unwrap();
    assert!(store.get("api").unwrap().is_some());
    let remaining = ["i1", "i2", "i3"]
      .iter()
      .filter(|k| store.get(k).unwrap().is_some())
      .count();
    assert_eq!(remaining, 2);
  }
}
