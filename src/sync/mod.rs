//! The sync engine: replay queued mutations, pull server deltas, merge
//! them into the local replica, refresh dependent images, advance the
//! sync metadata.
//!
//! Passes are serialized; a pass that fails at any step leaves the sync
//! metadata untouched so the next trigger retries the same window.

use color_eyre::{eyre::eyre, Result};
use futures::future::join_all;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

use crate::api::types::{ChangesResponse, Method, Plant};
use crate::api::ApiClient;
use crate::connectivity::{ConnState, ConnectivityMonitor};
use crate::outbox::{FlushReport, Outbox};
use crate::store::{LocalStore, SyncMeta};

/// Outcome of one sync pass.
#[derive(Debug, Default)]
pub struct SyncReport {
  pub flushed: usize,
  pub upserts: usize,
  pub deletions: usize,
  pub server_rev: i64,
  /// True when another pass was already running.
  pub skipped: bool,
}

/// An image blob to refetch after a merge changed its owner.
#[derive(Debug, Clone, PartialEq)]
struct ImageRefresh {
  key: String,
  path: String,
}

pub struct SyncEngine {
  api: ApiClient,
  store: LocalStore,
  outbox: Arc<Outbox>,
  running: tokio::sync::Mutex<()>,
}

impl SyncEngine {
  pub fn new(api: ApiClient, store: LocalStore, outbox: Arc<Outbox>) -> Self {
    Self {
      api,
      store,
      outbox,
      running: tokio::sync::Mutex::new(()),
    }
  }

  /// Run one full pass. A pass triggered while another is in flight is
  /// skipped (the in-flight one covers it).
  pub async fn sync(&self) -> Result<SyncReport> {
    let _guard = match self.running.try_lock() {
      Ok(guard) => guard,
      Err(_) => {
        return Ok(SyncReport {
          skipped: true,
          ..SyncReport::default()
        })
      }
    };

    // 1. Replay the outbox; a stalled op aborts the pass.
    let flush = self.flush_outbox().await?;
    if let Some(error) = flush.error {
      return Err(eyre!(
        "outbox replay stalled with {} ops pending: {}",
        flush.remaining,
        error
      ));
    }

    // 2. Pull everything before touching the store.
    let meta = self.store.read_sync_meta()?;
    let changes = self.api.changes(meta.last_server_rev).await?;
    let locations = self.api.get_locations().await?;
    let times = self.api.get_times().await?;

    // 3-4. Merge and persist.
    let local = self.store.read_plants()?;
    let (merged, refresh) = merge_plants(local, &changes);
    self.store.write_plants(&merged)?;
    self.store.write_locations(&locations)?;
    self.store.write_times(&times)?;

    // 5. Refresh changed images in the background; failures only log.
    if !refresh.is_empty() {
      self.spawn_image_refresh(refresh);
    }

    // 6. Advance the revision window only now.
    let server_rev = if changes.server_rev > 0 {
      changes.server_rev
    } else {
      meta.last_server_rev
    };
    self.store.write_sync_meta(&SyncMeta {
      last_server_rev: server_rev,
      last_sync_at: Some(chrono::Utc::now().timestamp_millis()),
    })?;

    let report = SyncReport {
      flushed: flush.replayed,
      upserts: changes.plants.len(),
      deletions: changes.deleted.len(),
      server_rev,
      skipped: false,
    };
    tracing::info!(
      flushed = report.flushed,
      upserts = report.upserts,
      deletions = report.deletions,
      server_rev = report.server_rev,
      "sync pass complete"
    );
    Ok(report)
  }

  /// Replay queued ops through the gateway, reconciling offline-created
  /// plants with their server-assigned records.
  async fn flush_outbox(&self) -> Result<FlushReport> {
    let api = self.api.clone();
    let store = self.store.clone();
    self
      .outbox
      .flush(move |op| {
        let api = api.clone();
        let store = store.clone();
        async move {
          let value = api.replay(&op).await?;
          if op.method == Method::Post && op.url == "/plants" {
            reconcile_created(&store, &value);
          }
          Ok(value)
        }
      })
      .await
  }

  fn spawn_image_refresh(&self, refresh: Vec<ImageRefresh>) {
    let api = self.api.clone();
    let store = self.store.clone();
    tokio::spawn(async move {
      let fetches = refresh.into_iter().map(|item| {
        let api = api.clone();
        let store = store.clone();
        async move {
          match api.get_bytes(&item.path).await {
            Ok(bytes) => {
              if let Err(err) = store.write_image(&item.key, &bytes) {
                tracing::warn!(key = %item.key, error = %err, "failed to cache image");
              }
            }
            Err(err) => {
              tracing::warn!(path = %item.path, error = %err, "failed to refresh image")
            }
          }
        }
      });
      join_all(fetches).await;
    });
  }

  /// Queue a pass on every transition to online.
  pub fn spawn_on_reconnect(self: &Arc<Self>, monitor: &ConnectivityMonitor) {
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    monitor.subscribe(move |state| {
      if state == ConnState::Online {
        let _ = tx.send(());
      }
    });

    let engine = Arc::clone(self);
    tokio::spawn(async move {
      while rx.recv().await.is_some() {
        log_pass(engine.sync().await);
      }
    });
  }

  /// Run a pass on a fixed interval while online.
  pub fn spawn_interval(
    self: &Arc<Self>,
    monitor: Arc<ConnectivityMonitor>,
    every: Duration,
  ) {
    let engine = Arc::clone(self);
    tokio::spawn(async move {
      let mut interval = tokio::time::interval(every);
      interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
      interval.tick().await; // the first tick fires immediately
      loop {
        interval.tick().await;
        if monitor.is_offline() {
          continue;
        }
        log_pass(engine.sync().await);
      }
    });
  }
}

fn log_pass(result: Result<SyncReport>) {
  match result {
    Ok(report) if report.skipped => {}
    Ok(report) => tracing::debug!(flushed = report.flushed, upserts = report.upserts, "sync ran"),
    Err(err) => tracing::warn!(error = %err, "sync pass failed"),
  }
}

/// Last-writer-wins merge of remote changes into the local replica.
///
/// Upserts replace a local version only when `remote.updated_at >=
/// local.updated_at` (ties favor remote); the replica never regresses to
/// an older version. Deletion signals remove unconditionally.
fn merge_plants(
  local: Vec<Plant>,
  changes: &ChangesResponse,
) -> (Vec<Plant>, Vec<ImageRefresh>) {
  let mut merged = local;
  let mut refresh = Vec::new();

  for remote in &changes.plants {
    match merged
      .iter_mut()
      .find(|p| p.merge_key() == remote.merge_key())
    {
      Some(existing) => {
        if remote.updated_at >= existing.updated_at {
          let version_changed =
            existing.image != remote.image || existing.updated_at != remote.updated_at;
          *existing = remote.clone();
          if version_changed {
            if let Some(path) = &remote.image {
              refresh.push(ImageRefresh {
                key: remote.image_cache_key(),
                path: path.clone(),
              });
            }
          }
        } else {
          tracing::debug!(key = remote.merge_key(), "ignoring stale remote version");
        }
      }
      None => {
        if let Some(path) = &remote.image {
          refresh.push(ImageRefresh {
            key: remote.image_cache_key(),
            path: path.clone(),
          });
        }
        merged.push(remote.clone());
      }
    }
  }

  for key in &changes.deleted {
    merged.retain(|p| p.merge_key() != key);
  }

  (merged, refresh)
}

/// Swap an optimistic offline-created record for the server-assigned one.
/// Keyed by the unique plant name; failures only log (the op has already
/// been applied remotely and must not replay again).
fn reconcile_created(store: &LocalStore, value: &Value) {
  let created: Plant = match serde_json::from_value(value.clone()) {
    Ok(plant) => plant,
    Err(err) => {
      tracing::warn!(error = %err, "create response was not a plant; skipping reconcile");
      return;
    }
  };

  let result = (|| -> Result<()> {
    let mut plants = store.read_plants()?;
    match plants
      .iter_mut()
      .find(|p| p.name == created.name && p.has_local_identity())
    {
      Some(existing) => {
        *existing = created.clone();
        store.write_plants(&plants)
      }
      None => store.upsert_plant(&created),
    }
  })();

  if let Err(err) = result {
    tracing::warn!(name = %created.name, error = %err, "failed to reconcile created plant");
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{CacheLayer, MemoryResponseStore};
  use crate::store::MemoryBackend;
  use crate::testutil::{StubResponse, StubServer};
  use url::Url;

  fn plant(id: &str, name: &str, updated_at: i64) -> Plant {
    let mut plant = Plant::new(name);
    plant.id = Some(id.to_string());
    plant.updated_at = updated_at;
    plant
  }

  fn changes(plants: Vec<Plant>, deleted: Vec<&str>, server_rev: i64) -> ChangesResponse {
    ChangesResponse {
      plants,
      deleted: deleted.into_iter().map(String::from).collect(),
      server_rev,
    }
  }

  #[test]
  fn test_merge_keeps_newer_local_version() {
    let local = vec![plant("p-1", "Ficus", 10)];
    let (merged, _) = merge_plants(local.clone(), &changes(vec![plant("p-1", "Ficus", 5)], vec![], 1));
    assert_eq!(merged, local);
  }

  #[test]
  fn test_merge_adopts_newer_remote_version() {
    let local = vec![plant("p-1", "Ficus", 10)];
    let (merged, _) = merge_plants(local, &changes(vec![plant("p-1", "Ficus", 15)], vec![], 1));
    assert_eq!(merged[0].updated_at, 15);
  }

  #[test]
  fn test_merge_tie_favors_remote() {
    let mut remote = plant("p-1", "Ficus", 10);
    remote.description = "remote wins".to_string();
    let local = vec![plant("p-1", "Ficus", 10)];
    let (merged, _) = merge_plants(local, &changes(vec![remote], vec![], 1));
    assert_eq!(merged[0].description, "remote wins");
  }

  #[test]
  fn test_merge_inserts_unknown_and_deletes_unconditionally() {
    let local = vec![plant("p-1", "Ficus", 10)];
    let (merged, _) = merge_plants(
      local,
      &changes(vec![plant("p-2", "Aloe", 3)], vec!["p-1"], 1),
    );
    assert_eq!(merged.len(), 1);
    assert_eq!(merged[0].merge_key(), "p-2");
  }

  #[test]
  fn test_merge_flags_changed_images_for_refresh() {
    let mut old = plant("p-1", "Ficus", 10);
    old.image = Some("images/old.png".to_string());
    let mut new = plant("p-1", "Ficus", 20);
    new.image = Some("images/new.png".to_string());

    let (_, refresh) = merge_plants(vec![old], &changes(vec![new], vec![], 1));
    assert_eq!(
      refresh,
      vec![ImageRefresh {
        key: "p-1:20".to_string(),
        path: "images/new.png".to_string(),
      }]
    );
  }

  #[test]
  fn test_merge_skips_refresh_when_nothing_changed() {
    let mut same = plant("p-1", "Ficus", 10);
    same.image = Some("images/a.png".to_string());
    let (_, refresh) = merge_plants(vec![same.clone()], &changes(vec![same], vec![], 1));
    assert!(refresh.is_empty());
  }

  fn engine_against(server: &StubServer) -> (Arc<SyncEngine>, LocalStore) {
    let http = reqwest::Client::new();
    let base: Url = server.base();
    let store = LocalStore::new(Arc::new(MemoryBackend::new()));
    let monitor = Arc::new(
      ConnectivityMonitor::new(http.clone(), &base, Duration::from_secs(1), 2).unwrap(),
    );
    let cache = CacheLayer::new(
      http.clone(),
      Arc::new(MemoryResponseStore::new()),
      Duration::from_secs(1),
    );
    let outbox = Arc::new(Outbox::new(store.clone()));
    let api = ApiClient::new(
      base,
      http,
      cache,
      monitor,
      Some(outbox.clone()),
      Duration::from_secs(1),
    );
    (
      Arc::new(SyncEngine::new(api, store.clone(), outbox)),
      store,
    )
  }

  fn sync_stub(first_rev: i64) -> impl Fn(&str, &str, &str) -> StubResponse + Send + Sync {
    move |_, path, _| {
      if let Some(since) = path.strip_prefix("/plants/changes?since=") {
        let since: i64 = since.parse().unwrap_or(0);
        if since < first_rev {
          return StubResponse::json(format!(
            r#"{{"plants":[{{"id":"p-1","name":"Ficus","updatedAt":5}}],"deleted":[],"serverRev":{}}}"#,
            first_rev
          ));
        }
        return StubResponse::json(format!(
          r#"{{"plants":[],"deleted":[],"serverRev":{}}}"#,
          first_rev
        ));
      }
      match path {
        "/locations" => StubResponse::json(r#"["Salon"]"#),
        "/lastClickedTimes" => StubResponse::json("{}"),
        _ => StubResponse::not_found(),
      }
    }
  }

  #[tokio::test]
  async fn test_pull_is_idempotent() {
    let server = StubServer::start(sync_stub(7)).await;
    let (engine, store) = engine_against(&server);

    let first = engine.sync().await.unwrap();
    assert_eq!(first.upserts, 1);
    assert_eq!(first.server_rev, 7);

    let plants_after_first = store.read_plants().unwrap();
    let meta_after_first = store.read_sync_meta().unwrap();

    let second = engine.sync().await.unwrap();
    assert_eq!(second.upserts, 0);
    assert_eq!(second.server_rev, 7);
    assert_eq!(store.read_plants().unwrap(), plants_after_first);
    assert_eq!(
      store.read_sync_meta().unwrap().last_server_rev,
      meta_after_first.last_server_rev
    );
  }

  #[tokio::test]
  async fn test_failed_pull_leaves_meta_unchanged() {
    // Changes endpoint answers, /locations does not exist -> pass aborts
    let server = StubServer::start(|_, path, _| {
      if path.starts_with("/plants/changes") {
        StubResponse::json(r#"{"plants":[],"deleted":[],"serverRev":9}"#)
      } else {
        StubResponse::not_found()
      }
    })
    .await;
    let (engine, store) = engine_against(&server);

    assert!(engine.sync().await.is_err());
    assert_eq!(store.read_sync_meta().unwrap(), SyncMeta::default());
  }

  #[tokio::test]
  async fn test_sync_refreshes_changed_image() {
    let server = StubServer::start(|_, path, _| {
      if path.starts_with("/plants/changes") {
        StubResponse::json(
          r#"{"plants":[{"id":"p-1","name":"Ficus","image":"images/ficus.png","updatedAt":5}],"deleted":[],"serverRev":1}"#,
        )
      } else if path == "/images/ficus.png" {
        StubResponse {
          status: 200,
          content_type: "image/png".to_string(),
          body: "PNGBYTES".to_string(),
        }
      } else if path == "/locations" {
        StubResponse::json("[]")
      } else if path == "/lastClickedTimes" {
        StubResponse::json("{}")
      } else {
        StubResponse::not_found()
      }
    })
    .await;
    let (engine, store) = engine_against(&server);

    engine.sync().await.unwrap();

    // The refresh task runs in the background
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(store.read_image("p-1:5").unwrap().unwrap(), b"PNGBYTES");
  }
}
