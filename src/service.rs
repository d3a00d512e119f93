//! The facade the CLI talks to.
//!
//! Reads are local-first: the replica always has something to return, and
//! a successful fetch refreshes it on the way through. Mutations are
//! optimistic while offline: the change lands in the replica immediately
//! and the queued op brings the server up to date on reconnect.

use color_eyre::{eyre::eyre, Result};
use serde_json::Value;
use std::sync::Arc;

use crate::api::types::{ActionTimes, Plant};
use crate::api::{ApiClient, ApiError};
use crate::connectivity::{ConnState, ConnectivityMonitor};
use crate::outbox::Outbox;
use crate::store::LocalStore;

/// A mutation result; `queued` is true when the op waits in the outbox.
#[derive(Debug, Clone)]
pub struct Applied<T> {
  pub value: T,
  pub queued: bool,
}

#[derive(Debug, Clone)]
pub struct StatusInfo {
  pub state: ConnState,
  pub pending_ops: usize,
  pub last_sync_at: Option<i64>,
  pub backend: &'static str,
}

pub struct PlantService {
  api: ApiClient,
  store: LocalStore,
  outbox: Arc<Outbox>,
  connectivity: Arc<ConnectivityMonitor>,
}

impl PlantService {
  pub fn new(
    api: ApiClient,
    store: LocalStore,
    outbox: Arc<Outbox>,
    connectivity: Arc<ConnectivityMonitor>,
  ) -> Self {
    Self {
      api,
      store,
      outbox,
      connectivity,
    }
  }

  // Reads

  /// All plants: fresh from the server when reachable, the replica
  /// otherwise. Archived records are filtered here, not in the store.
  pub async fn plants(&self) -> Result<Vec<Plant>> {
    match self.api.get_plants().await {
      Ok(remote) => {
        self.write_through_plants(&remote)?;
        Ok(remote)
      }
      Err(err) if err.is_offline() => {
        let replica = self.store.read_plants()?;
        Ok(replica.into_iter().filter(|p| !p.archived).collect())
      }
      Err(err) => Err(err.into()),
    }
  }

  pub async fn plant(&self, name: &str) -> Result<Plant> {
    match self.api.get_plant(name).await {
      Ok(remote) => {
        self.write_through_plants(std::slice::from_ref(&remote))?;
        Ok(remote)
      }
      Err(err) if err.is_offline() => self
        .store
        .read_plants()?
        .into_iter()
        .find(|p| p.name == name)
        .ok_or_else(|| eyre!("Plant {} is not in the local replica (offline)", name)),
      Err(err) => Err(err.into()),
    }
  }

  pub async fn locations(&self) -> Result<Vec<String>> {
    match self.api.get_locations().await {
      Ok(remote) => {
        self.store.write_locations(&remote)?;
        Ok(remote)
      }
      Err(err) if err.is_offline() => self.store.read_locations(),
      Err(err) => Err(err.into()),
    }
  }

  pub async fn times(&self) -> Result<ActionTimes> {
    match self.api.get_times().await {
      Ok(remote) => {
        self.store.write_times(&remote)?;
        Ok(remote)
      }
      Err(err) if err.is_offline() => self.store.read_times(),
      Err(err) => Err(err.into()),
    }
  }

  /// Image bytes for a plant, keyed by `(identity, updatedAt)` so a
  /// content change never serves the previous version's bytes.
  pub async fn image(&self, plant: &Plant) -> Result<Option<Vec<u8>>> {
    let Some(path) = &plant.image else {
      return Ok(None);
    };

    let key = plant.image_cache_key();
    if let Some(bytes) = self.store.read_image(&key)? {
      return Ok(Some(bytes));
    }

    match self.api.get_bytes(path).await {
      Ok(bytes) => {
        self.store.write_image(&key, &bytes)?;
        Ok(Some(bytes))
      }
      Err(err) if err.is_offline() => Ok(None),
      Err(err) => Err(err.into()),
    }
  }

  // Mutations

  pub async fn create_plant(&self, plant: Plant) -> Result<Applied<Plant>> {
    let replica = self.store.read_plants()?;
    if replica
      .iter()
      .any(|p| p.name == plant.name && !p.archived)
    {
      return Err(eyre!("A plant named {} already exists", plant.name));
    }

    match self.api.create_plant(&plant).await {
      Ok(created) => {
        self.write_through_plants(std::slice::from_ref(&created))?;
        Ok(Applied {
          value: created,
          queued: false,
        })
      }
      Err(err) if err.was_queued() => {
        let mut local = plant;
        local.id = Some(temp_id());
        local.updated_at = now_ms();
        self.store.upsert_plant(&local)?;
        Ok(Applied {
          value: local,
          queued: true,
        })
      }
      Err(err) => Err(offline_or(err)),
    }
  }

  /// Partial update; `patch` holds camelCase fields as the server expects
  /// them. Archiving prunes the plant's action timestamps.
  pub async fn update_plant(&self, name: &str, patch: Value) -> Result<Applied<Plant>> {
    match self.api.update_plant(name, patch.clone()).await {
      Ok(updated) => {
        self.write_through_plants(std::slice::from_ref(&updated))?;
        if updated.archived {
          self.prune_times_for(name)?;
        }
        Ok(Applied {
          value: updated,
          queued: false,
        })
      }
      Err(err) if err.was_queued() => {
        let mut plants = self.store.read_plants()?;
        let existing = plants
          .iter_mut()
          .find(|p| p.name == name)
          .ok_or_else(|| eyre!("Plant {} is not in the local replica (offline)", name))?;

        let mut patched = apply_patch(existing, &patch)?;
        patched.updated_at = now_ms();
        *existing = patched.clone();
        self.store.write_plants(&plants)?;

        if patched.archived {
          self.prune_times_for(name)?;
        }
        Ok(Applied {
          value: patched,
          queued: true,
        })
      }
      Err(err) => Err(offline_or(err)),
    }
  }

  pub async fn archive_plant(&self, name: &str) -> Result<Applied<Plant>> {
    self
      .update_plant(name, serde_json::json!({ "archived": true }))
      .await
  }

  /// Hard delete: unlike archival this removes the record from the
  /// replica.
  pub async fn delete_plant(&self, name: &str) -> Result<Applied<()>> {
    let queued = match self.api.delete_plant(name).await {
      Ok(_) => false,
      Err(err) if err.was_queued() => true,
      Err(err) => return Err(offline_or(err)),
    };

    let mut plants = self.store.read_plants()?;
    plants.retain(|p| p.name != name);
    self.store.write_plants(&plants)?;
    self.prune_times_for(name)?;

    Ok(Applied { value: (), queued })
  }

  pub async fn add_location(&self, name: &str) -> Result<Applied<()>> {
    let queued = match self.api.add_location(name).await {
      Ok(()) => false,
      Err(err) if err.was_queued() => true,
      Err(err) => return Err(offline_or(err)),
    };

    let mut locations = self.store.read_locations()?;
    if !locations.iter().any(|l| l == name) {
      locations.push(name.to_string());
      self.store.write_locations(&locations)?;
    }
    Ok(Applied { value: (), queued })
  }

  pub async fn remove_location(&self, name: &str) -> Result<Applied<()>> {
    let queued = match self.api.remove_location(name).await {
      Ok(()) => false,
      Err(err) if err.was_queued() => true,
      Err(err) => return Err(offline_or(err)),
    };

    let mut locations = self.store.read_locations()?;
    locations.retain(|l| l != name);
    self.store.write_locations(&locations)?;
    Ok(Applied { value: (), queued })
  }

  pub async fn water(&self, name: &str) -> Result<Applied<Option<String>>> {
    self.record_action(&action_key("water", name)).await
  }

  pub async fn feed(&self, name: &str) -> Result<Applied<Option<String>>> {
    self.record_action(&action_key("feed", name)).await
  }

  pub async fn undo_water(
    &self,
    name: &str,
    previous: Option<String>,
  ) -> Result<Applied<Option<String>>> {
    self.undo_action(&action_key("water", name), previous).await
  }

  pub async fn undo_feed(
    &self,
    name: &str,
    previous: Option<String>,
  ) -> Result<Applied<Option<String>>> {
    self.undo_action(&action_key("feed", name), previous).await
  }

  pub fn status(&self) -> Result<StatusInfo> {
    Ok(StatusInfo {
      state: self.connectivity.state(),
      pending_ops: self.outbox.len()?,
      last_sync_at: self.store.read_sync_meta()?.last_sync_at,
      backend: self.store.backend_kind(),
    })
  }

  // Internals

  async fn record_action(&self, key: &str) -> Result<Applied<Option<String>>> {
    match self.api.clicked(key).await {
      Ok(resp) => {
        self.set_time(key, resp.last_clicked_time.clone())?;
        Ok(Applied {
          value: resp.last_clicked_time,
          queued: false,
        })
      }
      Err(err) if err.was_queued() => {
        // Stamp now locally; the server will assign its own time on replay
        let now = chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true);
        self.set_time(key, Some(now.clone()))?;
        Ok(Applied {
          value: Some(now),
          queued: true,
        })
      }
      Err(err) => Err(offline_or(err)),
    }
  }

  async fn undo_action(
    &self,
    key: &str,
    previous: Option<String>,
  ) -> Result<Applied<Option<String>>> {
    match self.api.undo(key, previous.as_deref()).await {
      Ok(resp) => {
        self.set_time(key, resp.last_clicked_time.clone())?;
        Ok(Applied {
          value: resp.last_clicked_time,
          queued: false,
        })
      }
      Err(err) if err.was_queued() => {
        self.set_time(key, previous.clone())?;
        Ok(Applied {
          value: previous,
          queued: true,
        })
      }
      Err(err) => Err(offline_or(err)),
    }
  }

  fn set_time(&self, key: &str, value: Option<String>) -> Result<()> {
    let mut times = self.store.read_times()?;
    match value {
      Some(time) => {
        times.insert(key.to_string(), time);
      }
      None => {
        times.remove(key);
      }
    }
    self.store.write_times(&times)
  }

  fn prune_times_for(&self, name: &str) -> Result<()> {
    let mut times = self.store.read_times()?;
    times.retain(|key, _| key.split_once(':').map(|(_, owner)| owner) != Some(name));
    self.store.write_times(&times)
  }

  /// Merge fetched records into the replica without regressing versions
  /// and without dropping records the fetch does not mention (the server
  /// omits archived plants from collection reads).
  fn write_through_plants(&self, fetched: &[Plant]) -> Result<()> {
    let mut replica = self.store.read_plants()?;
    for remote in fetched {
      match replica
        .iter_mut()
        .find(|p| p.merge_key() == remote.merge_key())
      {
        Some(existing) => {
          if remote.updated_at >= existing.updated_at {
            *existing = remote.clone();
          }
        }
        None => replica.push(remote.clone()),
      }
    }
    self.store.write_plants(&replica)
  }
}

fn action_key(kind: &str, name: &str) -> String {
  format!("{}:{}", kind, name)
}

fn temp_id() -> String {
  format!("local-{}", now_ms())
}

fn now_ms() -> i64 {
  chrono::Utc::now().timestamp_millis()
}

/// An offline error that failed to queue has no recovery path; everything
/// else is surfaced as-is.
fn offline_or(err: ApiError) -> color_eyre::Report {
  if err.is_offline() {
    eyre!("Offline and the mutation could not be queued")
  } else {
    err.into()
  }
}

fn apply_patch(plant: &Plant, patch: &Value) -> Result<Plant> {
  let mut value = serde_json::to_value(plant)?;
  if let (Some(obj), Some(patch_obj)) = (value.as_object_mut(), patch.as_object()) {
    for (key, field) in patch_obj {
      obj.insert(key.clone(), field.clone());
    }
  }
  Ok(serde_json::from_value(value)?)
}
