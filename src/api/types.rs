//! Wire types for the plant care backend (camelCase JSON).

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// HTTP method of a gateway call or a queued mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
  Get,
  Post,
  Put,
  Delete,
}

impl Method {
  /// Non-GET requests are deferred to the outbox when offline.
  pub fn is_mutating(self) -> bool {
    !matches!(self, Method::Get)
  }
}

impl fmt::Display for Method {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let s = match self {
      Method::Get => "GET",
      Method::Post => "POST",
      Method::Put => "PUT",
      Method::Delete => "DELETE",
    };
    f.write_str(s)
  }
}

/// A plant record.
///
/// `updated_at` (epoch milliseconds, assigned by the server) is the sole
/// conflict-resolution signal: the replica never adopts a version older
/// than one it has already merged for the same identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Plant {
  /// Server-assigned stable identity; a `local-` prefixed placeholder (or
  /// None) until an offline create has been confirmed.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub id: Option<String>,
  pub name: String,
  #[serde(default)]
  pub description: String,
  /// Care frequency bands, one slot per calendar month (None = no care).
  #[serde(default)]
  pub watering_min: Vec<Option<u32>>,
  #[serde(default)]
  pub watering_max: Vec<Option<u32>>,
  #[serde(default)]
  pub feeding_min: Vec<Option<u32>>,
  #[serde(default)]
  pub feeding_max: Vec<Option<u32>>,
  /// Image reference by server path, e.g. "images/ficus.png".
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub image: Option<String>,
  /// Location reference by name.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub location: Option<String>,
  #[serde(default)]
  pub archived: bool,
  #[serde(default)]
  pub updated_at: i64,
}

impl Plant {
  pub fn new(name: impl Into<String>) -> Self {
    Self {
      id: None,
      name: name.into(),
      description: String::new(),
      watering_min: Vec::new(),
      watering_max: Vec::new(),
      feeding_min: Vec::new(),
      feeding_max: Vec::new(),
      image: None,
      location: None,
      archived: false,
      updated_at: 0,
    }
  }

  /// Identity used by the sync merge: the server id when present, the
  /// unique name for records that predate server-assigned ids. Renaming an
  /// id-less record therefore reads as delete-old + insert-new.
  pub fn merge_key(&self) -> &str {
    self.id.as_deref().unwrap_or(&self.name)
  }

  /// True while the record only exists locally (offline create not yet
  /// confirmed by the server).
  pub fn has_local_identity(&self) -> bool {
    match &self.id {
      Some(id) => id.starts_with("local-"),
      None => true,
    }
  }

  /// Key for the image blob cache. Embeds `updated_at` so any content
  /// change invalidates the key without explicit eviction.
  pub fn image_cache_key(&self) -> String {
    format!("{}:{}", self.merge_key(), self.updated_at)
  }
}

/// Map of action key (`water:<plant>`, `feed:<plant>`) to ISO timestamp.
pub type ActionTimes = BTreeMap<String, String>;

/// Payload of `GET /plants/changes?since=<rev>`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangesResponse {
  /// Upserted plants with `updatedAt > since`.
  #[serde(default)]
  pub plants: Vec<Plant>,
  /// Identities (id, or name for legacy records) deleted since `since`.
  #[serde(default)]
  pub deleted: Vec<String>,
  /// Revision to advance SyncMeta to after a successful merge.
  #[serde(default)]
  pub server_rev: i64,
}

/// Payload of `POST /clicked` and `POST /undo` responses.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClickResponse {
  pub last_clicked_time: Option<String>,
}
