//! HTTP client for the plant care backend.
//!
//! Every outcome is classified before it reaches a caller: transport
//! failures (including timeouts) downgrade to offline handling, non-2xx
//! statuses surface as application errors, and unparseable payloads
//! surface as format errors. Mutations attempted while offline are
//! captured by the outbox instead of being dropped.

use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

use crate::cache::{CacheLayer, CacheSource, CachedResponse, FetchOutcome};
use crate::connectivity::ConnectivityMonitor;
use crate::outbox::{Outbox, OutboxOp};

use super::error::ApiError;
use super::types::{ActionTimes, ChangesResponse, ClickResponse, Method, Plant};

#[derive(Clone)]
pub struct ApiClient {
  base: Url,
  http: reqwest::Client,
  cache: CacheLayer,
  timeout: Duration,
  connectivity: Arc<ConnectivityMonitor>,
  outbox: Option<Arc<Outbox>>,
}

impl ApiClient {
  pub fn new(
    base: Url,
    http: reqwest::Client,
    cache: CacheLayer,
    connectivity: Arc<ConnectivityMonitor>,
    outbox: Option<Arc<Outbox>>,
    timeout: Duration,
  ) -> Self {
    Self {
      base,
      http,
      cache,
      timeout,
      connectivity,
      outbox,
    }
  }

  /// Issue one classified request.
  ///
  /// Known-offline mutations are enqueued without touching the network.
  /// GETs are routed through the interception cache layer, so a cached
  /// response may be served without a network round trip.
  pub async fn call(
    &self,
    method: Method,
    path: &str,
    body: Option<Value>,
  ) -> Result<Value, ApiError> {
    if self.connectivity.is_offline() {
      if method.is_mutating() {
        return Err(self.defer(method, path, body));
      }
      return Err(ApiError::Offline { queued: false });
    }

    let url = self.join(path)?;
    let outcome = if method == Method::Get {
      self.cache.get(&url).await
    } else {
      self.request(method, url, body.as_ref()).await
    };

    match outcome {
      Ok(outcome) => self.classify(outcome),
      Err(err) => {
        tracing::debug!(method = %method, path, error = %err, "transport failure");
        if method.is_mutating() {
          Err(self.defer(method, path, body))
        } else {
          Err(ApiError::Offline { queued: false })
        }
      }
    }
  }

  /// Replay a queued mutation. Never re-enqueues: a transport failure here
  /// leaves the op where it is for the next flush.
  pub async fn replay(&self, op: &OutboxOp) -> Result<Value, ApiError> {
    let url = self.join(&op.url)?;
    let outcome = self
      .request(op.method, url, op.body.as_ref())
      .await
      .map_err(|err| {
        tracing::debug!(url = %op.url, error = %err, "replay transport failure");
        ApiError::Offline { queued: false }
      })?;
    self.classify(outcome)
  }

  /// Fetch raw bytes (images) through the cache layer.
  pub async fn get_bytes(&self, path: &str) -> Result<Vec<u8>, ApiError> {
    let path = normalize_path(path);
    let url = self.join(&path)?;
    let outcome = self
      .cache
      .get(&url)
      .await
      .map_err(|_| ApiError::Offline { queued: false })?;

    if outcome.source == CacheSource::Network {
      self.connectivity.observe_success();
    }
    let response = outcome.response;
    if !response.is_success() {
      return Err(status_error(&response));
    }
    Ok(response.body)
  }

  // Typed endpoints

  pub async fn get_plants(&self) -> Result<Vec<Plant>, ApiError> {
    parse(self.call(Method::Get, "/plants", None).await?)
  }

  pub async fn get_plant(&self, name: &str) -> Result<Plant, ApiError> {
    let path = format!("/plants/{}", urlencoding::encode(name));
    parse(self.call(Method::Get, &path, None).await?)
  }

  pub async fn changes(&self, since: i64) -> Result<ChangesResponse, ApiError> {
    let path = format!("/plants/changes?since={}", since);
    parse(self.call(Method::Get, &path, None).await?)
  }

  pub async fn create_plant(&self, plant: &Plant) -> Result<Plant, ApiError> {
    let body = serde_json::to_value(plant)
      .map_err(|e| ApiError::Format(format!("unserializable plant: {}", e)))?;
    parse(self.call(Method::Post, "/plants", Some(body)).await?)
  }

  pub async fn update_plant(&self, name: &str, patch: Value) -> Result<Plant, ApiError> {
    let path = format!("/plants/{}", urlencoding::encode(name));
    parse(self.call(Method::Put, &path, Some(patch)).await?)
  }

  pub async fn delete_plant(&self, name: &str) -> Result<Plant, ApiError> {
    let path = format!("/plants/{}", urlencoding::encode(name));
    parse(self.call(Method::Delete, &path, None).await?)
  }

  pub async fn get_locations(&self) -> Result<Vec<String>, ApiError> {
    parse(self.call(Method::Get, "/locations", None).await?)
  }

  pub async fn add_location(&self, name: &str) -> Result<(), ApiError> {
    let body = serde_json::json!({ "name": name });
    self.call(Method::Post, "/locations", Some(body)).await?;
    Ok(())
  }

  pub async fn remove_location(&self, name: &str) -> Result<(), ApiError> {
    let path = format!("/locations/{}", urlencoding::encode(name));
    self.call(Method::Delete, &path, None).await?;
    Ok(())
  }

  pub async fn get_times(&self) -> Result<ActionTimes, ApiError> {
    parse(self.call(Method::Get, "/lastClickedTimes", None).await?)
  }

  pub async fn clicked(&self, button_id: &str) -> Result<ClickResponse, ApiError> {
    let body = serde_json::json!({ "buttonId": button_id });
    parse(self.call(Method::Post, "/clicked", Some(body)).await?)
  }

  pub async fn undo(
    &self,
    button_id: &str,
    previous_time: Option<&str>,
  ) -> Result<ClickResponse, ApiError> {
    let body = serde_json::json!({ "buttonId": button_id, "previousTime": previous_time });
    parse(self.call(Method::Post, "/undo", Some(body)).await?)
  }

  // Internals

  fn join(&self, path: &str) -> Result<Url, ApiError> {
    self
      .base
      .join(path)
      .map_err(|e| ApiError::Format(format!("invalid request path {}: {}", path, e)))
  }

  /// Direct network request, bypassing the cache layer (mutations, replay).
  async fn request(
    &self,
    method: Method,
    url: Url,
    body: Option<&Value>,
  ) -> Result<FetchOutcome, reqwest::Error> {
    let reqwest_method = match method {
      Method::Get => reqwest::Method::GET,
      Method::Post => reqwest::Method::POST,
      Method::Put => reqwest::Method::PUT,
      Method::Delete => reqwest::Method::DELETE,
    };

    let mut request = self
      .http
      .request(reqwest_method, url)
      .timeout(self.timeout);
    if let Some(body) = body {
      request = request
        .header(reqwest::header::CONTENT_TYPE, "application/json")
        .body(body.to_string());
    }

    let resp = request.send().await?;
    let status = resp.status().as_u16();
    let content_type = resp
      .headers()
      .get(reqwest::header::CONTENT_TYPE)
      .and_then(|v| v.to_str().ok())
      .map(String::from);
    let body = resp.bytes().await?.to_vec();

    Ok(FetchOutcome {
      response: CachedResponse {
        status,
        content_type,
        body,
        cached_at: chrono::Utc::now(),
      },
      source: CacheSource::Network,
    })
  }

  /// Classify a fetched response per the error taxonomy.
  fn classify(&self, outcome: FetchOutcome) -> Result<Value, ApiError> {
    // Cache-served responses say nothing about current reachability
    if outcome.source == CacheSource::Network {
      self.connectivity.observe_success();
    }

    let response = outcome.response;
    if !response.is_success() {
      return Err(status_error(&response));
    }

    let content_type = response.content_type.as_deref().unwrap_or_default();
    if !content_type.contains("application/json") {
      let preview: String = String::from_utf8_lossy(&response.body)
        .chars()
        .take(200)
        .collect();
      return Err(ApiError::Format(format!(
        "expected JSON, got {}: {}",
        if content_type.is_empty() { "no content type" } else { content_type },
        preview.trim()
      )));
    }

    if response.body.is_empty() {
      return Ok(Value::Null);
    }
    serde_json::from_slice(&response.body).map_err(|e| ApiError::Format(e.to_string()))
  }

  /// Capture a mutation in the outbox, when one is attached.
  fn defer(&self, method: Method, path: &str, body: Option<Value>) -> ApiError {
    match &self.outbox {
      Some(outbox) => match outbox.enqueue(OutboxOp::new(method, path, body)) {
        Ok(()) => ApiError::Offline { queued: true },
        Err(err) => {
          tracing::error!(error = %err, "failed to queue offline mutation");
          ApiError::Offline { queued: false }
        }
      },
      None => ApiError::Offline { queued: false },
    }
  }
}

fn status_error(response: &CachedResponse) -> ApiError {
  ApiError::Status {
    status: response.status,
    message: String::from_utf8_lossy(&response.body).trim().to_string(),
  }
}

fn parse<T: DeserializeOwned>(value: Value) -> Result<T, ApiError> {
  serde_json::from_value(value).map_err(|e| ApiError::Format(format!("response shape: {}", e)))
}

fn normalize_path(path: &str) -> String {
  if path.starts_with('/') {
    path.to_string()
  } else {
    format!("/{}", path)
  }
}
