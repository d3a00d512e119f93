//! Cache layer that applies route policies around network fetching.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

use super::policy::{cache_key, route_policy, Policy};
use super::storage::{CachedResponse, ResponseStore, BUCKET_API, BUCKET_IMG};

/// Where the returned response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Fresh response from the network.
  Network,
  /// Cached response; a background refresh may be in flight.
  Cache,
  /// Cached response served because the network attempt failed.
  Fallback,
}

/// A response plus metadata about its origin.
#[derive(Debug, Clone)]
pub struct FetchOutcome {
  pub response: CachedResponse,
  pub source: CacheSource,
}

/// Route-policy-aware GET fetcher used by the API gateway.
///
/// Only successful responses are written to the cache; classification of
/// statuses and payloads stays with the gateway above.
pub struct CacheLayer {
  http: reqwest::Client,
  store: Arc<dyn ResponseStore>,
  timeout: Duration,
  image_max_entries: usize,
  image_max_age_secs: i64,
}

impl CacheLayer {
  pub fn new(http: reqwest::Client, store: Arc<dyn ResponseStore>, timeout: Duration) -> Self {
    Self {
      http,
      store,
      timeout,
      image_max_entries: 200,
      image_max_age_secs: 30 * 24 * 60 * 60,
    }
  }

  /// Set the image route cache bounds (count and age).
  pub fn with_image_bounds(mut self, max_entries: usize, max_age_secs: i64) -> Self {
    self.image_max_entries = max_entries;
    self.image_max_age_secs = max_age_secs;
    self
  }

  /// Fetch a GET URL under its route policy. The error is a transport
  /// failure with nothing cached to fall back on.
  pub async fn get(&self, url: &Url) -> Result<FetchOutcome, reqwest::Error> {
    let key = cache_key(url);

    match route_policy(url.path()) {
      Policy::StaleWhileRevalidate => {
        if let Some(cached) = self.lookup(&key) {
          tracing::debug!(url = %url, "serving cached response, revalidating in background");
          self.spawn_revalidate(url.clone(), key);
          return Ok(FetchOutcome {
            response: cached,
            source: CacheSource::Cache,
          });
        }

        let response = self.network(url).await?;
        self.store_success(&key, BUCKET_API, &response);
        Ok(FetchOutcome {
          response,
          source: CacheSource::Network,
        })
      }

      Policy::CacheFirst => {
        if let Some(cached) = self.lookup(&key) {
          let age = Utc::now() - cached.cached_at;
          if age.num_seconds() <= self.image_max_age_secs {
            return Ok(FetchOutcome {
              response: cached,
              source: CacheSource::Cache,
            });
          }
        }

        let response = self.network(url).await?;
        if response.is_success() {
          self.store_success(&key, BUCKET_IMG, &response);
          if let Err(err) =
            self
              .store
              .prune(BUCKET_IMG, self.image_max_entries, self.image_max_age_secs)
          {
            tracing::warn!(error = %err, "image cache prune failed");
          }
        }
        Ok(FetchOutcome {
          response,
          source: CacheSource::Network,
        })
      }

      Policy::NetworkFirst => match self.network(url).await {
        Ok(response) => {
          self.store_success(&key, BUCKET_API, &response);
          Ok(FetchOutcome {
            response,
            source: CacheSource::Network,
          })
        }
        Err(err) => match self.lookup(&key) {
          Some(cached) => {
            tracing::debug!(url = %url, "network failed, serving cached fallback");
            Ok(FetchOutcome {
              response: cached,
              source: CacheSource::Fallback,
            })
          }
          None => Err(err),
        },
      },
    }
  }

  async fn network(&self, url: &Url) -> Result<CachedResponse, reqwest::Error> {
    let resp = self
      .http
      .get(url.clone())
      .timeout(self.timeout)
      .send()
      .await?;

    let status = resp.status().as_u16();
    let content_type = resp
      .headers()
      .get(reqwest::header::CONTENT_TYPE)
      .and_then(|v| v.to_str().ok())
      .map(String::from);
    let body = resp.bytes().await?.to_vec();

    Ok(CachedResponse {
      status,
      content_type,
      body,
      cached_at: Utc::now(),
    })
  }

  /// Cache lookup; storage errors degrade to a miss.
  fn lookup(&self, key: &str) -> Option<CachedResponse> {
    match self.store.get(key) {
      Ok(cached) => cached,
      Err(err) => {
        tracing::warn!(error = %err, "response cache read failed");
        None
      }
    }
  }

  fn store_success(&self, key: &str, bucket: &str, response: &CachedResponse) {
    if !response.is_success() {
      return;
    }
    if let Err(err) = self.store.put(
      key,
      bucket,
      response.status,
      response.content_type.as_deref(),
      &response.body,
    ) {
      tracing::warn!(error = %err, "response cache write failed");
    }
  }

  fn spawn_revalidate(&self, url: Url, key: String) {
    let layer = self.clone();
    tokio::spawn(async move {
      match layer.network(&url).await {
        Ok(response) => layer.store_success(&key, BUCKET_API, &response),
        Err(err) => tracing::debug!(url = %url, error = %err, "background revalidation failed"),
      }
    });
  }
}

impl Clone for CacheLayer {
  fn clone(&self) -> Self {
    Self {
      http: self.http.clone(),
      store: Arc::clone(&self.store),
      timeout: self.timeout,
      image_max_entries: self.image_max_entries,
      image_max_age_secs: self.image_max_age_secs,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::storage::MemoryResponseStore;
  use crate::testutil::StubServer;

  fn layer(store: Arc<dyn ResponseStore>) -> CacheLayer {
    CacheLayer::new(reqwest::Client::new(), store, Duration::from_secs(2))
  }

  #[tokio::test]
  async fn test_swr_miss_fetches_and_caches() {
    let server = StubServer::json("/plants", r#"[{"name":"Ficus"}]"#).await;
    let store: Arc<dyn ResponseStore> = Arc::new(MemoryResponseStore::new());
    let layer = layer(store.clone());

    let url = server.url("/plants");
    let outcome = layer.get(&url).await.unwrap();
    assert_eq!(outcome.source, CacheSource::Network);
    assert_eq!(outcome.response.status, 200);

    // Cached under the URL key now
    assert!(store.get(&cache_key(&url)).unwrap().is_some());
  }

  #[tokio::test]
  async fn test_swr_hit_serves_cache_without_waiting() {
    // No server at all: a cached entry must still be served instantly
    let store: Arc<dyn ResponseStore> = Arc::new(MemoryResponseStore::new());
    let url = Url::parse("http://127.0.0.1:1/plants").unwrap();
    store
      .put(
        &cache_key(&url),
        BUCKET_API,
        200,
        Some("application/json"),
        b"[]",
      )
      .unwrap();

    let outcome = layer(store).get(&url).await.unwrap();
    assert_eq!(outcome.source, CacheSource::Cache);
    assert_eq!(outcome.response.body, b"[]");
  }

  #[tokio::test]
  async fn test_network_first_falls_back_to_cache() {
    let store: Arc<dyn ResponseStore> = Arc::new(MemoryResponseStore::new());
    let url = Url::parse("http://127.0.0.1:1/plants/Ficus").unwrap();
    store
      .put(
        &cache_key(&url),
        BUCKET_API,
        200,
        Some("application/json"),
        b"{}",
      )
      .unwrap();

    let outcome = layer(store).get(&url).await.unwrap();
    assert_eq!(outcome.source, CacheSource::Fallback);
  }

  #[tokio::test]
  async fn test_network_first_without_cache_propagates_error() {
    let store: Arc<dyn ResponseStore> = Arc::new(MemoryResponseStore::new());
    let url = Url::parse("http://127.0.0.1:1/plants/Ficus").unwrap();
    assert!(layer(store).get(&url).await.is_err());
  }

  #[tokio::test]
  async fn test_cache_first_serves_cache_without_network() {
    let store: Arc<dyn ResponseStore> = Arc::new(MemoryResponseStore::new());
    let url = Url::parse("http://127.0.0.1:1/images/ficus.png").unwrap();
    store
      .put(&cache_key(&url), BUCKET_IMG, 200, Some("image/png"), b"png")
      .unwrap();

    let outcome = layer(store).get(&url).await.unwrap();
    assert_eq!(outcome.source, CacheSource::Cache);
    assert_eq!(outcome.response.body, b"png");
  }

  #[tokio::test]
  async fn test_non_success_responses_are_not_cached() {
    let server = StubServer::status("/plants", 500, "boom").await;
    let store: Arc<dyn ResponseStore> = Arc::new(MemoryResponseStore::new());
    let layer = layer(store.clone());

    let url = server.url("/plants");
    let outcome = layer.get(&url).await.unwrap();
    assert_eq!(outcome.response.status, 500);
    assert!(store.get(&cache_key(&url)).unwrap().is_none());
  }
}
