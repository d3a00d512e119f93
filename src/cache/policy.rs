//! Route-scoped caching strategies.

use sha2::{Digest, Sha256};
use url::Url;

/// Caching strategy applied to a GET route.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Policy {
  /// Try the network first; on transport failure serve the cached copy.
  NetworkFirst,
  /// Serve the cached copy immediately and refresh it in the background.
  StaleWhileRevalidate,
  /// Serve from cache when present and unexpired; entries are bounded by
  /// count and age.
  CacheFirst,
}

/// Resolve the strategy for a request path.
pub fn route_policy(path: &str) -> Policy {
  match path {
    "/plants" | "/locations" | "/lastClickedTimes" => Policy::StaleWhileRevalidate,
    _ if path.starts_with("/images/") => Policy::CacheFirst,
    _ => Policy::NetworkFirst,
  }
}

/// Stable, fixed-length cache key for a request URL.
pub fn cache_key(url: &Url) -> String {
  let mut hasher = Sha256::new();
  hasher.update(url.as_str().as_bytes());
  hex::encode(hasher.finalize())
}
