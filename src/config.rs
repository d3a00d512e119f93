use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
  pub server: ServerConfig,
  pub sync: SyncConfig,
  pub cache: CacheConfig,
  /// Override for the data directory (database, HTTP cache, logs).
  pub data_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
  /// Base URL of the backend, e.g. "http://192.168.1.31:3000"
  pub url: String,
  /// Per-request timeout in seconds; a timed-out request counts as a
  /// transport failure.
  pub request_timeout_secs: u64,
  /// Timeout for the connectivity probe against /ping.
  pub probe_timeout_secs: u64,
  /// Consecutive probe failures required to flip online -> offline.
  pub probe_failure_threshold: u32,
  /// Probe cadence in watch mode.
  pub probe_interval_secs: u64,
}

impl Default for ServerConfig {
  fn default() -> Self {
    Self {
      url: "http://localhost:3000".to_string(),
      request_timeout_secs: 3,
      probe_timeout_secs: 2,
      probe_failure_threshold: 2,
      probe_interval_secs: 30,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
  /// Fixed sync interval while online in watch mode.
  pub interval_secs: u64,
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self { interval_secs: 300 }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  /// Maximum number of cached image blobs before the oldest are evicted.
  pub image_max_entries: usize,
  /// Maximum age of a cached image blob in days.
  pub image_max_age_days: i64,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      image_max_entries: 200,
      image_max_age_days: 30,
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./verdant.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/verdant/config.yaml
  ///
  /// A missing config file is not an error; every field has a default.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    let mut config = match path {
      Some(p) => Self::load_from_path(&p)?,
      None => Config::default(),
    };

    if let Ok(server) = std::env::var("VERDANT_SERVER") {
      if !server.trim().is_empty() {
        config.server.url = server.trim().to_string();
      }
    }

    Ok(config)
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("verdant.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("verdant").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    let config: Config = serde_yaml::from_str(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))?;

    Ok(config)
  }

  /// Directory holding the local database, HTTP cache and logs.
  pub fn data_dir(&self) -> Result<PathBuf> {
    if let Some(dir) = &self.data_dir {
      return Ok(dir.clone());
    }

    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("verdant"))
  }

  pub fn request_timeout(&self) -> Duration {
    Duration::from_secs(self.server.request_timeout_secs)
  }

  pub fn probe_timeout(&self) -> Duration {
    Duration::from_secs(self.server.probe_timeout_secs)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_defaults() {
    let config = Config::default();
    assert_eq!(config.server.url, "http://localhost:3000");
    assert_eq!(config.server.probe_failure_threshold, 2);
    assert_eq!(config.cache.image_max_entries, 200);
    assert_eq!(config.sync.interval_secs, 300);
  }

  #[test]
  fn test_partial_yaml_keeps_defaults() {
    let config: Config = serde_yaml::from_str(
      "server:\n  url: http://10.0.0.2:2000\n  probe_failure_threshold: 3\n",
    )
    .unwrap();
    assert_eq!(config.server.url, "http://10.0.0.2:2000");
    assert_eq!(config.server.probe_failure_threshold, 3);
    // Untouched sections fall back to defaults
    assert_eq!(config.server.request_timeout_secs, 3);
    assert_eq!(config.cache.image_max_age_days, 30);
  }

  #[test]
  fn test_missing_explicit_path_is_an_error() {
    assert!(Config::load(Some(Path::new("/nonexistent/verdant.yaml"))).is_err());
  }
}
