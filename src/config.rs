//! YAML configuration and its defaults.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::api::Dataset;

/// `chrono::Duration` holds at most `i64::MAX` milliseconds.
const MAX_FRESHNESS_SECS: i64 = i64::MAX / 1000;

/// Environment variable carrying the session cookie value.
pub const SESSION_ENV: &str = "THEATRE_SYNC_SESSION";

/// Error type for configuration loading.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
  #[error("config file not found: {0}")]
  NotFound(PathBuf),

  #[error(
    "no configuration file found. Create one at ~/.config/theatre-sync/config.yaml \
     or pass --api-url"
  )]
  Missing,

  #[error("failed to read config file {path}: {source}")]
  Read {
    path: PathBuf,
    source: std::io::Error,
  },

  #[error("failed to parse config file {path}: {source}")]
  Parse {
    path: PathBuf,
    source: serde_yaml::Error,
  },

  #[error("{0} must be greater than zero")]
  ZeroInterval(&'static str),
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
  pub api: ApiConfig,
  #[serde(default)]
  pub sync: SyncConfig,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub storage: StorageConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
  pub base_url: String,
  #[serde(default = "default_timeout_secs")]
  pub timeout_secs: u64,
  /// Path probed to decide whether the API is reachable.
  #[serde(default = "default_health_path")]
  pub health_path: String,
  /// Name of the session cookie the API authenticates with.
  #[serde(default = "default_session_cookie")]
  pub session_cookie: String,
}

impl Default for ApiConfig {
  fn default() -> Self {
    Self {
      base_url: "http://localhost:3000".to_string(),
      timeout_secs: default_timeout_secs(),
      health_path: default_health_path(),
      session_cookie: default_session_cookie(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
  pub probe_interval_secs: u64,
  pub drain_interval_secs: u64,
  /// Transient replay failures tolerated before an item is dead-lettered.
  pub max_retries: u32,
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      probe_interval_secs: 10,
      drain_interval_secs: 30,
      max_retries: 5,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  pub refresh_interval_secs: u64,
  /// Age after which a cached dataset is reported as stale.
  pub freshness_secs: u64,
  pub datasets: Vec<Dataset>,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      refresh_interval_secs: 300,
      freshness_secs: 600,
      datasets: vec![Dataset::Theatres, Dataset::TodayAllocations],
    }
  }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
  /// Database file; defaults to `<data dir>/theatre-sync/offline.db`.
  pub path: Option<PathBuf>,
  /// Directory for daily log files. No file logging when unset.
  pub log_dir: Option<PathBuf>,
}

fn default_timeout_secs() -> u64 {
  15
}

fn default_health_path() -> String {
  "/api/health".to_string()
}

fn default_session_cookie() -> String {
  "next-auth.session-token".to_string()
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./theatre-sync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/theatre-sync/config.yaml
  pub fn load(explicit_path: Option<&Path>) -> Result<Self, ConfigError> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(ConfigError::NotFound(p.to_path_buf()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Err(ConfigError::Missing),
    }
  }

  /// Like [`Config::load`], but an absent file yields defaults for `base_url`.
  pub fn load_or_default(explicit_path: Option<&Path>, base_url: &str) -> Result<Self, ConfigError> {
    match Self::load(explicit_path) {
      Err(ConfigError::Missing) => Ok(Config {
        api: ApiConfig {
          base_url: base_url.to_string(),
          ..ApiConfig::default()
        },
        ..Config::default()
      }),
      other => other,
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("theatre-sync.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("theatre-sync").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
      path: path.to_path_buf(),
      source,
    })?;

    Self::from_yaml(&contents).map_err(|source| ConfigError::Parse {
      path: path.to_path_buf(),
      source,
    })
  }

  pub fn from_yaml(contents: &str) -> Result<Self, serde_yaml::Error> {
    serde_yaml::from_str(contents)
  }

  /// Reject settings the background tasks cannot run with.
  pub fn validate(&self) -> Result<(), ConfigError> {
    if self.sync.probe_interval_secs == 0 {
      return Err(ConfigError::ZeroInterval("sync.probe_interval_secs"));
    }
    if self.sync.drain_interval_secs == 0 {
      return Err(ConfigError::ZeroInterval("sync.drain_interval_secs"));
    }
    if self.cache.refresh_interval_secs == 0 {
      return Err(ConfigError::ZeroInterval("cache.refresh_interval_secs"));
    }
    Ok(())
  }

  /// Get the session cookie value from the environment, if any.
  pub fn session_token() -> Option<String> {
    std::env::var(SESSION_ENV).ok().filter(|s| !s.is_empty())
  }
}

impl SyncConfig {
  pub fn probe_interval(&self) -> Duration {
    Duration::from_secs(self.probe_interval_secs)
  }

  pub fn drain_interval(&self) -> Duration {
    Duration::from_secs(self.drain_interval_secs)
  }
}

impl CacheConfig {
  pub fn refresh_interval(&self) -> Duration {
    Duration::from_secs(self.refresh_interval_secs)
  }

  /// Freshness window, saturating at the largest span chrono can hold.
  pub fn freshness(&self) -> chrono::Duration {
    let secs = i64::try_from(self.freshness_secs)
      .unwrap_or(MAX_FRESHNESS_SECS)
      .min(MAX_FRESHNESS_SECS);
    chrono::Duration::seconds(secs)
  }
}
