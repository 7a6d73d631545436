//! Engine Configuration
//!
//! Settings for one engine instance, loaded from an optional YAML file and
//! then overridden by environment variables:
//!
//! - `WDLRUNNER_MAX_CONCURRENCY`: global concurrency limit
//! - `WDLRUNNER_RUN_ROOT`: directory under which run directories are created
//! - `WDLRUNNER_CACHE_DIR`: call cache location
//!
//! ```yaml
//! max_concurrency: 8
//! retry:
//!   max_retries: 2
//!   backoff_ms: 1000
//! call_cache:
//!   enabled: true
//!   dir: /scratch/wdl-cache
//! task_timeout_secs: 3600
//! ```

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Retry policy for transient backend failures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Attempts after the first one
    pub max_retries: u32,
    /// Delay before the first retry
    pub backoff_ms: u64,
    /// Factor applied to the delay after each retry
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            backoff_ms: 1000,
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Delay before retry number `retry` (1-based).
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = self.backoff_multiplier.max(1.0).powi(retry.saturating_sub(1) as i32);
        Duration::from_millis((self.backoff_ms as f64 * factor) as u64)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadConfig {
    pub max_retries: u32,
    pub backoff_ms: u64,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_ms: 1000,
        }
    }
}

/// Call cache settings. `get`/`put` allow a read-only or write-only cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CallCacheConfig {
    pub enabled: bool,
    pub get: bool,
    pub put: bool,
    /// Cache directory; defaults to `<run_root>/_CACHE/call`
    pub dir: Option<PathBuf>,
}

impl Default for CallCacheConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            get: true,
            put: true,
            dir: None,
        }
    }
}

/// Optional CPU/memory reservations for running calls.
///
/// Unset limits default to the host totals.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceConfig {
    pub enabled: bool,
    pub cpu: Option<u64>,
    pub memory_bytes: Option<u64>,
}

/// Engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Global limit on concurrently running declarations and calls
    pub max_concurrency: usize,
    pub retry: RetryConfig,
    pub download: DownloadConfig,
    pub call_cache: CallCacheConfig,
    /// Wall-clock limit for each call
    pub task_timeout_secs: Option<u64>,
    /// Wall-clock limit for the whole run
    pub run_timeout_secs: Option<u64>,
    pub resources: ResourceConfig,
    /// Directory under which run directories are created
    pub run_root: PathBuf,
    /// Container CLI (e.g. `docker`, `podman`) for tasks declaring an image
    pub container_cli: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_concurrency: num_cpus::get(),
            retry: RetryConfig::default(),
            download: DownloadConfig::default(),
            call_cache: CallCacheConfig::default(),
            task_timeout_secs: None,
            run_timeout_secs: None,
            resources: ResourceConfig::default(),
            run_root: PathBuf::from("."),
            container_cli: None,
        }
    }
}

impl Config {
    /// Loads configuration from a YAML file and applies environment overrides.
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read {}: {}", path.display(), e)))?;
        let mut config: Config = serde_yaml::from_str(&content)
            .map_err(|e| Error::Config(format!("failed to parse {}: {}", path.display(), e)))?;
        debug!("Loaded configuration from {}", path.display());
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Defaults plus environment overrides.
    pub fn from_env() -> Result<Self> {
        let mut config = Config::default();
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(value) = lookup("WDLRUNNER_MAX_CONCURRENCY") {
            match value.parse() {
                Ok(n) => self.max_concurrency = n,
                Err(_) => warn!("Ignoring invalid WDLRUNNER_MAX_CONCURRENCY={}", value),
            }
        }
        if let Some(root) = lookup("WDLRUNNER_RUN_ROOT") {
            self.run_root = PathBuf::from(root);
        }
        if let Some(dir) = lookup("WDLRUNNER_CACHE_DIR") {
            self.call_cache.dir = Some(PathBuf::from(dir));
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_concurrency == 0 {
            return Err(Error::Config("max_concurrency must be at least 1".into()));
        }
        if self.retry.backoff_multiplier < 1.0 {
            return Err(Error::Config("retry.backoff_multiplier must be >= 1.0".into()));
        }
        Ok(())
    }

    /// Effective call cache directory.
    pub fn cache_dir(&self) -> PathBuf {
        self.call_cache
            .dir
            .clone()
            .unwrap_or_else(|| self.run_root.join("_CACHE").join("call"))
    }

    pub fn task_timeout(&self) -> Option<Duration> {
        self.task_timeout_secs.map(Duration::from_secs)
    }

    pub fn run_timeout(&self) -> Option<Duration> {
        self.run_timeout_secs.map(Duration::from_secs)
    }
}
