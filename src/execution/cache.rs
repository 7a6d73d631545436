//! Call Cache
//!
//! Persistent store of call outputs keyed by a digest of the callee
//! definition, the canonical JSON of the resolved inputs and the backend
//! fingerprint. One JSON file per key:
//!
//! ```text
//! <cache dir>/<sha256 hex>.json
//! ```
//!
//! Entries are written once through a temporary file and a rename. An entry
//! whose `File` outputs no longer exist is treated as absent.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use sha2::{Digest, Sha256};
use tokio::fs;

use crate::config::Config;
use crate::env::Bindings;
use crate::error::Result;
use crate::value::{values_from_json, values_to_json, Type, Value};
use crate::workflow::Callee;

#[derive(Debug, Serialize, Deserialize)]
struct CacheEntry {
    key: String,
    callee: String,
    created_at: DateTime<Utc>,
    outputs: Json,
}

/// File-backed call cache.
#[derive(Debug, Clone)]
pub struct CallCache {
    dir: PathBuf,
    get: bool,
    put: bool,
}

impl CallCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            get: true,
            put: true,
        }
    }

    /// The configured cache, if enabled.
    pub fn from_config(config: &Config) -> Option<Self> {
        if !config.call_cache.enabled {
            return None;
        }
        Some(Self {
            dir: config.cache_dir(),
            get: config.call_cache.get,
            put: config.call_cache.put,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Digest identifying a call's outputs.
    pub fn key(callee: &Callee, inputs: &Bindings<Value>, fingerprint: &str) -> Result<String> {
        let mut hasher = Sha256::new();
        hasher.update(serde_json::to_vec(callee)?);
        hasher.update(b"\0");
        hasher.update(serde_json::to_vec(&values_to_json(inputs, ""))?);
        hasher.update(b"\0");
        hasher.update(fingerprint.as_bytes());
        Ok(hex::encode(hasher.finalize()))
    }

    fn entry_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", key))
    }

    /// Recorded outputs for `key`, or `None` on a miss or an unusable entry.
    pub async fn get(&self, key: &str, output_types: &Bindings<Type>) -> Option<Bindings<Value>> {
        if !self.get {
            return None;
        }
        let path = self.entry_path(key);
        let content = match fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(_) => {
                debug!("Call cache miss: {}", key);
                return None;
            }
        };
        let outputs = serde_json::from_str::<CacheEntry>(&content)
            .map_err(crate::error::Error::from)
            .and_then(|entry| values_from_json(&entry.outputs, output_types, Some(output_types), ""));
        let outputs = match outputs {
            Ok(outputs) => outputs,
            Err(e) => {
                warn!("Ignoring unreadable call cache entry {}: {}", path.display(), e);
                return None;
            }
        };

        let mut missing = None;
        for binding in outputs.iter() {
            binding.value().visit_files(&mut |file| {
                if missing.is_none() && !Path::new(file).exists() {
                    missing = Some(file.to_string());
                }
            });
        }
        if let Some(file) = missing {
            debug!("Call cache entry {} references missing file {}", key, file);
            return None;
        }
        debug!("Call cache hit: {}", key);
        Some(outputs)
    }

    /// Records outputs for `key`.
    pub async fn put(&self, key: &str, callee: &str, outputs: &Bindings<Value>) -> Result<()> {
        if !self.put {
            return Ok(());
        }
        fs::create_dir_all(&self.dir).await?;
        let entry = CacheEntry {
            key: key.to_string(),
            callee: callee.to_string(),
            created_at: Utc::now(),
            outputs: values_to_json(outputs, ""),
        };
        let path = self.entry_path(key);
        let tmp = self.dir.join(format!(".{}.tmp", key));
        fs::write(&tmp, serde_json::to_vec_pretty(&entry)?).await?;
        fs::rename(&tmp, &path).await?;
        debug!("Stored call cache entry {}", path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::{Decl, Task};
    use std::sync::Arc;
    use tempfile::tempdir;

    fn callee() -> Callee {
        Callee::Task(Arc::new(
            Task::new("t", "echo ~{x}")
                .with_input(Decl::new("x", Type::Int))
                .with_output(Decl::new("out", Type::File)),
        ))
    }

    #[test]
    fn test_key_depends_on_inputs_and_fingerprint() {
        let a = Bindings::new().bind("x", Value::Int(1));
        let b = Bindings::new().bind("x", Value::Int(2));
        let key = CallCache::key(&callee(), &a, "local").unwrap();
        assert_eq!(key.len(), 64);
        assert_eq!(key, CallCache::key(&callee(), &a, "local").unwrap());
        assert_ne!(key, CallCache::key(&callee(), &b, "local").unwrap());
        assert_ne!(key, CallCache::key(&callee(), &a, "docker:ubuntu").unwrap());
    }

    #[tokio::test]
    async fn test_put_then_get() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("out.txt");
        std::fs::write(&file, "x").unwrap();
        let cache = CallCache::new(dir.path().join("cache"));
        let types = Bindings::new().bind("out", Type::File);
        let outputs = Bindings::new().bind("out", Value::file(file.to_string_lossy()));

        assert!(cache.get("k1", &types).await.is_none());
        cache.put("k1", "t", &outputs).await.unwrap();
        assert_eq!(cache.get("k1", &types).await, Some(outputs));

        std::fs::remove_file(&file).unwrap();
        assert!(cache.get("k1", &types).await.is_none());
    }

    #[tokio::test]
    async fn test_disabled_get_and_put() {
        let dir = tempdir().unwrap();
        let mut cache = CallCache::new(dir.path());
        cache.put = false;
        let types = Bindings::new().bind("n", Type::Int);
        cache
            .put("k", "t", &Bindings::new().bind("n", Value::Int(1)))
            .await
            .unwrap();
        assert!(cache.get("k", &types).await.is_none());

        let config = Config::default();
        assert!(CallCache::from_config(&config).is_none());
    }
}
