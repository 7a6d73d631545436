//! Input File Materialization
//!
//! `File` inputs given as URIs (`scheme://...`) are fetched into the run
//! directory before the run starts, and the URI is replaced by the local
//! path:
//!
//! ```text
//! <run dir>/download/<n>/<basename>
//! ```
//!
//! Fetchers are pluggable; [`LocalFetcher`] handles `file://`. Transient
//! fetch failures are retried with backoff; a URI that still cannot be
//! fetched fails the run with [`Error::DownloadFailed`].

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{info, warn};
use tokio::fs;

use crate::config::DownloadConfig;
use crate::env::Bindings;
use crate::error::{Error, Result};
use crate::value::Value;

#[derive(Debug, Clone, thiserror::Error)]
pub enum FetchError {
    #[error("transient fetch failure: {0}")]
    Transient(String),
    #[error("{0}")]
    Permanent(String),
}

/// Downloads one URI into a directory.
#[async_trait]
pub trait FileFetcher: Send + Sync {
    /// URI schemes handled, without `://`
    fn schemes(&self) -> &[&str];

    /// Fetches `uri` into `dest_dir`, returning the local file path.
    async fn fetch(&self, uri: &str, dest_dir: &Path) -> std::result::Result<PathBuf, FetchError>;
}

/// Copies `file://` URIs.
#[derive(Debug, Default, Clone)]
pub struct LocalFetcher;

#[async_trait]
impl FileFetcher for LocalFetcher {
    fn schemes(&self) -> &[&str] {
        &["file"]
    }

    async fn fetch(&self, uri: &str, dest_dir: &Path) -> std::result::Result<PathBuf, FetchError> {
        let source = PathBuf::from(uri.trim_start_matches("file://"));
        let name = source
            .file_name()
            .ok_or_else(|| FetchError::Permanent(format!("no file name in {}", uri)))?;
        let dest = dest_dir.join(name);
        fs::copy(&source, &dest)
            .await
            .map_err(|e| FetchError::Permanent(format!("{}: {}", source.display(), e)))?;
        Ok(dest)
    }
}

/// The scheme of `text` if it looks like `scheme://...`.
pub fn uri_scheme(text: &str) -> Option<&str> {
    let (scheme, rest) = text.split_once("://")?;
    let valid = !scheme.is_empty()
        && !rest.is_empty()
        && scheme
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '+' || c == '-' || c == '.');
    valid.then_some(scheme)
}

/// Materializes URI inputs with a set of fetchers.
pub struct Downloader {
    fetchers: Vec<Arc<dyn FileFetcher>>,
    config: DownloadConfig,
}

impl Downloader {
    pub fn new(config: DownloadConfig) -> Self {
        Self {
            fetchers: vec![Arc::new(LocalFetcher)],
            config,
        }
    }

    pub fn with_fetcher(mut self, fetcher: Arc<dyn FileFetcher>) -> Self {
        self.fetchers.push(fetcher);
        self
    }

    fn fetcher(&self, scheme: &str) -> Option<&Arc<dyn FileFetcher>> {
        self.fetchers
            .iter()
            .rev()
            .find(|f| f.schemes().contains(&scheme))
    }

    /// Replaces every URI-valued `File` in `inputs` by a downloaded copy
    /// under `<run_dir>/download`. Each distinct URI is fetched once.
    pub async fn materialize(&self, inputs: Bindings<Value>, run_dir: &Path) -> Result<Bindings<Value>> {
        let mut uris: Vec<String> = Vec::new();
        for binding in inputs.iter() {
            binding.value().visit_files(&mut |file| {
                if uri_scheme(file).is_some() && !uris.iter().any(|u| u == file) {
                    uris.push(file.to_string());
                }
            });
        }
        if uris.is_empty() {
            return Ok(inputs);
        }

        info!("Downloading {} input file(s)", uris.len());
        let mut local: HashMap<String, String> = HashMap::new();
        for (n, uri) in uris.iter().enumerate() {
            let dest = run_dir.join("download").join(n.to_string());
            fs::create_dir_all(&dest).await?;
            let path = self.download(uri, &dest).await?;
            local.insert(uri.clone(), path.to_string_lossy().into_owned());
        }

        let mut result = Bindings::new();
        for binding in inputs.iter() {
            let value = binding.value().clone().map_files(&mut |file| {
                Ok::<_, Error>(local.get(&file).cloned().unwrap_or(file))
            })?;
            result = result.bind(binding.name(), value);
        }
        Ok(result)
    }

    async fn download(&self, uri: &str, dest: &Path) -> Result<PathBuf> {
        let failed = |message: String| Error::DownloadFailed {
            uri: uri.to_string(),
            message,
        };
        let scheme = uri_scheme(uri).unwrap_or_default();
        let fetcher = self
            .fetcher(scheme)
            .ok_or_else(|| failed(format!("no fetcher for {}:// URIs", scheme)))?;

        let mut attempt = 0;
        loop {
            attempt += 1;
            match fetcher.fetch(uri, dest).await {
                Ok(path) => {
                    info!("Downloaded {} -> {}", uri, path.display());
                    return Ok(path);
                }
                Err(FetchError::Transient(message)) if attempt <= self.config.max_retries => {
                    let delay = Duration::from_millis(self.config.backoff_ms * u64::from(attempt));
                    warn!(
                        "Download of {} failed ({}), retrying in {:?} ({}/{})",
                        uri, message, delay, attempt, self.config.max_retries
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(failed(e.to_string())),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;

    struct Flaky {
        calls: AtomicUsize,
        failures: usize,
    }

    #[async_trait]
    impl FileFetcher for Flaky {
        fn schemes(&self) -> &[&str] {
            &["flaky"]
        }

        async fn fetch(&self, _uri: &str, dest_dir: &Path) -> std::result::Result<PathBuf, FetchError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) < self.failures {
                return Err(FetchError::Transient("connection reset".into()));
            }
            let path = dest_dir.join("data.txt");
            std::fs::write(&path, "ok").unwrap();
            Ok(path)
        }
    }

    fn config() -> DownloadConfig {
        DownloadConfig {
            max_retries: 2,
            backoff_ms: 1,
        }
    }

    #[test]
    fn test_uri_scheme() {
        assert_eq!(uri_scheme("https://example.com/a.txt"), Some("https"));
        assert_eq!(uri_scheme("file:///tmp/a"), Some("file"));
        assert_eq!(uri_scheme("/tmp/a"), None);
        assert_eq!(uri_scheme("a b://c"), None);
    }

    #[tokio::test]
    async fn test_local_files_are_copied() {
        let dir = tempdir().unwrap();
        let source = dir.path().join("reads.fq");
        std::fs::write(&source, "@r1").unwrap();
        let uri = format!("file://{}", source.display());
        let inputs = Bindings::new()
            .bind("reads", Value::file(uri.clone()))
            .bind("more", Value::Array(vec![Value::file(uri), Value::file("/plain/path")]));

        let run_dir = dir.path().join("run");
        let result = Downloader::new(config())
            .materialize(inputs, &run_dir)
            .await
            .unwrap();
        let local = result.get("reads").unwrap().as_str().unwrap().to_string();
        assert_eq!(local, run_dir.join("download/0/reads.fq").to_string_lossy());
        assert_eq!(
            result.get("more"),
            Some(&Value::Array(vec![Value::file(local), Value::file("/plain/path")]))
        );
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let dir = tempdir().unwrap();
        let flaky = Arc::new(Flaky {
            calls: AtomicUsize::new(0),
            failures: 2,
        });
        let downloader = Downloader::new(config()).with_fetcher(flaky.clone());
        let inputs = Bindings::new().bind("f", Value::file("flaky://host/data.txt"));
        let result = downloader.materialize(inputs, dir.path()).await.unwrap();
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 3);
        assert!(result.get("f").unwrap().as_str().unwrap().ends_with("data.txt"));
    }

    #[tokio::test]
    async fn test_download_failed_names_uri() {
        let dir = tempdir().unwrap();
        let flaky = Arc::new(Flaky {
            calls: AtomicUsize::new(0),
            failures: 10,
        });
        let downloader = Downloader::new(config()).with_fetcher(flaky);
        let inputs = Bindings::new().bind("f", Value::file("flaky://host/data.txt"));
        match downloader.materialize(inputs, dir.path()).await {
            Err(Error::DownloadFailed { uri, .. }) => assert_eq!(uri, "flaky://host/data.txt"),
            other => panic!("unexpected {:?}", other),
        }

        let inputs = Bindings::new().bind("f", Value::file("s3://bucket/key"));
        assert!(matches!(
            Downloader::new(config()).materialize(inputs, dir.path()).await,
            Err(Error::DownloadFailed { .. })
        ));
    }
}
