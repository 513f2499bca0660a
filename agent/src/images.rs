//! Base image cache: template tag → verified local qcow2.
//!
//! Downloads on miss, hashes the byte stream while writing, renames into
//! place atomically, and re-verifies cached files on every hit. A
//! per-template async mutex guarantees at most one in-flight download per
//! template; concurrent callers wait and observe the finished result.
//! Partial downloads only ever exist as `.tmp` files, which lookups ignore.

use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::dto::template_url;
use crate::error::AgentError;

/// Outcome of one fetch: how many bytes landed and the SHA-256 of the
/// stream as it was written.
#[derive(Debug, Clone)]
pub struct FetchedImage {
    pub size_bytes: u64,
    pub sha256: String,
}

/// Transport that materializes a URL into a local file.
///
/// Production fetches over HTTP; tests script byte buffers and failures.
pub trait ImageFetcher: Send + Sync + 'static {
    fn fetch(
        &self,
        url: &str,
        dest: &Path,
    ) -> impl Future<Output = Result<FetchedImage, AgentError>> + Send;
}

/// HTTP fetcher streaming the response body straight to disk.
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for HttpFetcher {
    fn default() -> Self {
        Self::new()
    }
}

impl ImageFetcher for HttpFetcher {
    async fn fetch(&self, url: &str, dest: &Path) -> Result<FetchedImage, AgentError> {
        use futures::StreamExt;
        use tokio::io::AsyncWriteExt;

        let resp = self
            .client
            .get(url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| AgentError::Storage(format!("download {url}: {e}")))?;

        let mut file = tokio::fs::File::create(dest).await?;
        let mut hasher = Sha256::new();
        let mut size_bytes = 0u64;
        let mut stream = resp.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk =
                chunk.map_err(|e| AgentError::Storage(format!("download {url}: {e}")))?;
            hasher.update(&chunk);
            size_bytes += chunk.len() as u64;
            file.write_all(&chunk).await?;
        }
        file.sync_all().await?;

        Ok(FetchedImage {
            size_bytes,
            sha256: format!("{:x}", hasher.finalize()),
        })
    }
}

#[derive(Debug, Clone)]
struct ImageRecord {
    path: PathBuf,
    url: String,
    checksum: String,
    size_bytes: u64,
    cached_at: DateTime<Utc>,
}

pub struct ImageCache<F: ImageFetcher> {
    dir: PathBuf,
    fetcher: F,
    records: Mutex<HashMap<String, ImageRecord>>,
    /// One gate per template; taken for the whole of `acquire`.
    gates: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl<F: ImageFetcher> ImageCache<F> {
    pub fn new(dir: impl Into<PathBuf>, fetcher: F) -> Self {
        Self {
            dir: dir.into(),
            fetcher,
            records: Mutex::new(HashMap::new()),
            gates: Mutex::new(HashMap::new()),
        }
    }

    /// Return the local path of a verified base image for `template`,
    /// downloading it first if the cache has no valid copy.
    pub async fn acquire(&self, template: &str) -> Result<PathBuf, AgentError> {
        let url = template_url(template)
            .ok_or_else(|| AgentError::Validation(format!("unknown template {template:?}")))?;

        let gate = self.gate(template);
        let _held = gate.lock().await;

        if let Some(record) = self.record(template) {
            match sha256_of_file(&record.path).await {
                Ok(actual) if actual == record.checksum => {
                    return Ok(record.path);
                }
                Ok(_) => {
                    warn!(template, "cached image failed checksum, re-downloading");
                }
                Err(_) => {
                    warn!(template, "cached image unreadable, re-downloading");
                }
            }
        }

        let final_path = self.dir.join(format!("{template}.qcow2"));
        tokio::fs::create_dir_all(&self.dir).await?;

        // One retry on a torn write, then surface Corrupted.
        let fetched = match self.download_verified(template, url, &final_path).await {
            Ok(fetched) => fetched,
            Err(AgentError::Corrupted(msg)) => {
                warn!(template, %msg, "image failed verification, retrying download");
                self.download_verified(template, url, &final_path).await?
            }
            Err(e) => return Err(e),
        };

        info!(
            template,
            path = %final_path.display(),
            size_bytes = fetched.size_bytes,
            "image cached"
        );
        self.records.lock().unwrap().insert(
            template.to_string(),
            ImageRecord {
                path: final_path.clone(),
                url: url.to_string(),
                checksum: fetched.sha256,
                size_bytes: fetched.size_bytes,
                cached_at: Utc::now(),
            },
        );
        Ok(final_path)
    }

    /// Evict a template from the cache, removing its file.
    pub async fn evict(&self, template: &str) -> Result<(), AgentError> {
        let gate = self.gate(template);
        let _held = gate.lock().await;
        let removed = self.records.lock().unwrap().remove(template);
        if let Some(record) = removed {
            match tokio::fs::remove_file(&record.path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
            info!(
                template,
                url = %record.url,
                size_bytes = record.size_bytes,
                cached_at = %record.cached_at,
                "image evicted"
            );
        }
        Ok(())
    }

    async fn download_verified(
        &self,
        template: &str,
        url: &str,
        final_path: &Path,
    ) -> Result<FetchedImage, AgentError> {
        let tmp_path = self.dir.join(format!("{template}.qcow2.tmp"));
        info!(template, url, "downloading image");

        let fetched = self.fetcher.fetch(url, &tmp_path).await?;

        // Re-hash what actually hit the disk and compare with the stream
        // hash; a mismatch means a torn write.
        let on_disk = sha256_of_file(&tmp_path).await?;
        if on_disk != fetched.sha256 {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(AgentError::Corrupted(format!(
                "image {template} checksum mismatch after download"
            )));
        }

        tokio::fs::rename(&tmp_path, final_path).await?;
        Ok(fetched)
    }

    fn record(&self, template: &str) -> Option<ImageRecord> {
        self.records.lock().unwrap().get(template).cloned()
    }

    fn gate(&self, template: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.gates
            .lock()
            .unwrap()
            .entry(template.to_string())
            .or_default()
            .clone()
    }
}

/// SHA-256 of a file, read in chunks so multi-GiB images do not land in
/// memory.
pub async fn sha256_of_file(path: &Path) -> Result<String, AgentError> {
    use tokio::io::AsyncReadExt;

    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 1024 * 1024];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;

    /// What the scripted fetcher should do on its next call.
    enum Step {
        /// Write these bytes and report the matching hash.
        Deliver(Vec<u8>),
        /// Write these bytes but report a bogus hash (torn write).
        DeliverTorn(Vec<u8>),
        /// Fail outright.
        Fail(String),
    }

    struct ScriptedFetcher {
        steps: Mutex<VecDeque<Step>>,
        calls: AtomicUsize,
        delay: Duration,
    }

    impl ScriptedFetcher {
        fn new(steps: Vec<Step>) -> Self {
            Self {
                steps: Mutex::new(steps.into()),
                calls: AtomicUsize::new(0),
                delay: Duration::ZERO,
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::Relaxed)
        }
    }

    impl ImageFetcher for Arc<ScriptedFetcher> {
        async fn fetch(&self, _url: &str, dest: &Path) -> Result<FetchedImage, AgentError> {
            self.calls.fetch_add(1, Ordering::Relaxed);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            let step = self
                .steps
                .lock()
                .unwrap()
                .pop_front()
                .expect("fetcher called more times than scripted");
            match step {
                Step::Deliver(bytes) => {
                    tokio::fs::write(dest, &bytes).await?;
                    Ok(FetchedImage {
                        size_bytes: bytes.len() as u64,
                        sha256: format!("{:x}", Sha256::digest(&bytes)),
                    })
                }
                Step::DeliverTorn(bytes) => {
                    tokio::fs::write(dest, &bytes).await?;
                    Ok(FetchedImage {
                        size_bytes: bytes.len() as u64,
                        sha256: "0".repeat(64),
                    })
                }
                Step::Fail(msg) => Err(AgentError::Storage(msg)),
            }
        }
    }

    fn cache_with(
        dir: &Path,
        steps: Vec<Step>,
    ) -> (ImageCache<Arc<ScriptedFetcher>>, Arc<ScriptedFetcher>) {
        let fetcher = Arc::new(ScriptedFetcher::new(steps));
        (ImageCache::new(dir, fetcher.clone()), fetcher)
    }

    #[tokio::test]
    async fn unknown_template_is_validation() {
        let dir = tempfile::tempdir().unwrap();
        let (cache, fetcher) = cache_with(dir.path(), vec![]);

        let err = cache.acquire("windows-95").await.unwrap_err();
        assert!(matches!(err, AgentError::Validation(_)));
        assert_eq!(fetcher.calls(), 0);
    }

    #[tokio::test]
    async fn valid_cached_image_is_not_refetched() {
        let dir = tempfile::tempdir().unwrap();
        let (cache, fetcher) = cache_with(
            dir.path(),
            vec![Step::Deliver(b"ubuntu bits".to_vec())],
        );

        let first = cache.acquire("ubuntu-22.04").await.unwrap();
        let second = cache.acquire("ubuntu-22.04").await.unwrap();
        assert_eq!(first, second);
        assert_eq!(fetcher.calls(), 1, "hit with valid checksum must not download");
    }

    #[tokio::test]
    async fn corrupted_cached_file_triggers_redownload() {
        let dir = tempfile::tempdir().unwrap();
        let (cache, fetcher) = cache_with(
            dir.path(),
            vec![
                Step::Deliver(b"original".to_vec()),
                Step::Deliver(b"fresh copy".to_vec()),
            ],
        );

        let path = cache.acquire("debian-12").await.unwrap();
        // Flip bits behind the cache's back.
        std::fs::write(&path, b"bitrot").unwrap();

        let path2 = cache.acquire("debian-12").await.unwrap();
        assert_eq!(path, path2);
        assert_eq!(fetcher.calls(), 2);
        assert_eq!(std::fs::read(&path2).unwrap(), b"fresh copy");
    }

    #[tokio::test]
    async fn torn_download_is_retried_once() {
        let dir = tempfile::tempdir().unwrap();
        let (cache, fetcher) = cache_with(
            dir.path(),
            vec![
                Step::DeliverTorn(b"half an image".to_vec()),
                Step::Deliver(b"whole image".to_vec()),
            ],
        );

        let path = cache.acquire("debian-11").await.unwrap();
        assert_eq!(fetcher.calls(), 2);
        assert_eq!(std::fs::read(&path).unwrap(), b"whole image");
    }

    #[tokio::test]
    async fn torn_download_twice_surfaces_corrupted() {
        let dir = tempfile::tempdir().unwrap();
        let (cache, fetcher) = cache_with(
            dir.path(),
            vec![
                Step::DeliverTorn(b"a".to_vec()),
                Step::DeliverTorn(b"b".to_vec()),
            ],
        );

        let err = cache.acquire("debian-11").await.unwrap_err();
        assert!(matches!(err, AgentError::Corrupted(_)));
        assert_eq!(fetcher.calls(), 2);
        // No torn file promoted into place.
        assert!(!dir.path().join("debian-11.qcow2").exists());
    }

    #[tokio::test]
    async fn fetch_failure_is_storage_error() {
        let dir = tempfile::tempdir().unwrap();
        let (cache, _fetcher) = cache_with(
            dir.path(),
            vec![Step::Fail("connection refused".into())],
        );

        let err = cache.acquire("ubuntu-20.04").await.unwrap_err();
        assert!(matches!(err, AgentError::Storage(_)));
    }

    #[tokio::test]
    async fn concurrent_acquires_share_one_download() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = Arc::new(ScriptedFetcher {
            steps: Mutex::new(VecDeque::from([Step::Deliver(b"slow image".to_vec())])),
            calls: AtomicUsize::new(0),
            delay: Duration::from_millis(50),
        });
        let cache = Arc::new(ImageCache::new(dir.path(), fetcher.clone()));

        let a = cache.clone();
        let b = cache.clone();
        let (ra, rb) = tokio::join!(
            async move { a.acquire("ubuntu-22.04").await },
            async move { b.acquire("ubuntu-22.04").await },
        );
        assert_eq!(ra.unwrap(), rb.unwrap());
        assert_eq!(fetcher.calls(), 1, "second caller must reuse the in-flight result");
    }

    #[tokio::test]
    async fn evict_removes_file_and_record() {
        let dir = tempfile::tempdir().unwrap();
        let (cache, fetcher) = cache_with(
            dir.path(),
            vec![
                Step::Deliver(b"v1".to_vec()),
                Step::Deliver(b"v2".to_vec()),
            ],
        );

        let path = cache.acquire("ubuntu-22.04").await.unwrap();
        cache.evict("ubuntu-22.04").await.unwrap();
        assert!(!path.exists());

        cache.acquire("ubuntu-22.04").await.unwrap();
        assert_eq!(fetcher.calls(), 2);
    }
}
