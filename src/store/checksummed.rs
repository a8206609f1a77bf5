//! Checksum-verifying wrapper over a raw object store
//!
//! Object stores are eventually consistent: a HEAD right after a PUT can
//! miss it, a GET can return a previous version. The wrapper masks this with
//! three side-channels:
//!
//! - `shared_hash` — an external register (the worker directory) holding the
//!   authoritative MD5 per document. On any disagreement the shared hash
//!   wins: the wrapper retries with backoff and fails rather than return a
//!   value that contradicts a known shared hash.
//! - `local_hash` — the `-hash` sidecar next to the document, recording the
//!   last locally-confirmed digest.
//! - `latest_version` — a per-process cache of the newest version id this
//!   process wrote, used to see through stale version listings.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::backend::{ObjectStore, ObjectVersion};
use super::errors::{StoreError, StoreResult};
use crate::checksum;
use crate::docid;

/// Sentinel digest recorded in the shared register for tombstoned documents.
pub const DELETED_TOKEN: &str = "DELETED";

/// External key-value register of content digests.
#[async_trait]
pub trait HashRegister: Send + Sync {
    /// Last recorded digest for the key, if any.
    async fn get_hash(&self, key: &str) -> StoreResult<Option<String>>;

    /// Record a digest for the key.
    async fn set_hash(&self, key: &str, hash: &str) -> StoreResult<()>;
}

/// Hash register backed by `-hash` sidecar files under the docs root.
#[derive(Debug)]
pub struct FileHashRegister {
    root: PathBuf,
}

impl FileHashRegister {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl HashRegister for FileHashRegister {
    async fn get_hash(&self, key: &str) -> StoreResult<Option<String>> {
        match tokio::fs::read_to_string(docid::hash_path(&self.root, key)).await {
            Ok(contents) => Ok(Some(contents.trim().to_string())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn set_hash(&self, key: &str, hash: &str) -> StoreResult<()> {
        tokio::fs::write(docid::hash_path(&self.root, key), hash).await?;
        Ok(())
    }
}

/// Retry policy for masking eventual consistency.
#[derive(Debug, Clone)]
pub struct RetryOptions {
    /// Attempts beyond the first.
    pub max_retries: u32,
    /// First backoff delay; doubles per retry, capped.
    pub initial_delay: Duration,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            max_retries: 4,
            initial_delay: Duration::from_secs(3),
        }
    }
}

const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Checksummed store keyed by docId (snapshot component stripped).
pub struct ChecksummedStore {
    inner: Arc<dyn ObjectStore>,
    prefix: String,
    shared_hash: Arc<dyn HashRegister>,
    local_hash: Arc<dyn HashRegister>,
    latest_version: Mutex<HashMap<String, String>>,
    retry: RetryOptions,
}

impl ChecksummedStore {
    pub fn new(
        inner: Arc<dyn ObjectStore>,
        prefix: impl Into<String>,
        shared_hash: Arc<dyn HashRegister>,
        local_hash: Arc<dyn HashRegister>,
        retry: RetryOptions,
    ) -> Self {
        Self {
            inner,
            prefix: prefix.into(),
            shared_hash,
            local_hash,
            latest_version: Mutex::new(HashMap::new()),
            retry,
        }
    }

    fn key(&self, doc_id: &str) -> String {
        docid::object_key(&self.prefix, doc_id)
    }

    /// Newest version id written by this process, if any.
    pub async fn latest_version(&self, doc_id: &str) -> Option<String> {
        self.latest_version.lock().await.get(doc_id).cloned()
    }

    /// Compute MD5 of `path`, PUT, and verify read-after-write: retry until
    /// the store reports back the digest we wrote. On acceptance both hash
    /// registers are updated and the new version id recorded.
    ///
    /// Returns the uploaded content's digest.
    pub async fn upload(&self, doc_id: &str, path: &Path) -> StoreResult<String> {
        let digest = hash_file(path).await?;
        let key = self.key(doc_id);

        let mut delay = self.retry.initial_delay;
        let mut last_err: Option<StoreError> = None;
        for attempt in 0..=self.retry.max_retries {
            if attempt > 0 {
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(MAX_BACKOFF);
            }
            let version = match self.inner.upload(&key, path).await {
                Ok(version) => version,
                Err(e) => {
                    last_err = Some(e);
                    continue;
                }
            };
            // Read-after-write verification
            match self.inner.head(&key).await {
                Ok(Some(meta)) => {
                    if let Some(observed) = &meta.content_md5 {
                        if observed != &digest {
                            last_err = Some(StoreError::ChecksumMismatch {
                                key: key.clone(),
                                expected: digest.clone(),
                                observed: observed.clone(),
                            });
                            continue;
                        }
                    }
                }
                Ok(None) => {
                    last_err = Some(StoreError::ObjectNotFound(key.clone()));
                    continue;
                }
                Err(e) => {
                    last_err = Some(e);
                    continue;
                }
            }
            self.shared_hash.set_hash(doc_id, &digest).await?;
            self.local_hash.set_hash(doc_id, &digest).await?;
            if let Some(version) = version {
                self.latest_version
                    .lock()
                    .await
                    .insert(doc_id.to_string(), version);
            }
            return Ok(digest);
        }
        Err(last_err.unwrap_or_else(|| StoreError::Inconsistent(key)))
    }

    /// GET a version of the document into `dest`. When no `snapshot_id` is
    /// given the content digest must agree with the shared hash register;
    /// stale reads are retried with backoff. Returns the downloaded
    /// content's digest.
    pub async fn download(
        &self,
        doc_id: &str,
        dest: &Path,
        snapshot_id: Option<&str>,
    ) -> StoreResult<String> {
        let key = self.key(doc_id);
        let expected = match snapshot_id {
            // Historical versions have their own digests; only the current
            // version is pinned by the shared register
            Some(_) => None,
            None => {
                let shared = self.shared_hash.get_hash(doc_id).await?;
                if shared.as_deref() == Some(DELETED_TOKEN) {
                    return Err(StoreError::ObjectNotFound(key));
                }
                shared
            }
        };

        let mut delay = self.retry.initial_delay;
        let mut last_err: Option<StoreError> = None;
        for attempt in 0..=self.retry.max_retries {
            if attempt > 0 {
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(MAX_BACKOFF);
            }
            match self.inner.download(&key, dest, snapshot_id).await {
                Ok(()) => {}
                Err(e @ StoreError::ObjectNotFound(_)) if expected.is_some() => {
                    // The register says the object exists; the store is behind
                    last_err = Some(e);
                    continue;
                }
                Err(e @ (StoreError::ObjectNotFound(_) | StoreError::VersionNotFound { .. })) => {
                    return Err(e);
                }
                Err(e) => {
                    last_err = Some(e);
                    continue;
                }
            }
            let digest = hash_file(dest).await?;
            if let Some(expected) = &expected {
                if expected != &digest {
                    last_err = Some(StoreError::ChecksumMismatch {
                        key: key.clone(),
                        expected: expected.clone(),
                        observed: digest,
                    });
                    continue;
                }
            }
            // The sidecar tracks the current version only; a historical
            // version's digest must not masquerade as it
            if snapshot_id.is_none() {
                self.local_hash.set_hash(doc_id, &digest).await?;
            }
            return Ok(digest);
        }
        Err(last_err.unwrap_or_else(|| StoreError::Inconsistent(key)))
    }

    /// HEAD with digest-aware retry: a known shared hash implies existence
    /// (or, for the DELETED sentinel, absence), and the raw store is retried
    /// until it agrees.
    pub async fn exists(&self, doc_id: &str) -> StoreResult<bool> {
        let key = self.key(doc_id);
        let expected = self
            .shared_hash
            .get_hash(doc_id)
            .await?
            .map(|hash| hash != DELETED_TOKEN);

        let mut delay = self.retry.initial_delay;
        let mut last_err: Option<StoreError> = None;
        for attempt in 0..=self.retry.max_retries {
            if attempt > 0 {
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(MAX_BACKOFF);
            }
            match self.inner.exists(&key).await {
                Ok(observed) => match expected {
                    None => return Ok(observed),
                    Some(expected) if expected == observed => return Ok(observed),
                    Some(_) => {
                        last_err = Some(StoreError::Inconsistent(key.clone()));
                    }
                },
                Err(e) => {
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| StoreError::Inconsistent(key)))
    }

    /// DELETE the object and tombstone it in the shared register.
    pub async fn remove(&self, doc_id: &str) -> StoreResult<()> {
        let key = self.key(doc_id);
        self.inner.remove(&key).await?;
        self.shared_hash.set_hash(doc_id, DELETED_TOKEN).await?;
        self.latest_version.lock().await.remove(doc_id);
        Ok(())
    }

    /// Delete specific versions (pruning).
    pub async fn remove_versions(
        &self,
        doc_id: &str,
        snapshot_ids: &[String],
    ) -> StoreResult<()> {
        let key = self.key(doc_id);
        self.inner.remove_versions(&key, snapshot_ids).await
    }

    /// List versions, newest first, retrying while the listing is missing a
    /// version this process is known to have written.
    pub async fn versions(&self, doc_id: &str) -> StoreResult<Vec<ObjectVersion>> {
        let key = self.key(doc_id);
        let latest = self.latest_version(doc_id).await;

        let mut delay = self.retry.initial_delay;
        let mut last_err: Option<StoreError> = None;
        for attempt in 0..=self.retry.max_retries {
            if attempt > 0 {
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(MAX_BACKOFF);
            }
            match self.inner.versions(&key).await {
                Ok(versions) => match &latest {
                    Some(id) if !versions.iter().any(|v| &v.snapshot_id == id) => {
                        last_err = Some(StoreError::Inconsistent(key.clone()));
                    }
                    _ => return Ok(versions),
                },
                Err(e) => {
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| StoreError::Inconsistent(key)))
    }
}

async fn hash_file(path: &Path) -> StoreResult<String> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || checksum::compute_file_checksum(&path))
        .await
        .map_err(|e| StoreError::Io(e.to_string()))?
        .map_err(StoreError::from)
}
