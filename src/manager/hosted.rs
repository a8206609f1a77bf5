//! Hosted document storage manager
//!
//! Orchestrates the document lifecycle on one worker: materialize documents
//! locally from the versioned object store, let the engine edit the live
//! SQLite file, and stream consistent snapshots back out.
//!
//! The flow for an edit: `mark_as_changed` marks the document dirty in the
//! upload scheduler → after the debounce window a consistent SQLite snapshot
//! is taken into a sidecar → the sidecar is uploaded through the checksummed
//! store, which records the new digest in the `-hash` sidecar and the worker
//! directory → the pruner is told a version just landed → the sidecar is
//! removed.
//!
//! Two single-flight mechanisms coexist and are both required: the presence
//! cache (`local_files`) makes materialization single-flight per document,
//! and the upload scheduler makes pushes single-flight per document.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Notify;
use uuid::Uuid;

use super::config::{s3_disabled_by_env, DocStorageOptions};
use super::errors::{DocStorageError, DocStorageResult};
use crate::checksum;
use crate::directory::{DirectoryHashRegister, DocWorkerMap};
use crate::docid::{self, DocIdParts, NEW_DOCUMENT_CODE};
use crate::meta::{DocUpdateQueue, DocUpdateSink};
use crate::observability::{Event, Logger, MetricsRegistry};
use crate::pruner::{KeepRecent, SnapshotPruner, SnapshotRetention};
use crate::scheduler::{KeyedOps, KeyedOpsOptions};
use crate::session::Session;
use crate::sqlite;
use crate::store::{
    ChecksummedStore, FileHashRegister, HashRegister, ObjectStore, RetryOptions, DELETED_TOKEN,
};

/// One entry of a document's version history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DocSnapshot {
    /// Native version id in the object store
    pub snapshot_id: String,
    /// When the version was written
    pub last_modified: DateTime<Utc>,
    /// URL-id addressing this version directly
    pub doc_id: String,
}

/// Source selection for [`HostedDocStorage::replace_doc`].
#[derive(Debug, Clone, Default)]
pub struct ReplaceOptions {
    /// Replace content from another document's current version.
    pub source_doc_id: Option<String>,
    /// Replace content from one of the document's own historical versions.
    pub snapshot_id: Option<String>,
}

/// Construction-time settings for [`HostedDocStorage`].
pub struct HostedStorageConfig {
    /// Directory holding the live documents and their sidecars.
    pub docs_root: PathBuf,
    /// This worker's id in the worker directory.
    pub worker_id: String,
    /// Key prefix in the object store.
    pub object_store_prefix: String,
    /// Debounce and retry tuning.
    pub options: DocStorageOptions,
    /// Injected store for tests; takes precedence over the regular store
    /// and over `GRIST_DISABLE_S3`.
    pub test_external_storage: Option<Arc<dyn ObjectStore>>,
    /// Snapshot retention strategy; keeps a recent window by default.
    pub retention: Option<Arc<dyn SnapshotRetention>>,
}

impl HostedStorageConfig {
    pub fn new(docs_root: impl Into<PathBuf>, worker_id: impl Into<String>) -> Self {
        Self {
            docs_root: docs_root.into(),
            worker_id: worker_id.into(),
            object_store_prefix: "docs/".to_string(),
            options: DocStorageOptions::from_env(),
            test_external_storage: None,
            retention: None,
        }
    }
}

/// Presence of a document's local state. Resolved once materialization
/// finishes; concurrent interested parties share the outcome.
#[derive(Debug)]
struct PresenceCell {
    result: Mutex<Option<DocStorageResult<bool>>>,
    done: Notify,
}

impl PresenceCell {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            result: Mutex::new(None),
            done: Notify::new(),
        })
    }

    fn resolve(&self, result: DocStorageResult<bool>) {
        *self.result.lock().unwrap() = Some(result);
        self.done.notify_waiters();
    }

    async fn wait(&self) -> DocStorageResult<bool> {
        loop {
            let done = self.done.notified();
            tokio::pin!(done);
            done.as_mut().enable();
            if let Some(result) = self.result.lock().unwrap().clone() {
                return result;
            }
            done.await;
        }
    }
}

struct Inner {
    docs_root: PathBuf,
    worker_id: String,
    directory: Arc<dyn DocWorkerMap>,
    remote: Option<Arc<ChecksummedStore>>,
    /// docId → presence. An entry means this worker owns local state for the
    /// document; absence means it holds nothing worth preserving.
    local_files: Mutex<HashMap<String, Arc<PresenceCell>>>,
    /// Documents being materialized or freshly created right now.
    prepare_files: Mutex<HashSet<String>>,
    closed: AtomicBool,
    metrics: Arc<MetricsRegistry>,
}

/// The document storage manager for one worker process.
pub struct HostedDocStorage {
    inner: Arc<Inner>,
    uploads: KeyedOps<DocStorageError>,
    meta_queue: DocUpdateQueue,
    push_doc_update_times: bool,
    pruner: Option<Arc<SnapshotPruner>>,
}

impl HostedDocStorage {
    /// Build the manager. `object_store` is the deployment's remote store;
    /// `None`, the `GRIST_DISABLE_S3` environment variable, or an injected
    /// test store decide whether remote storage is active.
    pub fn new(
        config: HostedStorageConfig,
        directory: Arc<dyn DocWorkerMap>,
        object_store: Option<Arc<dyn ObjectStore>>,
        update_sink: Arc<dyn DocUpdateSink>,
    ) -> DocStorageResult<Self> {
        std::fs::create_dir_all(&config.docs_root)?;

        let options = config.options.clone();
        let raw_store = match config.test_external_storage {
            Some(test_store) => Some(test_store),
            None if s3_disabled_by_env() => None,
            None => object_store,
        };

        let metrics = Arc::new(MetricsRegistry::new());
        let remote = raw_store.map(|raw| {
            Arc::new(ChecksummedStore::new(
                raw,
                config.object_store_prefix.clone(),
                Arc::new(DirectoryHashRegister::new(Arc::clone(&directory)))
                    as Arc<dyn HashRegister>,
                Arc::new(FileHashRegister::new(config.docs_root.clone()))
                    as Arc<dyn HashRegister>,
                RetryOptions {
                    max_retries: 4,
                    initial_delay: Duration::from_secs(options.seconds_before_first_retry),
                },
            ))
        });

        let inner = Arc::new(Inner {
            docs_root: config.docs_root,
            worker_id: config.worker_id,
            directory,
            remote: remote.clone(),
            local_files: Mutex::new(HashMap::new()),
            prepare_files: Mutex::new(HashSet::new()),
            closed: AtomicBool::new(false),
            metrics: Arc::clone(&metrics),
        });

        let retention = config
            .retention
            .unwrap_or_else(|| Arc::new(KeepRecent::default()));
        let pruner = remote.map(|remote| {
            Arc::new(SnapshotPruner::new(
                remote,
                retention,
                // Never race a burst of uploads
                Duration::from_secs(options.seconds_before_push * 4),
                Arc::clone(&metrics),
            ))
        });

        let worker_inner = Arc::clone(&inner);
        let worker_pruner = pruner.clone();
        let logger_metrics = Arc::clone(&metrics);
        let uploads = KeyedOps::with_error_logger(
            KeyedOpsOptions {
                delay_before_operation: Duration::from_secs(options.seconds_before_push),
                initial_retry_delay: Duration::from_secs(options.seconds_before_first_retry),
                retry: true,
            },
            move |doc_id: String| {
                let inner = Arc::clone(&worker_inner);
                let pruner = worker_pruner.clone();
                async move { push_to_store(inner, pruner, doc_id).await }
            },
            move |doc_id, failure_count, err: &DocStorageError| {
                logger_metrics.increment_push_failures();
                Logger::error(
                    Event::PushFailed,
                    &[
                        ("doc_id", doc_id),
                        ("failure_count", &failure_count.to_string()),
                        ("error", &err.to_string()),
                    ],
                );
            },
        );

        let meta_queue = DocUpdateQueue::new(
            update_sink,
            Duration::from_secs(options.seconds_before_push),
        );

        Ok(Self {
            inner,
            uploads,
            meta_queue,
            push_doc_update_times: options.push_doc_update_times,
            pruner,
        })
    }

    /// Local path of the document's live SQLite file. Pure path computation;
    /// validates the docId shape only.
    pub fn get_path(&self, doc_id: &str) -> DocStorageResult<PathBuf> {
        docid::validate_doc_id(doc_id)?;
        Ok(docid::doc_path(&self.inner.docs_root, doc_id))
    }

    /// Ensure the document is available locally, claiming ownership through
    /// the worker directory and fetching or deriving content as needed.
    ///
    /// Returns `true` iff the document had to be created: it did not exist
    /// remotely and the caller is allowed to create it.
    ///
    /// Calling this again while a prior call for the same docId is still
    /// materializing is a programming error (`ConcurrentPrepare`).
    pub async fn prepare_local_doc(
        &self,
        doc_id: &str,
        session: &Session,
    ) -> DocStorageResult<bool> {
        self.check_open()?;
        let parts = docid::parse_url_id(doc_id)?;

        if self.inner.prepare_files.lock().unwrap().contains(doc_id) {
            return Err(DocStorageError::ConcurrentPrepare(doc_id.to_string()));
        }

        // Presence single-flight: a completed prepare leaves its entry
        // behind and a reopen just confirms it
        let (cell, fresh) = {
            let mut local_files = self.inner.local_files.lock().unwrap();
            match local_files.get(doc_id) {
                Some(cell) => (Arc::clone(cell), false),
                None => {
                    let cell = PresenceCell::new();
                    local_files.insert(doc_id.to_string(), Arc::clone(&cell));
                    (cell, true)
                }
            }
        };
        if !fresh {
            cell.wait().await?;
            return Ok(false);
        }

        self.inner
            .prepare_files
            .lock()
            .unwrap()
            .insert(doc_id.to_string());
        let result = self.ensure_document_is_present(doc_id, &parts, session).await;
        self.inner.prepare_files.lock().unwrap().remove(doc_id);
        if result.is_err() {
            // A failed prepare holds no claim on local state. Guard against
            // an interleaved close_document having already replaced the entry
            let mut local_files = self.inner.local_files.lock().unwrap();
            if local_files
                .get(doc_id)
                .is_some_and(|existing| Arc::ptr_eq(existing, &cell))
            {
                local_files.remove(doc_id);
            }
        }
        cell.resolve(result.clone());
        result
    }

    /// Idempotently schedule an upload of the document after the debounce
    /// window. No-op for snapshot-addressing docIds and when remote storage
    /// is off.
    pub fn mark_as_changed(&self, doc_id: &str) -> DocStorageResult<()> {
        self.check_open()?;
        let parts = docid::parse_url_id(doc_id)?;
        if parts.snapshot_id.is_some() {
            return Ok(());
        }
        if self.inner.remote.is_none() {
            return Ok(());
        }
        self.uploads.add_operation(doc_id);
        Ok(())
    }

    /// Schedule a user-visible "last edited" metadata update. No-op for
    /// snapshot-addressing docIds.
    pub fn mark_as_edited(&self, doc_id: &str, session: &Session) -> DocStorageResult<()> {
        self.check_open()?;
        let parts = docid::parse_url_id(doc_id)?;
        if parts.snapshot_id.is_some() {
            return Ok(());
        }
        if self.push_doc_update_times {
            self.meta_queue.schedule_update(doc_id, session.user_id);
        }
        Ok(())
    }

    /// Block until no pending upload remains for the document, expediting a
    /// scheduled one. A failed push attempt is re-thrown here while the
    /// dirty state stays scheduled.
    pub async fn flush_doc(&self, doc_id: &str) -> DocStorageResult<()> {
        docid::validate_doc_id(doc_id)?;
        while self.uploads.has_pending_operation(doc_id) {
            self.uploads.expedite_operation_and_wait(doc_id).await?;
        }
        Ok(())
    }

    /// Whether the document has no push outstanding.
    pub fn is_saved(&self, doc_id: &str) -> bool {
        !self.uploads.has_pending_operation(doc_id)
    }

    /// Whether no document has a push outstanding.
    pub fn is_all_saved(&self) -> bool {
        !self.uploads.has_pending_operations()
    }

    /// Path of a fresh, independent snapshot of the document, suitable for
    /// download. The caller owns the file and deletes it.
    pub async fn get_copy(&self, doc_id: &str) -> DocStorageResult<PathBuf> {
        let parts = docid::parse_url_id(doc_id)?;
        let live = docid::doc_path(&self.inner.docs_root, doc_id);
        let copy = docid::backup_path(
            &self.inner.docs_root,
            doc_id,
            &format!("copy-{}", Uuid::new_v4()),
        );

        if file_exists(&live).await {
            self.snapshot_to(&live, &copy).await?;
            return Ok(copy);
        }

        let Some(remote) = &self.inner.remote else {
            return Err(DocStorageError::DocNotFound(doc_id.to_string()));
        };
        let remote_doc = docid::build_url_id(&parts.clone().without_snapshot());
        if !remote.exists(&remote_doc).await? {
            return Err(DocStorageError::DocNotFound(doc_id.to_string()));
        }
        remote
            .download(&remote_doc, &copy, parts.snapshot_id.as_deref())
            .await?;
        self.inner.metrics.increment_downloads();
        Ok(copy)
    }

    /// Atomic content swap: flush, fetch the source (another document or one
    /// of this document's own versions), install it as `doc_id`, and mark
    /// the new content changed and edited so it gets pushed. On failure the
    /// prior local file is restored.
    ///
    /// With neither source nor snapshot given, or with the document named as
    /// its own source, this is a no-op.
    pub async fn replace_doc(&self, doc_id: &str, options: ReplaceOptions) -> DocStorageResult<()> {
        self.check_open()?;
        let parts = docid::parse_url_id(doc_id)?;
        if parts.snapshot_id.is_some() {
            return Err(DocStorageError::UnsupportedOp(
                "replace of a snapshot-addressing docId",
            ));
        }

        let (source_id, version) = match (&options.source_doc_id, &options.snapshot_id) {
            (None, None) => return Ok(()),
            (Some(source), None) if source.as_str() == doc_id => return Ok(()),
            (Some(source), version) => {
                let source_parts = docid::parse_url_id(source)?;
                let version = version
                    .clone()
                    .or_else(|| source_parts.snapshot_id.clone());
                (
                    docid::build_url_id(&source_parts.without_snapshot()),
                    version,
                )
            }
            (None, Some(version)) => (
                docid::build_url_id(&parts.clone().without_snapshot()),
                Some(version.clone()),
            ),
        };

        // Do not let a scheduled push race the swap
        self.flush_doc(doc_id).await?;

        let live = docid::doc_path(&self.inner.docs_root, doc_id);
        let replacing = docid::replacing_path(&self.inner.docs_root, doc_id);

        if let Err(e) = self
            .fetch_replacement(&source_id, version.as_deref(), &replacing)
            .await
        {
            let _ = remove_if_exists(&replacing).await;
            return Err(e);
        }

        // Install, restoring the prior file if the swap fails
        let prior = docid::backup_path(
            &self.inner.docs_root,
            doc_id,
            &format!("prev-{}", Uuid::new_v4()),
        );
        let had_prior = file_exists(&live).await;
        if had_prior {
            tokio::fs::rename(&live, &prior).await?;
        }
        match tokio::fs::rename(&replacing, &live).await {
            Ok(()) => {
                if had_prior {
                    let _ = remove_if_exists(&prior).await;
                }
            }
            Err(e) => {
                if had_prior {
                    let _ = tokio::fs::rename(&prior, &live).await;
                }
                let _ = remove_if_exists(&replacing).await;
                return Err(e.into());
            }
        }

        // The installed content is not what the store holds: invalidate the
        // digest sidecar and push
        remove_if_exists(&docid::hash_path(&self.inner.docs_root, doc_id)).await?;
        self.mark_as_changed(doc_id)?;
        self.mark_as_edited(doc_id, &Session::anonymous())?;
        Ok(())
    }

    /// Permanent deletion: close the document, remove the remote object
    /// (tombstoning it in the directory), and remove the local file and its
    /// digest sidecar. Only permanent deletion is supported.
    pub async fn delete_doc(&self, doc_id: &str, permanent: bool) -> DocStorageResult<()> {
        if !permanent {
            return Err(DocStorageError::UnsupportedOp("non-permanent deletion"));
        }
        let parts = docid::parse_url_id(doc_id)?;
        if parts.snapshot_id.is_some() {
            return Err(DocStorageError::UnsupportedOp(
                "delete of a snapshot-addressing docId",
            ));
        }

        self.close_document(doc_id).await?;

        if let Some(remote) = &self.inner.remote {
            let remote_doc = docid::build_url_id(&parts.without_snapshot());
            remote.remove(&remote_doc).await?;
        }
        remove_if_exists(&docid::doc_path(&self.inner.docs_root, doc_id)).await?;
        remove_if_exists(&docid::hash_path(&self.inner.docs_root, doc_id)).await?;
        Logger::info(Event::DocDeleted, &[("doc_id", doc_id)]);
        Ok(())
    }

    /// Await any outstanding materialization, drop the presence entry, then
    /// flush pending pushes. Orders before any subsequent prepare by the
    /// caller.
    pub async fn close_document(&self, doc_id: &str) -> DocStorageResult<()> {
        docid::validate_doc_id(doc_id)?;
        let cell = self.inner.local_files.lock().unwrap().remove(doc_id);
        if let Some(cell) = cell {
            // The materialization outcome no longer matters, only that it
            // is not in flight
            let _ = cell.wait().await;
        }
        self.flush_doc(doc_id).await
    }

    /// Drain uploads, close the metadata queue and pruner, and wait for
    /// in-flight materializations. Idempotent; no new work starts after.
    pub async fn close_storage(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.uploads.expedite_all();
        let notify = || Logger::info(Event::DrainWait, &[]);
        self.uploads.wait(Some(&notify)).await;
        self.meta_queue.close().await;
        if let Some(pruner) = &self.pruner {
            pruner.close().await;
        }
        let cells: Vec<_> = self
            .inner
            .local_files
            .lock()
            .unwrap()
            .values()
            .cloned()
            .collect();
        for cell in cells {
            let _ = cell.wait().await;
        }
        Logger::info(Event::StorageClosed, &[("worker_id", &self.inner.worker_id)]);
    }

    /// List the document's remote versions, newest first. With remote
    /// storage off, a single synthetic "current" entry is returned.
    pub async fn get_snapshots(&self, doc_id: &str) -> DocStorageResult<Vec<DocSnapshot>> {
        let parts = docid::parse_url_id(doc_id)?;
        let Some(remote) = &self.inner.remote else {
            return Ok(vec![DocSnapshot {
                snapshot_id: "current".to_string(),
                last_modified: Utc::now(),
                doc_id: doc_id.to_string(),
            }]);
        };
        let base = parts.without_snapshot();
        let remote_doc = docid::build_url_id(&base);
        let versions = remote.versions(&remote_doc).await?;
        Ok(versions
            .into_iter()
            .map(|version| {
                let mut addressed = base.clone();
                addressed.snapshot_id = Some(version.snapshot_id.clone());
                DocSnapshot {
                    snapshot_id: version.snapshot_id,
                    last_modified: version.last_modified,
                    doc_id: docid::build_url_id(&addressed),
                }
            })
            .collect())
    }

    /// Counters for tests and diagnostics.
    pub fn metrics(&self) -> &MetricsRegistry {
        &self.inner.metrics
    }

    fn check_open(&self) -> DocStorageResult<()> {
        if self.inner.closed.load(Ordering::SeqCst) {
            Err(DocStorageError::AfterClose)
        } else {
            Ok(())
        }
    }

    /// The ensure-present algorithm behind `prepare_local_doc`.
    async fn ensure_document_is_present(
        &self,
        doc_id: &str,
        parts: &DocIdParts,
        session: &Session,
    ) -> DocStorageResult<bool> {
        let inner = &self.inner;
        let can_create_fork =
            parts.fork_user_id.is_none() || parts.fork_user_id == session.user_id;
        let remote_doc = docid::build_url_id(&parts.clone().without_snapshot());

        // Claim or confirm ownership before touching any state
        let status = inner
            .directory
            .get_or_assign(&remote_doc, &inner.worker_id)
            .await?;
        if !status.is_active || status.doc_worker.id != inner.worker_id {
            return Err(DocStorageError::NotOwner(doc_id.to_string()));
        }

        self.cleanup_stale_sidecars(doc_id).await?;

        let live = docid::doc_path(&inner.docs_root, doc_id);

        let Some(remote) = &inner.remote else {
            // Local-only mode
            if file_exists(&live).await {
                return Ok(false);
            }
            if parts.fork_id.is_some() {
                if !can_create_fork {
                    return Err(DocStorageError::ForkForbidden(doc_id.to_string()));
                }
                if parts.snapshot_id.is_some() {
                    return Err(DocStorageError::DocNotFound(doc_id.to_string()));
                }
                if parts.trunk_id != NEW_DOCUMENT_CODE {
                    let trunk = docid::doc_path(&inner.docs_root, &parts.trunk_id);
                    if !file_exists(&trunk).await {
                        return Err(DocStorageError::DocNotFound(parts.trunk_id.clone()));
                    }
                    // The trunk may be open with writers; copy consistently
                    self.snapshot_to(&trunk, &live).await?;
                    return Ok(true);
                }
                return Ok(true);
            }
            if parts.snapshot_id.is_some() {
                return Err(DocStorageError::DocNotFound(doc_id.to_string()));
            }
            return Ok(true);
        };

        // Remote enabled and a local file present: decide whether to trust it
        if file_exists(&live).await {
            match status.doc_md5.as_deref() {
                // Never uploaded, or tombstoned and being recreated: the
                // local file is the only copy there is
                None | Some(DELETED_TOKEN) => return Ok(false),
                Some(directory_md5) => {
                    let hash_file = docid::hash_path(&inner.docs_root, doc_id);
                    match read_optional(&hash_file).await?.as_deref() {
                        Some(recorded) if recorded == directory_md5 => return Ok(false),
                        Some(_) => {
                            // Sidecar disagrees; check the actual content
                            // through a consistent copy
                            let content_md5 = self.content_hash(doc_id, &live).await?;
                            if content_md5 == directory_md5 {
                                tokio::fs::write(&hash_file, directory_md5).await?;
                                return Ok(false);
                            }
                        }
                        // A file with no digest sidecar while the directory
                        // knows one is a torn leftover
                        None => {}
                    }
                    // Remote wins; the local file is discarded
                    Logger::warn(
                        Event::LocalStale,
                        &[("doc_id", doc_id), ("directory_md5", directory_md5)],
                    );
                    tokio::fs::remove_file(&live).await?;
                    remove_if_exists(&hash_file).await?;
                }
            }
        }

        // Fetch from remote, or derive, or report new
        if remote.exists(&remote_doc).await? {
            remote
                .download(&remote_doc, &live, parts.snapshot_id.as_deref())
                .await?;
            inner.metrics.increment_downloads();
            Logger::info(Event::DocFetched, &[("doc_id", doc_id)]);
            return Ok(false);
        }
        if parts.fork_id.is_some() {
            if !can_create_fork {
                return Err(DocStorageError::ForkForbidden(doc_id.to_string()));
            }
            if parts.snapshot_id.is_some() {
                return Err(DocStorageError::DocNotFound(doc_id.to_string()));
            }
            if parts.trunk_id == NEW_DOCUMENT_CODE {
                return Ok(true);
            }
            if !remote.exists(&parts.trunk_id).await? {
                return Err(DocStorageError::DocNotFound(parts.trunk_id.clone()));
            }
            remote.download(&parts.trunk_id, &live, None).await?;
            inner.metrics.increment_downloads();
            Logger::info(
                Event::DocFetched,
                &[("doc_id", doc_id), ("trunk_id", &parts.trunk_id)],
            );
            return Ok(true);
        }
        if parts.snapshot_id.is_some() {
            return Err(DocStorageError::DocNotFound(doc_id.to_string()));
        }
        Ok(true)
    }

    /// Digest of the document's current content, taken through a consistent
    /// copy so a concurrent writer cannot tear the hash.
    async fn content_hash(&self, doc_id: &str, live: &Path) -> DocStorageResult<String> {
        let tmp = docid::backup_path(&self.inner.docs_root, doc_id, &Uuid::new_v4().to_string());
        let live = live.to_path_buf();
        let backup_dest = tmp.clone();
        let result = tokio::task::spawn_blocking(move || -> DocStorageResult<String> {
            sqlite::backup_sqlite_database(&live, &backup_dest, None)?;
            Ok(checksum::compute_file_checksum(&backup_dest)?)
        })
        .await
        .map_err(|e| DocStorageError::Io(e.to_string()))?;
        self.inner.metrics.increment_backups();
        let _ = remove_if_exists(&tmp).await;
        result
    }

    /// Consistent copy of `src` into `dest` on the blocking pool.
    async fn snapshot_to(&self, src: &Path, dest: &Path) -> DocStorageResult<()> {
        let src = src.to_path_buf();
        let dest = dest.to_path_buf();
        tokio::task::spawn_blocking(move || sqlite::backup_sqlite_database(&src, &dest, None))
            .await
            .map_err(|e| DocStorageError::Io(e.to_string()))??;
        self.inner.metrics.increment_backups();
        Ok(())
    }

    async fn fetch_replacement(
        &self,
        source_id: &str,
        version: Option<&str>,
        dest: &Path,
    ) -> DocStorageResult<()> {
        match &self.inner.remote {
            Some(remote) => {
                remote.download(source_id, dest, version).await?;
                self.inner.metrics.increment_downloads();
                Ok(())
            }
            None => {
                if version.is_some() {
                    return Err(DocStorageError::UnsupportedOp(
                        "snapshots require remote storage",
                    ));
                }
                let source_path = docid::doc_path(&self.inner.docs_root, source_id);
                if !file_exists(&source_path).await {
                    return Err(DocStorageError::DocNotFound(source_id.to_string()));
                }
                self.snapshot_to(&source_path, dest).await
            }
        }
    }

    /// Remove leftovers of interrupted work. A `-replacing` holder means a
    /// crashed replace; the live file is authoritative. Abandoned backup
    /// sidecars are swept only while no push could be using one.
    async fn cleanup_stale_sidecars(&self, doc_id: &str) -> DocStorageResult<()> {
        let replacing = docid::replacing_path(&self.inner.docs_root, doc_id);
        if file_exists(&replacing).await {
            Logger::warn(Event::ReplaceRecovered, &[("doc_id", doc_id)]);
            tokio::fs::remove_file(&replacing).await?;
        }

        if self.uploads.has_pending_operation(doc_id) {
            return Ok(());
        }
        let prefix = format!("{}{}-backup-", doc_id, docid::DOC_EXT);
        let mut entries = tokio::fs::read_dir(&self.inner.docs_root).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if name.starts_with(&prefix) {
                Logger::warn(
                    Event::SidecarSwept,
                    &[("doc_id", doc_id), ("sidecar", name)],
                );
                let _ = tokio::fs::remove_file(entry.path()).await;
            }
        }
        Ok(())
    }
}

/// The push worker: snapshot the live SQLite file to a sidecar, upload it
/// through the checksummed store (which settles `-hash` and the directory
/// digest), notify the pruner, and always remove the sidecar.
async fn push_to_store(
    inner: Arc<Inner>,
    pruner: Option<Arc<SnapshotPruner>>,
    doc_id: String,
) -> DocStorageResult<()> {
    if inner.prepare_files.lock().unwrap().contains(&doc_id) {
        // Materialization owns the file right now; the scheduler's retry
        // policy requeues us
        return Err(DocStorageError::TransientRemote(format!(
            "document {} is still being prepared",
            doc_id
        )));
    }
    let Some(remote) = inner.remote.clone() else {
        return Ok(());
    };

    let live = docid::doc_path(&inner.docs_root, &doc_id);
    let tmp = docid::backup_path(&inner.docs_root, &doc_id, &Uuid::new_v4().to_string());

    let src = live.clone();
    let dest = tmp.clone();
    let backup = tokio::task::spawn_blocking(move || sqlite::backup_sqlite_database(&src, &dest, None))
        .await
        .map_err(|e| DocStorageError::Io(e.to_string()));
    inner.metrics.increment_backups();

    let result = match backup {
        Ok(Ok(())) => match remote.upload(&doc_id, &tmp).await {
            Ok(_digest) => {
                inner.metrics.increment_uploads();
                if let Some(pruner) = &pruner {
                    pruner.request_prune(&doc_id);
                }
                Ok(())
            }
            Err(e) => Err(e.into()),
        },
        Ok(Err(e)) => Err(e.into()),
        Err(e) => Err(e),
    };

    // The sidecar never outlives the push, success or not
    let _ = remove_if_exists(&tmp).await;
    result
}

async fn file_exists(path: &Path) -> bool {
    tokio::fs::metadata(path).await.is_ok()
}

async fn read_optional(path: &Path) -> DocStorageResult<Option<String>> {
    match tokio::fs::read_to_string(path).await {
        Ok(contents) => Ok(Some(contents.trim().to_string())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

async fn remove_if_exists(path: &Path) -> DocStorageResult<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
