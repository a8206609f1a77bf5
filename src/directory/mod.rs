//! Worker directory client
//!
//! The directory is a remote map of `docId → {owner worker, active flag,
//! content digest}` shared by all document workers. It is the authority on
//! ownership (exactly one worker may open a document) and on the current
//! content digest (the shared hash consulted by the checksummed store).
//!
//! Implementations must be atomic per docId; claim and digest update are
//! compare-and-set style operations on the backing service.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;

use crate::store::{HashRegister, StoreError, StoreResult};

/// Result type for directory operations
pub type DirResult<T> = Result<T, DirectoryError>;

/// Worker directory errors. All remote failures are transient from the
/// core's point of view; retry policy lives with the caller.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DirectoryError {
    #[error("worker directory error: {0}")]
    Transient(String),
}

/// Identity of a document worker process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerInfo {
    pub id: String,
}

/// Directory record for one document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocStatus {
    /// The worker that owns the document.
    pub doc_worker: WorkerInfo,
    /// False when the assignment is being torn down; owners must not serve.
    pub is_active: bool,
    /// Authoritative content digest: hex MD5, `None` for never-uploaded
    /// documents, or the DELETED sentinel for tombstones.
    pub doc_md5: Option<String>,
}

/// Remote map of document assignments.
#[async_trait]
pub trait DocWorkerMap: Send + Sync {
    /// Return the assignment for `doc_id`, claiming it for `worker_id` if
    /// unassigned. Atomic per docId.
    async fn get_or_assign(&self, doc_id: &str, worker_id: &str) -> DirResult<DocStatus>;

    /// Current assignment, if any.
    async fn get(&self, doc_id: &str) -> DirResult<Option<DocStatus>>;

    /// Atomically replace the recorded content digest.
    async fn update_doc_md5(&self, doc_id: &str, md5: &str) -> DirResult<()>;
}

/// Directory held in process memory. Serves tests and single-node
/// deployments where no external directory service exists.
#[derive(Debug, Default)]
pub struct InMemoryDocWorkerMap {
    docs: RwLock<HashMap<String, DocStatus>>,
}

impl InMemoryDocWorkerMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Force an assignment, for tests exercising the not-owner paths.
    pub async fn assign(&self, doc_id: &str, worker_id: &str, is_active: bool) {
        let mut docs = self.docs.write().await;
        let entry = docs.entry(doc_id.to_string()).or_insert_with(|| DocStatus {
            doc_worker: WorkerInfo {
                id: worker_id.to_string(),
            },
            is_active,
            doc_md5: None,
        });
        entry.doc_worker.id = worker_id.to_string();
        entry.is_active = is_active;
    }
}

#[async_trait]
impl DocWorkerMap for InMemoryDocWorkerMap {
    async fn get_or_assign(&self, doc_id: &str, worker_id: &str) -> DirResult<DocStatus> {
        let mut docs = self.docs.write().await;
        let status = docs
            .entry(doc_id.to_string())
            .or_insert_with(|| DocStatus {
                doc_worker: WorkerInfo {
                    id: worker_id.to_string(),
                },
                is_active: true,
                doc_md5: None,
            });
        Ok(status.clone())
    }

    async fn get(&self, doc_id: &str) -> DirResult<Option<DocStatus>> {
        Ok(self.docs.read().await.get(doc_id).cloned())
    }

    async fn update_doc_md5(&self, doc_id: &str, md5: &str) -> DirResult<()> {
        let mut docs = self.docs.write().await;
        match docs.get_mut(doc_id) {
            Some(status) => {
                status.doc_md5 = Some(md5.to_string());
                Ok(())
            }
            None => Err(DirectoryError::Transient(format!(
                "no assignment for {}",
                doc_id
            ))),
        }
    }
}

/// Adapter exposing the directory's digest column as the shared hash
/// register consumed by the checksummed store.
pub struct DirectoryHashRegister {
    directory: Arc<dyn DocWorkerMap>,
}

impl DirectoryHashRegister {
    pub fn new(directory: Arc<dyn DocWorkerMap>) -> Self {
        Self { directory }
    }
}

#[async_trait]
impl HashRegister for DirectoryHashRegister {
    async fn get_hash(&self, key: &str) -> StoreResult<Option<String>> {
        let status = self
            .directory
            .get(key)
            .await
            .map_err(|e| StoreError::Transient(e.to_string()))?;
        Ok(status.and_then(|s| s.doc_md5))
    }

    async fn set_hash(&self, key: &str, hash: &str) -> StoreResult<()> {
        self.directory
            .update_doc_md5(key, hash)
            .await
            .map_err(|e| StoreError::Transient(e.to_string()))
    }
}
