//! Storage manager error taxonomy
//!
//! Transient remote failures are absorbed by the retry loops in the
//! checksummed store and the upload scheduler; what surfaces here is either
//! a permanent condition or a transient one whose retries were exhausted.
//!
//! Clonable: results flow through shared presence futures and scheduler
//! waiters, which fan one outcome out to several callers.

use thiserror::Error;

use crate::directory::DirectoryError;
use crate::docid::InvalidDocId;
use crate::sqlite::SqliteBackupError;
use crate::store::StoreError;

/// Result type for storage manager operations
pub type DocStorageResult<T> = Result<T, DocStorageError>;

/// Storage manager errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DocStorageError {
    /// The docId fails the character class or canonical form
    #[error("invalid document id: {0}")]
    InvalidDocId(String),

    /// The worker directory says the doc is inactive or owned elsewhere
    #[error("document {0} is not available on this worker")]
    NotOwner(String),

    /// Missing remotely and not derivable from a trunk or snapshot
    #[error("document not found: {0}")]
    DocNotFound(String),

    /// Derived-doc creation requested by someone other than the fork owner
    #[error("fork creation not allowed for {0}")]
    ForkForbidden(String),

    /// Operation this manager does not provide
    #[error("unsupported operation: {0}")]
    UnsupportedOp(&'static str),

    /// Reentrant prepare on the same docId
    #[error("document {0} is already being prepared")]
    ConcurrentPrepare(String),

    /// Mutating call after close_storage
    #[error("document storage is closed")]
    AfterClose,

    /// Object store or directory failure that outlived its retries
    #[error("transient remote error: {0}")]
    TransientRemote(String),

    /// The SQLite snapshot aborted; the sidecar has been cleaned up
    #[error("backup failed: {0}")]
    BackupFailed(String),

    /// Local filesystem failure
    #[error("I/O error: {0}")]
    Io(String),
}

impl From<InvalidDocId> for DocStorageError {
    fn from(e: InvalidDocId) -> Self {
        Self::InvalidDocId(e.0)
    }
}

impl From<std::io::Error> for DocStorageError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

impl From<StoreError> for DocStorageError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::ObjectNotFound(key) => Self::DocNotFound(key),
            StoreError::VersionNotFound { key, snapshot_id } => {
                Self::DocNotFound(format!("{} at {}", key, snapshot_id))
            }
            other => Self::TransientRemote(other.to_string()),
        }
    }
}

impl From<DirectoryError> for DocStorageError {
    fn from(e: DirectoryError) -> Self {
        Self::TransientRemote(e.to_string())
    }
}

impl From<SqliteBackupError> for DocStorageError {
    fn from(e: SqliteBackupError) -> Self {
        Self::BackupFailed(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_not_found_maps_to_doc_not_found() {
        let err: DocStorageError = StoreError::ObjectNotFound("abc.grist".into()).into();
        assert!(matches!(err, DocStorageError::DocNotFound(_)));
    }

    #[test]
    fn test_store_transient_maps_to_transient_remote() {
        let err: DocStorageError = StoreError::Transient("timeout".into()).into();
        assert!(matches!(err, DocStorageError::TransientRemote(_)));
    }

    #[test]
    fn test_errors_are_clonable() {
        let err = DocStorageError::ConcurrentPrepare("abc".into());
        assert_eq!(err.clone(), err);
    }
}
