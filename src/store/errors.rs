//! Object store errors

use thiserror::Error;

/// Result type for object store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Object store errors
///
/// Clonable so results can be fanned out to concurrent waiters.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// No object under the key
    #[error("object not found: {0}")]
    ObjectNotFound(String),

    /// The key exists but not the requested version
    #[error("version not found: {key} at {snapshot_id}")]
    VersionNotFound { key: String, snapshot_id: String },

    /// Downloaded or uploaded content disagrees with the expected digest
    #[error("checksum mismatch for {key}: expected {expected}, observed {observed}")]
    ChecksumMismatch {
        key: String,
        expected: String,
        observed: String,
    },

    /// The raw store kept disagreeing with the shared hash register after
    /// all retries
    #[error("storage inconsistent with shared hash for {0}")]
    Inconsistent(String),

    /// Filesystem failure
    #[error("I/O error: {0}")]
    Io(String),

    /// Transport-level failure talking to the store
    #[error("transient storage error: {0}")]
    Transient(String),
}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        Self::Io(e.to_string())
    }
}
