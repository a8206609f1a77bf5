//! SQLite snapshotter errors

use thiserror::Error;

/// Result type for snapshot copies
pub type SqliteBackupResult<T> = Result<T, SqliteBackupError>;

/// Errors from copying a live SQLite database
#[derive(Debug, Error)]
pub enum SqliteBackupError {
    /// Source or destination could not be opened
    #[error("failed to open database {path}: {message}")]
    Open { path: String, message: String },

    /// The incremental backup failed partway
    #[error("backup step failed: {0}")]
    Step(String),

    /// Destination could not be finalized
    #[error("failed to close destination database: {0}")]
    Close(String),

    /// Filesystem error around the copy
    #[error("I/O error: {0}")]
    Io(String),
}

impl From<std::io::Error> for SqliteBackupError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}
