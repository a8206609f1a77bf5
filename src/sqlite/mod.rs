//! SQLite snapshotter
//!
//! Produces a consistent copy of a live SQLite database into a sidecar file
//! using the engine's incremental backup API, without holding long locks.
//! The upload path, `get_copy`, and hash verification all allocate their own
//! uniquely-suffixed sidecar and run this copy.

mod backup;
mod errors;

pub use backup::{backup_sqlite_database, BackupAction, BackupPhase, BackupProgress};
pub use errors::{SqliteBackupError, SqliteBackupResult};
