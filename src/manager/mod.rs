//! Document storage manager
//!
//! The top of the crate: ties the worker directory, the checksummed object
//! store, the SQLite snapshotter, the upload scheduler, the metadata queue
//! and the pruner into the document lifecycle API that document workers
//! call.

mod config;
mod errors;
mod hosted;

pub use config::{s3_disabled_by_env, DocStorageOptions};
pub use errors::{DocStorageError, DocStorageResult};
pub use hosted::{DocSnapshot, HostedDocStorage, HostedStorageConfig, ReplaceOptions};
