//! Object storage layer
//!
//! A raw versioned blob store trait, a filesystem implementation, and the
//! checksummed wrapper that masks eventual consistency behind content
//! digests. The wrapper is what the storage manager talks to; the raw trait
//! is the seam for S3-style backends.

mod backend;
mod checksummed;
mod errors;
mod local;

pub use backend::{ObjectMetadata, ObjectStore, ObjectVersion};
pub use checksummed::{
    ChecksummedStore, FileHashRegister, HashRegister, RetryOptions, DELETED_TOKEN,
};
pub use errors::{StoreError, StoreResult};
pub use local::LocalVersionedStore;
