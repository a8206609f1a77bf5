//! Raw object store trait
//!
//! A CRUD-plus-versions abstraction over an S3-style versioned blob store.
//! Implementations are expected to be eventually consistent; consistency
//! masking lives in the checksummed wrapper, not here.

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::errors::StoreResult;

/// One historical version of an object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectVersion {
    /// Native version id assigned by the store
    pub snapshot_id: String,
    /// When the version was written
    pub last_modified: DateTime<Utc>,
}

/// Metadata observed on the current version of an object.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObjectMetadata {
    /// Content digest the version was tagged with at upload, if known
    pub content_md5: Option<String>,
    /// Version id of the current version, if the store is versioned
    pub snapshot_id: Option<String>,
}

/// Versioned blob store keyed by string.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Whether any version of `key` exists.
    async fn exists(&self, key: &str) -> StoreResult<bool>;

    /// Metadata of the current version, or `None` if the key is absent.
    async fn head(&self, key: &str) -> StoreResult<Option<ObjectMetadata>>;

    /// Store the file at `path` as the new current version of `key`.
    /// Returns the new version id when the store is versioned.
    async fn upload(&self, key: &str, path: &Path) -> StoreResult<Option<String>>;

    /// Fetch a version of `key` (the current one when `snapshot_id` is
    /// `None`) into the file at `path`.
    async fn download(&self, key: &str, path: &Path, snapshot_id: Option<&str>)
        -> StoreResult<()>;

    /// Delete the object and all its versions.
    async fn remove(&self, key: &str) -> StoreResult<()>;

    /// Delete the named versions only.
    async fn remove_versions(&self, key: &str, snapshot_ids: &[String]) -> StoreResult<()>;

    /// List versions, newest first.
    async fn versions(&self, key: &str) -> StoreResult<Vec<ObjectVersion>>;
}
