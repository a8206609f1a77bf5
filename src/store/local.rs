//! Filesystem-backed versioned object store
//!
//! Keeps every uploaded version as a blob under `<root>/<key>.v/` with a
//! JSON manifest alongside listing versions newest first. Used by tests and
//! by deployments that point the storage layer at a shared filesystem
//! instead of an object store service.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::backend::{ObjectMetadata, ObjectStore, ObjectVersion};
use super::errors::{StoreError, StoreResult};
use crate::checksum;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredVersion {
    snapshot_id: String,
    last_modified: DateTime<Utc>,
    content_md5: String,
}

impl From<&StoredVersion> for ObjectVersion {
    fn from(v: &StoredVersion) -> Self {
        ObjectVersion {
            snapshot_id: v.snapshot_id.clone(),
            last_modified: v.last_modified,
        }
    }
}

/// Local filesystem store with native version support.
#[derive(Debug)]
pub struct LocalVersionedStore {
    root: PathBuf,
    // Serializes manifest read-modify-write cycles
    manifest_lock: Mutex<()>,
}

impl LocalVersionedStore {
    /// Create a store rooted at `root`. The directory is created lazily.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            manifest_lock: Mutex::new(()),
        }
    }

    fn manifest_path(&self, key: &str) -> PathBuf {
        self.root.join(format!("{}.versions.json", key))
    }

    fn blob_path(&self, key: &str, snapshot_id: &str) -> PathBuf {
        self.root.join(format!("{}.v", key)).join(snapshot_id)
    }

    async fn read_manifest(&self, key: &str) -> StoreResult<Vec<StoredVersion>> {
        match tokio::fs::read(self.manifest_path(key)).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_manifest(&self, key: &str, versions: &[StoredVersion]) -> StoreResult<()> {
        let path = self.manifest_path(key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let bytes = serde_json::to_vec_pretty(versions)?;
        tokio::fs::write(&path, bytes).await?;
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for LocalVersionedStore {
    async fn exists(&self, key: &str) -> StoreResult<bool> {
        Ok(!self.read_manifest(key).await?.is_empty())
    }

    async fn head(&self, key: &str) -> StoreResult<Option<ObjectMetadata>> {
        let manifest = self.read_manifest(key).await?;
        Ok(manifest.first().map(|v| ObjectMetadata {
            content_md5: Some(v.content_md5.clone()),
            snapshot_id: Some(v.snapshot_id.clone()),
        }))
    }

    async fn upload(&self, key: &str, path: &Path) -> StoreResult<Option<String>> {
        let _guard = self.manifest_lock.lock().await;

        let snapshot_id = Uuid::new_v4().to_string();
        let blob = self.blob_path(key, &snapshot_id);
        if let Some(parent) = blob.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::copy(path, &blob).await?;

        let source = path.to_path_buf();
        let content_md5 = tokio::task::spawn_blocking(move || {
            checksum::compute_file_checksum(&source)
        })
        .await
        .map_err(|e| StoreError::Io(e.to_string()))??;

        let mut manifest = self.read_manifest(key).await?;
        manifest.insert(
            0,
            StoredVersion {
                snapshot_id: snapshot_id.clone(),
                last_modified: Utc::now(),
                content_md5,
            },
        );
        self.write_manifest(key, &manifest).await?;
        Ok(Some(snapshot_id))
    }

    async fn download(
        &self,
        key: &str,
        path: &Path,
        snapshot_id: Option<&str>,
    ) -> StoreResult<()> {
        let manifest = self.read_manifest(key).await?;
        let version = match snapshot_id {
            Some(id) => manifest
                .iter()
                .find(|v| v.snapshot_id == id)
                .ok_or_else(|| StoreError::VersionNotFound {
                    key: key.to_string(),
                    snapshot_id: id.to_string(),
                })?,
            None => manifest
                .first()
                .ok_or_else(|| StoreError::ObjectNotFound(key.to_string()))?,
        };
        tokio::fs::copy(self.blob_path(key, &version.snapshot_id), path).await?;
        Ok(())
    }

    async fn remove(&self, key: &str) -> StoreResult<()> {
        let _guard = self.manifest_lock.lock().await;

        match tokio::fs::remove_file(self.manifest_path(key)).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        match tokio::fs::remove_dir_all(self.root.join(format!("{}.v", key))).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }

    async fn remove_versions(&self, key: &str, snapshot_ids: &[String]) -> StoreResult<()> {
        let _guard = self.manifest_lock.lock().await;

        let manifest = self.read_manifest(key).await?;
        let (drop, keep): (Vec<_>, Vec<_>) = manifest
            .into_iter()
            .partition(|v| snapshot_ids.contains(&v.snapshot_id));
        for version in &drop {
            match tokio::fs::remove_file(self.blob_path(key, &version.snapshot_id)).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        self.write_manifest(key, &keep).await?;
        Ok(())
    }

    async fn versions(&self, key: &str) -> StoreResult<Vec<ObjectVersion>> {
        Ok(self
            .read_manifest(key)
            .await?
            .iter()
            .map(ObjectVersion::from)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn write_source(dir: &Path, name: &str, contents: &[u8]) -> PathBuf {
        let path = dir.join(name);
        tokio::fs::write(&path, contents).await.unwrap();
        path
    }

    #[tokio::test]
    async fn test_upload_download_round_trip() {
        let temp = TempDir::new().unwrap();
        let store = LocalVersionedStore::new(temp.path().join("remote"));
        let src = write_source(temp.path(), "src.grist", b"contents v1").await;

        store.upload("docs/abc.grist", &src).await.unwrap();

        let dest = temp.path().join("dest.grist");
        store.download("docs/abc.grist", &dest, None).await.unwrap();
        assert_eq!(tokio::fs::read(&dest).await.unwrap(), b"contents v1");
    }

    #[tokio::test]
    async fn test_versions_newest_first() {
        let temp = TempDir::new().unwrap();
        let store = LocalVersionedStore::new(temp.path().join("remote"));
        let v1 = write_source(temp.path(), "v1", b"one").await;
        let v2 = write_source(temp.path(), "v2", b"two").await;

        let id1 = store.upload("abc.grist", &v1).await.unwrap().unwrap();
        let id2 = store.upload("abc.grist", &v2).await.unwrap().unwrap();

        let versions = store.versions("abc.grist").await.unwrap();
        assert_eq!(versions.len(), 2);
        assert_eq!(versions[0].snapshot_id, id2);
        assert_eq!(versions[1].snapshot_id, id1);
    }

    #[tokio::test]
    async fn test_download_specific_version() {
        let temp = TempDir::new().unwrap();
        let store = LocalVersionedStore::new(temp.path().join("remote"));
        let v1 = write_source(temp.path(), "v1", b"one").await;
        let v2 = write_source(temp.path(), "v2", b"two").await;

        let id1 = store.upload("abc.grist", &v1).await.unwrap().unwrap();
        store.upload("abc.grist", &v2).await.unwrap();

        let dest = temp.path().join("dest");
        store.download("abc.grist", &dest, Some(&id1)).await.unwrap();
        assert_eq!(tokio::fs::read(&dest).await.unwrap(), b"one");
    }

    #[tokio::test]
    async fn test_head_reports_digest() {
        let temp = TempDir::new().unwrap();
        let store = LocalVersionedStore::new(temp.path().join("remote"));
        let src = write_source(temp.path(), "src", b"payload").await;

        assert_eq!(store.head("abc.grist").await.unwrap(), None);

        store.upload("abc.grist", &src).await.unwrap();
        let meta = store.head("abc.grist").await.unwrap().unwrap();
        assert_eq!(
            meta.content_md5.as_deref(),
            Some(checksum::compute_checksum(b"payload").as_str())
        );
    }

    #[tokio::test]
    async fn test_remove_deletes_all_versions() {
        let temp = TempDir::new().unwrap();
        let store = LocalVersionedStore::new(temp.path().join("remote"));
        let src = write_source(temp.path(), "src", b"data").await;

        store.upload("abc.grist", &src).await.unwrap();
        store.upload("abc.grist", &src).await.unwrap();
        assert!(store.exists("abc.grist").await.unwrap());

        store.remove("abc.grist").await.unwrap();
        assert!(!store.exists("abc.grist").await.unwrap());
        assert!(store.versions("abc.grist").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_remove_versions_keeps_others() {
        let temp = TempDir::new().unwrap();
        let store = LocalVersionedStore::new(temp.path().join("remote"));
        let v1 = write_source(temp.path(), "v1", b"one").await;
        let v2 = write_source(temp.path(), "v2", b"two").await;

        let id1 = store.upload("abc.grist", &v1).await.unwrap().unwrap();
        let id2 = store.upload("abc.grist", &v2).await.unwrap().unwrap();

        store
            .remove_versions("abc.grist", &[id1.clone()])
            .await
            .unwrap();

        let versions = store.versions("abc.grist").await.unwrap();
        assert_eq!(versions.len(), 1);
        assert_eq!(versions[0].snapshot_id, id2);

        let dest = temp.path().join("dest");
        assert!(matches!(
            store.download("abc.grist", &dest, Some(&id1)).await,
            Err(StoreError::VersionNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_download_missing_key() {
        let temp = TempDir::new().unwrap();
        let store = LocalVersionedStore::new(temp.path().join("remote"));
        let dest = temp.path().join("dest");

        assert!(matches!(
            store.download("ghost.grist", &dest, None).await,
            Err(StoreError::ObjectNotFound(_))
        ));
    }
}
