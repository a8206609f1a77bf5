//! Snapshot pruner
//!
//! Every successful push creates a new remote version. The pruner trims old
//! versions in the background: upload completions signal `request_prune`,
//! requests are debounced aggressively per document, and a pruning pass
//! lists versions and deletes whatever the retention strategy rejects.
//!
//! Pruning is best effort. A failed pass is dropped; the next upload
//! schedules another one.

use std::sync::Arc;
use std::time::Duration;

use crate::observability::{Event, Logger, MetricsRegistry};
use crate::scheduler::{KeyedOps, KeyedOpsOptions};
use crate::store::{ChecksummedStore, ObjectVersion, StoreError};

/// Retention strategy seam. Versions arrive newest first; the strategy
/// returns the snapshot ids to delete.
pub trait SnapshotRetention: Send + Sync {
    fn prune(&self, versions: &[ObjectVersion]) -> Vec<String>;
}

/// Keep the newest `count` versions, drop the rest.
#[derive(Debug, Clone)]
pub struct KeepRecent {
    pub count: usize,
}

impl Default for KeepRecent {
    fn default() -> Self {
        Self { count: 30 }
    }
}

impl SnapshotRetention for KeepRecent {
    fn prune(&self, versions: &[ObjectVersion]) -> Vec<String> {
        versions
            .iter()
            .skip(self.count)
            .map(|v| v.snapshot_id.clone())
            .collect()
    }
}

/// Background deletion of old document versions.
pub struct SnapshotPruner {
    ops: KeyedOps<StoreError>,
}

impl SnapshotPruner {
    /// `delay` is the per-document debounce window; callers pass a multiple
    /// of the push debounce so pruning never races bursts of uploads.
    pub fn new(
        store: Arc<ChecksummedStore>,
        retention: Arc<dyn SnapshotRetention>,
        delay: Duration,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        let options = KeyedOpsOptions {
            delay_before_operation: delay,
            initial_retry_delay: delay,
            retry: false,
        };
        let worker_store = Arc::clone(&store);
        let worker_metrics = Arc::clone(&metrics);
        let ops = KeyedOps::with_error_logger(
            options,
            move |doc_id: String| {
                let store = Arc::clone(&worker_store);
                let retention = Arc::clone(&retention);
                let metrics = Arc::clone(&worker_metrics);
                async move {
                    let versions = store.versions(&doc_id).await?;
                    let stale = retention.prune(&versions);
                    if !stale.is_empty() {
                        store.remove_versions(&doc_id, &stale).await?;
                        metrics.add_versions_pruned(stale.len() as u64);
                    }
                    metrics.increment_prunes();
                    Ok(())
                }
            },
            |doc_id, failure_count, err: &StoreError| {
                Logger::error(
                    Event::PruneFailed,
                    &[
                        ("doc_id", doc_id),
                        ("failure_count", &failure_count.to_string()),
                        ("error", &err.to_string()),
                    ],
                );
            },
        );
        Self { ops }
    }

    /// Called by the uploader right after a version lands.
    pub fn request_prune(&self, doc_id: &str) {
        self.ops.add_operation(doc_id);
    }

    /// Resolves when no pruning work is outstanding.
    pub async fn wait(&self) {
        self.ops.wait(None).await;
    }

    /// Run whatever is pending immediately and drain.
    pub async fn close(&self) {
        self.ops.expedite_all();
        self.ops.wait(None).await;
    }
}
