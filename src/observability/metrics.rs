//! Metrics registry
//!
//! - Counters only
//! - Monotonic increase, reset only on process start
//! - Thread-safe but lock-free

use std::sync::atomic::{AtomicU64, Ordering};

/// Operational counters for the document storage core.
///
/// All counters use atomic increments with `Relaxed` ordering; metrics do not
/// need to synchronize with the operations they count.
#[derive(Debug, Default)]
pub struct MetricsRegistry {
    /// Documents pushed to the object store
    uploads: AtomicU64,
    /// Documents fetched from the object store
    downloads: AtomicU64,
    /// SQLite backups taken (pushes, copies, hash checks)
    backups: AtomicU64,
    /// Push attempts that failed (and were rescheduled)
    push_failures: AtomicU64,
    /// Pruning passes completed
    prunes: AtomicU64,
    /// Snapshot versions deleted by pruning
    versions_pruned: AtomicU64,
}

impl MetricsRegistry {
    /// Create a new registry with all counters at zero
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment the upload counter
    pub fn increment_uploads(&self) {
        self.uploads.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment the download counter
    pub fn increment_downloads(&self) {
        self.downloads.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment the backup counter
    pub fn increment_backups(&self) {
        self.backups.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment the push failure counter
    pub fn increment_push_failures(&self) {
        self.push_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment the prune pass counter
    pub fn increment_prunes(&self) {
        self.prunes.fetch_add(1, Ordering::Relaxed);
    }

    /// Add to the pruned version counter
    pub fn add_versions_pruned(&self, count: u64) {
        self.versions_pruned.fetch_add(count, Ordering::Relaxed);
    }

    /// Current upload count
    pub fn uploads(&self) -> u64 {
        self.uploads.load(Ordering::Relaxed)
    }

    /// Current download count
    pub fn downloads(&self) -> u64 {
        self.downloads.load(Ordering::Relaxed)
    }

    /// Current backup count
    pub fn backups(&self) -> u64 {
        self.backups.load(Ordering::Relaxed)
    }

    /// Current push failure count
    pub fn push_failures(&self) -> u64 {
        self.push_failures.load(Ordering::Relaxed)
    }

    /// Current prune pass count
    pub fn prunes(&self) -> u64 {
        self.prunes.load(Ordering::Relaxed)
    }

    /// Current pruned version count
    pub fn versions_pruned(&self) -> u64 {
        self.versions_pruned.load(Ordering::Relaxed)
    }
}
