//! Observable events
//!
//! Every log line the storage core emits names one of these events. They
//! cover:
//! - Document materialization and recovery
//! - Push / upload outcomes
//! - The SQLite copy loop
//! - Pruning and metadata pushes
//! - Storage lifecycle
//!
//! Events are explicit and typed; the logger does not accept free-form
//! event names.

use std::fmt;

/// Observable events in the document storage core
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    // Materialization
    /// Document content fetched from the object store
    DocFetched,
    /// Local file disagreed with the directory digest and was discarded
    LocalStale,
    /// A crashed replace left its holder behind; the live file wins
    ReplaceRecovered,
    /// Abandoned transient sidecar removed
    SidecarSwept,

    // Push
    /// A push attempt failed; the document stays scheduled
    PushFailed,

    // Deletion
    /// Document permanently deleted
    DocDeleted,

    // SQLite copy loop
    /// The engine reported busy/locked during a copy step
    BackupWait,
    /// A writer interrupted the copy and the engine started over
    BackupRestart,

    // Pruning
    /// A pruning pass failed and was dropped
    PruneFailed,

    // Metadata
    /// A batch of edit-time updates could not be pushed
    UpdatePushFailed,

    // Lifecycle
    /// Shutdown is waiting on outstanding uploads
    DrainWait,
    /// Storage closed; no new work starts
    StorageClosed,
}

impl Event {
    /// Returns the string representation of the event
    pub fn as_str(&self) -> &'static str {
        match self {
            // Materialization
            Event::DocFetched => "DOC_FETCHED",
            Event::LocalStale => "DOC_LOCAL_STALE",
            Event::ReplaceRecovered => "DOC_REPLACE_RECOVERED",
            Event::SidecarSwept => "DOC_SIDECAR_SWEPT",

            // Push
            Event::PushFailed => "DOC_PUSH_FAILED",

            // Deletion
            Event::DocDeleted => "DOC_DELETED",

            // SQLite copy loop
            Event::BackupWait => "SQLITE_BACKUP_WAIT",
            Event::BackupRestart => "SQLITE_BACKUP_RESTART",

            // Pruning
            Event::PruneFailed => "SNAPSHOT_PRUNE_FAILED",

            // Metadata
            Event::UpdatePushFailed => "DOC_UPDATE_PUSH_FAILED",

            // Lifecycle
            Event::DrainWait => "STORAGE_DRAIN_WAIT",
            Event::StorageClosed => "STORAGE_CLOSED",
        }
    }

    /// Returns true if this event reports a failed operation
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            Event::PushFailed | Event::PruneFailed | Event::UpdatePushFailed
        )
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_events_have_string_representation() {
        let events = [
            Event::DocFetched,
            Event::LocalStale,
            Event::ReplaceRecovered,
            Event::SidecarSwept,
            Event::PushFailed,
            Event::DocDeleted,
            Event::BackupWait,
            Event::BackupRestart,
            Event::PruneFailed,
            Event::UpdatePushFailed,
            Event::DrainWait,
            Event::StorageClosed,
        ];

        for event in events {
            let s = event.as_str();
            assert!(!s.is_empty());
            // Verify all uppercase format
            assert!(s.chars().all(|c| c.is_uppercase() || c == '_'));
        }
    }

    #[test]
    fn test_failure_events() {
        assert!(Event::PushFailed.is_failure());
        assert!(Event::PruneFailed.is_failure());
        assert!(Event::UpdatePushFailed.is_failure());
        assert!(!Event::DocFetched.is_failure());
        assert!(!Event::StorageClosed.is_failure());
    }

    #[test]
    fn test_event_display() {
        assert_eq!(format!("{}", Event::DocFetched), "DOC_FETCHED");
        assert_eq!(format!("{}", Event::BackupRestart), "SQLITE_BACKUP_RESTART");
    }
}
