//! Consistent copies of live SQLite databases
//!
//! The copy uses the engine's incremental backup API so that the source can
//! keep serving reads and writes while the copy runs:
//!
//! 1. Remove any stale file at the destination.
//! 2. Open the destination with `synchronous=OFF` and `journal_mode=OFF`;
//!    the copy does not need to survive an OS crash, the source stays
//!    canonical.
//! 3. Step the backup up to 1024 pages at a time (4 KiB pages, ~4 MiB per
//!    step), sleeping 10 ms between steps to yield the write lock.
//! 4. Busy/locked reports from the engine are tolerated and logged at most
//!    once per second. A writer interrupting the copy makes the engine
//!    restart it; that shows up as `remaining` growing between steps and is
//!    also logged throttled.
//! 5. On completion the destination is closed; on any failure the partial
//!    destination file is removed.
//!
//! Everything here is blocking; callers on the async runtime drive it
//! through `tokio::task::spawn_blocking`.

use std::path::Path;
use std::time::Duration;

use rusqlite::backup::{Backup, StepResult};
use rusqlite::{Connection, OpenFlags};

use super::errors::{SqliteBackupError, SqliteBackupResult};
use crate::observability::{Event, LogThrottle};

/// Pages copied per backup step.
const PAGES_PER_STEP: std::os::raw::c_int = 1024;

/// Pause between steps, yielding the source write lock.
const STEP_SLEEP: Duration = Duration::from_millis(10);

/// Minimum interval between repeats of the same copy-loop warning.
const LOG_INTERVAL: Duration = Duration::from_secs(1);

/// What the copy is doing when a progress event fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupAction {
    /// Opening source and destination
    Open,
    /// One incremental backup step
    Step,
    /// Finalizing the destination
    Close,
}

/// Whether the event fires before or after the action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupPhase {
    Before,
    After,
}

/// Observability hook event. Pure test contract; production callers pass no
/// callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackupProgress {
    pub action: BackupAction,
    pub phase: BackupPhase,
}

fn emit(progress: &mut Option<&mut dyn FnMut(BackupProgress)>, action: BackupAction, phase: BackupPhase) {
    if let Some(cb) = progress {
        cb(BackupProgress { action, phase });
    }
}

/// Copies the database at `src` into `dest` while `src` may be read and
/// written concurrently.
///
/// On success `dest` is a consistent snapshot of some point during the call.
/// On failure no partial `dest` is left behind.
pub fn backup_sqlite_database(
    src: &Path,
    dest: &Path,
    mut progress: Option<&mut dyn FnMut(BackupProgress)>,
) -> SqliteBackupResult<()> {
    // A stale destination would make the backup API merge into old pages
    if dest.exists() {
        std::fs::remove_file(dest)?;
    }

    emit(&mut progress, BackupAction::Open, BackupPhase::Before);
    let src_conn = Connection::open_with_flags(src, OpenFlags::SQLITE_OPEN_READ_ONLY)
        .map_err(|e| SqliteBackupError::Open {
            path: src.display().to_string(),
            message: e.to_string(),
        })?;
    let mut dest_conn = Connection::open(dest).map_err(|e| SqliteBackupError::Open {
        path: dest.display().to_string(),
        message: e.to_string(),
    })?;
    emit(&mut progress, BackupAction::Open, BackupPhase::After);

    let result = configure_and_copy(&src_conn, &mut dest_conn, &mut progress);

    emit(&mut progress, BackupAction::Close, BackupPhase::Before);
    let close_result = dest_conn
        .close()
        .map_err(|(_, e)| SqliteBackupError::Close(e.to_string()));
    emit(&mut progress, BackupAction::Close, BackupPhase::After);

    match result.and(close_result) {
        Ok(()) => Ok(()),
        Err(e) => {
            // Never leave a torn copy for a later reader to trust
            let _ = std::fs::remove_file(dest);
            Err(e)
        }
    }
}

fn configure_and_copy(
    src_conn: &Connection,
    dest_conn: &mut Connection,
    progress: &mut Option<&mut dyn FnMut(BackupProgress)>,
) -> SqliteBackupResult<()> {
    dest_conn
        .pragma_update(None, "synchronous", "OFF")
        .map_err(|e| SqliteBackupError::Step(e.to_string()))?;
    // journal_mode returns a result row, so pragma_update is not usable here
    dest_conn
        .query_row("PRAGMA journal_mode=OFF", [], |_| Ok(()))
        .map_err(|e| SqliteBackupError::Step(e.to_string()))?;

    let backup = Backup::new(src_conn, dest_conn)
        .map_err(|e| SqliteBackupError::Step(e.to_string()))?;

    let mut throttle = LogThrottle::new(LOG_INTERVAL);
    let mut last_remaining: Option<i32> = None;

    loop {
        emit(progress, BackupAction::Step, BackupPhase::Before);
        let step = backup
            .step(PAGES_PER_STEP)
            .map_err(|e| SqliteBackupError::Step(e.to_string()));
        emit(progress, BackupAction::Step, BackupPhase::After);

        match step? {
            StepResult::Done => return Ok(()),
            StepResult::More => {}
            StepResult::Busy => {
                throttle.warn(Event::BackupWait, "database is busy", &[]);
            }
            StepResult::Locked => {
                throttle.warn(Event::BackupWait, "database is locked", &[]);
            }
            _ => {}
        }

        // A writer changed the source under us; the engine starts the copy
        // over. Expected under load, worth noticing in logs.
        let p = backup.progress();
        if let Some(last) = last_remaining {
            if p.remaining > last {
                throttle.warn(Event::BackupRestart, "backup restarted", &[]);
            }
        }
        last_remaining = Some(p.remaining);

        std::thread::sleep(STEP_SLEEP);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn create_test_db(path: &Path, rows: usize) {
        let conn = Connection::open(path).unwrap();
        conn.execute_batch("CREATE TABLE records (id INTEGER PRIMARY KEY, body TEXT)")
            .unwrap();
        for i in 0..rows {
            conn.execute(
                "INSERT INTO records (body) VALUES (?1)",
                [format!("row-{}", i)],
            )
            .unwrap();
        }
    }

    fn count_rows(path: &Path) -> i64 {
        let conn = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY).unwrap();
        conn.query_row("SELECT COUNT(*) FROM records", [], |row| row.get(0))
            .unwrap()
    }

    #[test]
    fn test_backup_copies_contents() {
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("doc.grist");
        let dest = temp.path().join("doc.grist-backup-t");
        create_test_db(&src, 100);

        backup_sqlite_database(&src, &dest, None).unwrap();

        assert!(dest.exists());
        assert_eq!(count_rows(&dest), 100);
    }

    #[test]
    fn test_backup_is_independent_copy() {
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("doc.grist");
        let dest = temp.path().join("copy.grist");
        create_test_db(&src, 10);

        backup_sqlite_database(&src, &dest, None).unwrap();

        // Mutating the source does not affect the copy
        let conn = Connection::open(&src).unwrap();
        conn.execute("INSERT INTO records (body) VALUES ('late')", [])
            .unwrap();
        drop(conn);

        assert_eq!(count_rows(&src), 11);
        assert_eq!(count_rows(&dest), 10);
    }

    #[test]
    fn test_backup_replaces_stale_destination() {
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("doc.grist");
        let dest = temp.path().join("doc.grist-backup-t");
        create_test_db(&src, 5);
        std::fs::write(&dest, b"stale bytes, not a database").unwrap();

        backup_sqlite_database(&src, &dest, None).unwrap();

        assert_eq!(count_rows(&dest), 5);
    }

    #[test]
    fn test_backup_missing_source_cleans_up() {
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("missing.grist");
        let dest = temp.path().join("out.grist");

        let result = backup_sqlite_database(&src, &dest, None);

        assert!(matches!(result, Err(SqliteBackupError::Open { .. })));
        assert!(!dest.exists(), "partial destination should be removed");
    }

    #[test]
    fn test_progress_events_bracket_actions() {
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("doc.grist");
        let dest = temp.path().join("out.grist");
        create_test_db(&src, 3);

        let mut events = Vec::new();
        {
            let mut hook = |e: BackupProgress| events.push(e);
            backup_sqlite_database(&src, &dest, Some(&mut hook)).unwrap();
        }

        assert_eq!(
            events.first(),
            Some(&BackupProgress {
                action: BackupAction::Open,
                phase: BackupPhase::Before
            })
        );
        assert_eq!(
            events.last(),
            Some(&BackupProgress {
                action: BackupAction::Close,
                phase: BackupPhase::After
            })
        );
        // At least one full step ran
        assert!(events.contains(&BackupProgress {
            action: BackupAction::Step,
            phase: BackupPhase::After
        }));
        // Every Before pairs with an After in order
        let befores = events.iter().filter(|e| e.phase == BackupPhase::Before).count();
        let afters = events.iter().filter(|e| e.phase == BackupPhase::After).count();
        assert_eq!(befores, afters);
    }
}
