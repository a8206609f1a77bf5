//! Metadata push queue
//!
//! Documents surface a user-visible "last edited" time that lives in the
//! workspace database, not in the document file. The queue coalesces edit
//! notifications per document and pushes them in batches on an interval, so
//! a burst of edits costs one write.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::Notify;

use crate::observability::{Event, Logger};

/// Metadata push failure
#[derive(Debug, Clone, Error)]
#[error("metadata push failed: {0}")]
pub struct MetaPushError(pub String);

/// One "document edited" record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocUpdate {
    pub doc_id: String,
    pub updated_at: DateTime<Utc>,
    pub edited_by: Option<i64>,
}

/// Destination for edit-time updates (the workspace database).
#[async_trait]
pub trait DocUpdateSink: Send + Sync {
    async fn push_updates(&self, updates: Vec<DocUpdate>) -> Result<(), MetaPushError>;
}

/// Sink that discards updates, for deployments without a workspace database.
#[derive(Debug, Default)]
pub struct NoopUpdateSink;

#[async_trait]
impl DocUpdateSink for NoopUpdateSink {
    async fn push_updates(&self, _updates: Vec<DocUpdate>) -> Result<(), MetaPushError> {
        Ok(())
    }
}

struct State {
    pending: HashMap<String, DocUpdate>,
    flusher: bool,
    closed: bool,
}

struct Inner {
    sink: Arc<dyn DocUpdateSink>,
    interval: Duration,
    state: Mutex<State>,
    wake: Notify,
    idle: Notify,
}

/// Debounced, batched emitter of "doc edited at T" events.
pub struct DocUpdateQueue {
    inner: Arc<Inner>,
}

impl DocUpdateQueue {
    pub fn new(sink: Arc<dyn DocUpdateSink>, interval: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                sink,
                interval,
                state: Mutex::new(State {
                    pending: HashMap::new(),
                    flusher: false,
                    closed: false,
                }),
                wake: Notify::new(),
                idle: Notify::new(),
            }),
        }
    }

    /// Record that `doc_id` was edited now. Multiple calls before the next
    /// flush coalesce, keeping the latest time and editor.
    pub fn schedule_update(&self, doc_id: &str, edited_by: Option<i64>) {
        let mut state = self.inner.state.lock().unwrap();
        if state.closed {
            return;
        }
        state.pending.insert(
            doc_id.to_string(),
            DocUpdate {
                doc_id: doc_id.to_string(),
                updated_at: Utc::now(),
                edited_by,
            },
        );
        if !state.flusher {
            state.flusher = true;
            self.spawn_flusher();
        }
    }

    /// Resolves once every scheduled update has been pushed.
    pub async fn wait(&self) {
        loop {
            let idle = self.inner.idle.notified();
            tokio::pin!(idle);
            idle.as_mut().enable();
            {
                let state = self.inner.state.lock().unwrap();
                if state.pending.is_empty() && !state.flusher {
                    return;
                }
            }
            idle.await;
        }
    }

    /// Flush what is pending and stop accepting updates.
    pub async fn close(&self) {
        self.inner.state.lock().unwrap().closed = true;
        // notify_one stores a permit, so a flusher not yet parked in its
        // select still observes the wake
        self.inner.wake.notify_one();
        self.wait().await;
    }

    fn spawn_flusher(&self) {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            loop {
                let closing = {
                    let notified = inner.wake.notified();
                    tokio::select! {
                        _ = tokio::time::sleep(inner.interval) => false,
                        _ = notified => true,
                    }
                };

                let batch: Vec<DocUpdate> = {
                    let mut state = inner.state.lock().unwrap();
                    state.pending.drain().map(|(_, update)| update).collect()
                };

                if !batch.is_empty() {
                    if let Err(e) = inner.sink.push_updates(batch.clone()).await {
                        Logger::error(
                            Event::UpdatePushFailed,
                            &[("count", &batch.len().to_string()), ("error", &e.0)],
                        );
                        let mut state = inner.state.lock().unwrap();
                        if state.closed {
                            // Shutting down; drop rather than spin
                        } else {
                            // Requeue what was not superseded in the meantime
                            for update in batch {
                                state
                                    .pending
                                    .entry(update.doc_id.clone())
                                    .or_insert(update);
                            }
                        }
                    }
                }

                let mut state = inner.state.lock().unwrap();
                if state.pending.is_empty() || (closing && state.closed) {
                    state.flusher = false;
                    inner.idle.notify_waiters();
                    return;
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Default)]
    struct RecordingSink {
        batches: Mutex<Vec<Vec<DocUpdate>>>,
        failures_left: AtomicU32,
    }

    #[async_trait]
    impl DocUpdateSink for RecordingSink {
        async fn push_updates(&self, updates: Vec<DocUpdate>) -> Result<(), MetaPushError> {
            if self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(MetaPushError("workspace db unavailable".into()));
            }
            self.batches.lock().unwrap().push(updates);
            Ok(())
        }
    }

    fn all_updates(sink: &RecordingSink) -> Vec<DocUpdate> {
        sink.batches.lock().unwrap().iter().flatten().cloned().collect()
    }

    #[tokio::test]
    async fn test_updates_coalesce_per_doc() {
        let sink = Arc::new(RecordingSink::default());
        let queue = DocUpdateQueue::new(
            Arc::clone(&sink) as Arc<dyn DocUpdateSink>,
            Duration::from_millis(30),
        );

        queue.schedule_update("abc", Some(1));
        queue.schedule_update("abc", Some(2));
        queue.schedule_update("xyz", None);
        queue.wait().await;

        let updates = all_updates(&sink);
        assert_eq!(updates.len(), 2);
        let abc = updates.iter().find(|u| u.doc_id == "abc").unwrap();
        // Latest editor wins
        assert_eq!(abc.edited_by, Some(2));
    }

    #[tokio::test]
    async fn test_close_drains_pending() {
        let sink = Arc::new(RecordingSink::default());
        let queue = DocUpdateQueue::new(
            Arc::clone(&sink) as Arc<dyn DocUpdateSink>,
            Duration::from_secs(3600),
        );

        queue.schedule_update("abc", None);
        queue.close().await;

        assert_eq!(all_updates(&sink).len(), 1);

        // Nothing accepted after close
        queue.schedule_update("late", None);
        queue.wait().await;
        assert_eq!(all_updates(&sink).len(), 1);
    }

    #[tokio::test]
    async fn test_failed_push_is_retried() {
        let sink = Arc::new(RecordingSink::default());
        sink.failures_left.store(1, Ordering::SeqCst);
        let queue = DocUpdateQueue::new(
            Arc::clone(&sink) as Arc<dyn DocUpdateSink>,
            Duration::from_millis(10),
        );

        queue.schedule_update("abc", Some(7));
        queue.wait().await;

        let updates = all_updates(&sink);
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].doc_id, "abc");
        assert_eq!(updates[0].edited_by, Some(7));
    }
}
