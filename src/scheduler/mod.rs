//! Keyed operation scheduler
//!
//! `KeyedOps` runs one async worker function per key with debouncing,
//! coalescing, single-flight and retry:
//!
//! - `add_operation(key)` marks the key dirty; the worker runs no sooner than
//!   the configured delay after the latest `add_operation` for that key.
//! - At most one invocation of the worker per key is in flight. An
//!   `add_operation` during a run schedules exactly one follow-up run after
//!   the current one completes.
//! - On failure the run is retried after exponential backoff; failures on one
//!   key never block other keys.
//! - `expedite_operation` collapses remaining delay to zero;
//!   `expedite_operation_and_wait` additionally resolves with the result of
//!   the next finished run for the key.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{oneshot, Notify};
use tokio::time::Instant;

/// Retry backoff never grows past this.
const MAX_RETRY_DELAY: Duration = Duration::from_secs(60);

/// Scheduler tuning knobs.
#[derive(Debug, Clone)]
pub struct KeyedOpsOptions {
    /// Debounce window after the latest `add_operation` for a key.
    pub delay_before_operation: Duration,
    /// First retry delay after a failure; doubles per consecutive failure.
    pub initial_retry_delay: Duration,
    /// When false, a failed run is not retried (the key still reruns if it
    /// was marked dirty during the run).
    pub retry: bool,
}

impl Default for KeyedOpsOptions {
    fn default() -> Self {
        Self {
            delay_before_operation: Duration::from_secs(15),
            initial_retry_delay: Duration::from_secs(3),
            retry: true,
        }
    }
}

type Worker<E> =
    Arc<dyn Fn(String) -> Pin<Box<dyn Future<Output = Result<(), E>> + Send>> + Send + Sync>;
type ErrorLogger<E> = Arc<dyn Fn(&str, u32, &E) + Send + Sync>;

struct KeyEntry<E> {
    /// The worker is running right now.
    running: bool,
    /// Another run must follow the current one.
    rerun: bool,
    /// The pending (or follow-up) run should start immediately.
    expedited: bool,
    /// Deadline for the next run while not running.
    next_run_at: Instant,
    /// Wakes the key's driver task when the deadline moves.
    wake: Arc<Notify>,
    /// Resolved with the result of the next finished run.
    waiters: Vec<oneshot::Sender<Result<(), E>>>,
    /// Consecutive failures of the current dirty state.
    failure_count: u32,
}

struct Inner<E> {
    options: KeyedOpsOptions,
    worker: Worker<E>,
    log_error: Option<ErrorLogger<E>>,
    keys: Mutex<HashMap<String, KeyEntry<E>>>,
    idle: Notify,
}

/// Per-key debounced, coalescing, retrying single-flight operation queue.
pub struct KeyedOps<E> {
    inner: Arc<Inner<E>>,
}

impl<E> Clone for KeyedOps<E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<E> KeyedOps<E>
where
    E: Clone + Send + 'static,
{
    /// Create a scheduler around the given worker function.
    pub fn new<F, Fut>(options: KeyedOpsOptions, worker: F) -> Self
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
    {
        let worker: Worker<E> = Arc::new(move |key| Box::pin(worker(key)));
        Self {
            inner: Arc::new(Inner {
                options,
                worker,
                log_error: None,
                keys: Mutex::new(HashMap::new()),
                idle: Notify::new(),
            }),
        }
    }

    /// Create a scheduler with a failure callback, invoked with
    /// `(key, failure_count, error)` on every failed run.
    pub fn with_error_logger<F, Fut, L>(options: KeyedOpsOptions, worker: F, log_error: L) -> Self
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
        L: Fn(&str, u32, &E) + Send + Sync + 'static,
    {
        let worker: Worker<E> = Arc::new(move |key| Box::pin(worker(key)));
        Self {
            inner: Arc::new(Inner {
                options,
                worker,
                log_error: Some(Arc::new(log_error)),
                keys: Mutex::new(HashMap::new()),
                idle: Notify::new(),
            }),
        }
    }

    /// Mark `key` dirty. The worker runs after the debounce window, or after
    /// the current run for the key completes.
    pub fn add_operation(&self, key: &str) {
        let mut keys = self.inner.keys.lock().unwrap();
        let delay = self.inner.options.delay_before_operation;
        match keys.get_mut(key) {
            Some(entry) if entry.running => {
                entry.rerun = true;
            }
            Some(entry) => {
                // Debounce restarts the window from the latest call
                entry.next_run_at = Instant::now() + delay;
                entry.failure_count = 0;
                entry.wake.notify_one();
            }
            None => {
                let wake = Arc::new(Notify::new());
                keys.insert(
                    key.to_string(),
                    KeyEntry {
                        running: false,
                        rerun: false,
                        expedited: false,
                        next_run_at: Instant::now() + delay,
                        wake: Arc::clone(&wake),
                        waiters: Vec::new(),
                        failure_count: 0,
                    },
                );
                drop(keys);
                self.spawn_driver(key.to_string(), wake);
            }
        }
    }

    /// Collapse the remaining delay for `key` to zero.
    pub fn expedite_operation(&self, key: &str) {
        let mut keys = self.inner.keys.lock().unwrap();
        if let Some(entry) = keys.get_mut(key) {
            entry.expedited = true;
            if !entry.running {
                entry.next_run_at = Instant::now();
                entry.wake.notify_one();
            }
        }
    }

    /// Collapse the remaining delay for every pending key.
    pub fn expedite_all(&self) {
        let mut keys = self.inner.keys.lock().unwrap();
        let now = Instant::now();
        for entry in keys.values_mut() {
            entry.expedited = true;
            if !entry.running {
                entry.next_run_at = now;
                entry.wake.notify_one();
            }
        }
    }

    /// Expedite `key` and wait for the next run for it to finish, returning
    /// that run's result. Resolves immediately when nothing is pending.
    pub async fn expedite_operation_and_wait(&self, key: &str) -> Result<(), E> {
        let receiver = {
            let mut keys = self.inner.keys.lock().unwrap();
            match keys.get_mut(key) {
                None => return Ok(()),
                Some(entry) => {
                    let (tx, rx) = oneshot::channel();
                    entry.waiters.push(tx);
                    entry.expedited = true;
                    if !entry.running {
                        entry.next_run_at = Instant::now();
                        entry.wake.notify_one();
                    }
                    rx
                }
            }
        };
        receiver.await.unwrap_or(Ok(()))
    }

    /// Whether a run for `key` is scheduled, running, or retrying.
    pub fn has_pending_operation(&self, key: &str) -> bool {
        self.inner.keys.lock().unwrap().contains_key(key)
    }

    /// Whether any key has work outstanding.
    pub fn has_pending_operations(&self) -> bool {
        !self.inner.keys.lock().unwrap().is_empty()
    }

    /// Resolves when no operations are scheduled or running. `notify` fires
    /// once if the wait is nontrivial.
    pub async fn wait(&self, notify: Option<&(dyn Fn() + Send + Sync)>) {
        if !self.has_pending_operations() {
            return;
        }
        if let Some(cb) = notify {
            cb();
        }
        loop {
            let idle = self.inner.idle.notified();
            tokio::pin!(idle);
            idle.as_mut().enable();
            if !self.has_pending_operations() {
                return;
            }
            idle.await;
        }
    }

    fn spawn_driver(&self, key: String, wake: Arc<Notify>) {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            loop {
                // Debounce: sleep until the deadline stops moving
                loop {
                    let deadline = {
                        let keys = inner.keys.lock().unwrap();
                        match keys.get(&key) {
                            Some(entry) => entry.next_run_at,
                            None => return,
                        }
                    };
                    if Instant::now() >= deadline {
                        break;
                    }
                    let notified = wake.notified();
                    tokio::select! {
                        _ = tokio::time::sleep_until(deadline) => {}
                        _ = notified => {}
                    }
                }

                // Claim the run, unless the deadline moved while we slept
                {
                    let mut keys = inner.keys.lock().unwrap();
                    let Some(entry) = keys.get_mut(&key) else { return };
                    if Instant::now() < entry.next_run_at {
                        continue;
                    }
                    entry.running = true;
                    entry.rerun = false;
                    entry.expedited = false;
                }

                let result = (inner.worker)(key.clone()).await;

                // Settle: notify waiters, then decide rerun/retry/removal
                let mut keys = inner.keys.lock().unwrap();
                let Some(entry) = keys.get_mut(&key) else { return };
                entry.running = false;
                for waiter in entry.waiters.drain(..) {
                    let _ = waiter.send(result.clone());
                }
                match &result {
                    Ok(()) => {
                        entry.failure_count = 0;
                        if entry.rerun {
                            entry.next_run_at = next_deadline(entry, &inner.options, None);
                            continue;
                        }
                        keys.remove(&key);
                        if keys.is_empty() {
                            inner.idle.notify_waiters();
                        }
                        return;
                    }
                    Err(err) => {
                        entry.failure_count += 1;
                        if let Some(log_error) = &inner.log_error {
                            log_error(&key, entry.failure_count, err);
                        }
                        if inner.options.retry {
                            // Dirty state survives the failure; back off and
                            // try again
                            let backoff = retry_delay(
                                inner.options.initial_retry_delay,
                                entry.failure_count,
                            );
                            entry.next_run_at = next_deadline(entry, &inner.options, Some(backoff));
                            continue;
                        }
                        if entry.rerun {
                            entry.next_run_at = next_deadline(entry, &inner.options, None);
                            continue;
                        }
                        keys.remove(&key);
                        if keys.is_empty() {
                            inner.idle.notify_waiters();
                        }
                        return;
                    }
                }
            }
        });
    }
}

fn next_deadline<E>(
    entry: &mut KeyEntry<E>,
    options: &KeyedOpsOptions,
    backoff: Option<Duration>,
) -> Instant {
    let delay = if entry.expedited {
        Duration::ZERO
    } else {
        backoff.unwrap_or(options.delay_before_operation)
    };
    entry.expedited = false;
    Instant::now() + delay
}

fn retry_delay(initial: Duration, failure_count: u32) -> Duration {
    let doublings = failure_count.saturating_sub(1).min(16);
    let delay = initial.saturating_mul(1u32 << doublings);
    delay.min(MAX_RETRY_DELAY)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_options() -> KeyedOpsOptions {
        KeyedOpsOptions {
            delay_before_operation: Duration::from_millis(50),
            initial_retry_delay: Duration::from_millis(10),
            retry: true,
        }
    }

    #[tokio::test]
    async fn test_debounce_coalesces_adds() {
        let runs = Arc::new(AtomicU32::new(0));
        let runs2 = Arc::clone(&runs);
        let ops: KeyedOps<String> = KeyedOps::new(fast_options(), move |_key| {
            let runs = Arc::clone(&runs2);
            async move {
                runs.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });

        for _ in 0..20 {
            ops.add_operation("doc1");
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        ops.wait(None).await;

        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(!ops.has_pending_operation("doc1"));
    }

    #[tokio::test]
    async fn test_add_during_run_schedules_one_follow_up() {
        let runs = Arc::new(AtomicU32::new(0));
        let runs2 = Arc::clone(&runs);
        let ops: KeyedOps<String> = KeyedOps::new(
            KeyedOpsOptions {
                delay_before_operation: Duration::from_millis(5),
                ..fast_options()
            },
            move |_key| {
                let runs = Arc::clone(&runs2);
                async move {
                    runs.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    Ok(())
                }
            },
        );

        ops.add_operation("doc1");
        ops.expedite_operation("doc1");
        // Give the first run time to start, then pile on changes
        tokio::time::sleep(Duration::from_millis(20)).await;
        ops.add_operation("doc1");
        ops.add_operation("doc1");
        ops.add_operation("doc1");
        ops.wait(None).await;

        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_expedite_and_wait_returns_result() {
        let ops: KeyedOps<String> =
            KeyedOps::new(fast_options(), move |_key| async move { Ok(()) });

        ops.add_operation("doc1");
        ops.expedite_operation_and_wait("doc1").await.unwrap();
        assert!(!ops.has_pending_operation("doc1"));

        // Nothing pending resolves immediately
        ops.expedite_operation_and_wait("doc1").await.unwrap();
    }

    #[tokio::test]
    async fn test_expedite_and_wait_surfaces_failure() {
        let ops: KeyedOps<String> = KeyedOps::new(fast_options(), move |_key| async move {
            Err("push failed".to_string())
        });

        ops.add_operation("doc1");
        let result = ops.expedite_operation_and_wait("doc1").await;
        assert_eq!(result, Err("push failed".to_string()));

        // The key stays scheduled for retry
        assert!(ops.has_pending_operation("doc1"));
    }

    #[tokio::test]
    async fn test_retry_until_success() {
        let attempts = Arc::new(AtomicU32::new(0));
        let attempts2 = Arc::clone(&attempts);
        let failures = Arc::new(AtomicU32::new(0));
        let failures2 = Arc::clone(&failures);
        let ops: KeyedOps<String> = KeyedOps::with_error_logger(
            fast_options(),
            move |_key| {
                let attempts = Arc::clone(&attempts2);
                async move {
                    if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err("transient".to_string())
                    } else {
                        Ok(())
                    }
                }
            },
            move |_key, failure_count, _err| {
                failures2.store(failure_count, Ordering::SeqCst);
            },
        );

        ops.add_operation("doc1");
        ops.expedite_operation("doc1");
        ops.wait(None).await;

        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert_eq!(failures.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_no_retry_option_drops_key_after_failure() {
        let ops: KeyedOps<String> = KeyedOps::new(
            KeyedOpsOptions {
                retry: false,
                ..fast_options()
            },
            move |_key| async move { Err("fatal".to_string()) },
        );

        ops.add_operation("doc1");
        let result = ops.expedite_operation_and_wait("doc1").await;
        assert!(result.is_err());
        ops.wait(None).await;
        assert!(!ops.has_pending_operation("doc1"));
    }

    #[tokio::test]
    async fn test_failure_does_not_block_other_keys() {
        let ok_runs = Arc::new(AtomicU32::new(0));
        let ok_runs2 = Arc::clone(&ok_runs);
        let ops: KeyedOps<String> = KeyedOps::new(fast_options(), move |key| {
            let ok_runs = Arc::clone(&ok_runs2);
            async move {
                if key == "bad" {
                    Err("always fails".to_string())
                } else {
                    ok_runs.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }
        });

        ops.add_operation("bad");
        ops.add_operation("good");
        ops.expedite_operation("good");
        ops.expedite_operation_and_wait("good").await.unwrap();

        assert_eq!(ok_runs.load(Ordering::SeqCst), 1);
        assert!(ops.has_pending_operation("bad"));
    }

    #[tokio::test]
    async fn test_wait_notify_fires_when_nontrivial() {
        let notified = Arc::new(AtomicU32::new(0));
        let ops: KeyedOps<String> =
            KeyedOps::new(fast_options(), move |_key| async move { Ok(()) });

        // Trivial wait: no notification
        let n = Arc::clone(&notified);
        let cb = move || {
            n.fetch_add(1, Ordering::SeqCst);
        };
        ops.wait(Some(&cb)).await;
        assert_eq!(notified.load(Ordering::SeqCst), 0);

        ops.add_operation("doc1");
        ops.expedite_operation("doc1");
        ops.wait(Some(&cb)).await;
        assert_eq!(notified.load(Ordering::SeqCst), 1);
    }
}
