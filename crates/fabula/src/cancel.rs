//! Shutdown signaling, bounded fan-out and the retry contract.
//!
//! The core is single-threaded at the graph level; fan-out only happens
//! inside a node when a provider or plugin dispatches sub-tasks. Those
//! fan-outs go through [`WorkerPool`], which polls cancellation between
//! sub-tasks and reports an interrupted partial result instead of failing.
//!
//! Cancellation is two-layered: a process-wide shutdown flag (what a
//! Ctrl-C handler or task-queue revoke sets) paired with a per-invocation
//! [`CancelToken`], so concurrently running tests and embedded engines do
//! not interfere with each other.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use fabula_retry::{Backoff, Retry};
use tracing::warn;

use crate::error::{EngineError, Result};

static SHUTDOWN: AtomicBool = AtomicBool::new(false);

/// Set the process-wide shutdown flag. Idempotent.
pub fn request_shutdown() {
    SHUTDOWN.store(true, Ordering::SeqCst);
}

/// Whether a process-wide shutdown has been requested.
pub fn is_shutdown_requested() -> bool {
    SHUTDOWN.load(Ordering::SeqCst)
}

/// Clear the process-wide flag. Intended for embedders that reuse the
/// process after a stop.
pub fn reset_shutdown() {
    SHUTDOWN.store(false, Ordering::SeqCst);
}

/// Per-invocation cancellation carrier.
///
/// `linked()` tokens observe the process-wide flag in addition to their own;
/// `isolated()` tokens observe only their own, which keeps parallel tests
/// from cancelling each other.
#[derive(Debug, Clone)]
pub struct CancelToken {
    local: Arc<AtomicBool>,
    linked_to_global: bool,
}

impl CancelToken {
    /// Token that also observes the process-wide shutdown flag.
    pub fn linked() -> Self {
        Self {
            local: Arc::new(AtomicBool::new(false)),
            linked_to_global: true,
        }
    }

    /// Token that observes only explicit cancellation on itself.
    pub fn isolated() -> Self {
        Self {
            local: Arc::new(AtomicBool::new(false)),
            linked_to_global: false,
        }
    }

    pub fn cancel(&self) {
        self.local.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.local.load(Ordering::SeqCst) || (self.linked_to_global && is_shutdown_requested())
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::linked()
    }
}

/// Result of a pooled fan-out. When interrupted, `results` holds whatever
/// completed before the signal; the caller decides how to mark the partial.
#[derive(Debug)]
pub struct PoolOutcome<T> {
    pub results: Vec<T>,
    pub interrupted: bool,
}

/// Bounded worker pool for sub-task fan-out within a node.
#[derive(Debug, Clone, Copy)]
pub struct WorkerPool {
    workers: usize,
}

/// Default fan-out width.
pub const DEFAULT_PARALLEL_WORKERS: usize = 4;

impl WorkerPool {
    pub fn new(workers: usize) -> Self {
        Self {
            workers: workers.max(1),
        }
    }

    /// Run `task` over every item with at most `workers` threads.
    ///
    /// Cancellation is polled before each sub-task: once observed, pending
    /// items are abandoned and the partial result is returned with
    /// `interrupted = true`. Already-running sub-tasks complete.
    pub fn map<I, T, F>(&self, items: Vec<I>, cancel: &CancelToken, task: F) -> PoolOutcome<T>
    where
        I: Send,
        T: Send,
        F: Fn(I) -> T + Send + Sync,
    {
        let total = items.len();
        let slots: Vec<std::sync::Mutex<Option<T>>> =
            (0..total).map(|_| std::sync::Mutex::new(None)).collect();
        let work: Vec<std::sync::Mutex<Option<I>>> =
            items.into_iter().map(|i| std::sync::Mutex::new(Some(i))).collect();
        let next = AtomicUsize::new(0);
        let interrupted = AtomicBool::new(false);

        std::thread::scope(|scope| {
            for _ in 0..self.workers.min(total.max(1)) {
                scope.spawn(|| {
                    loop {
                        if cancel.is_cancelled() {
                            interrupted.store(true, Ordering::SeqCst);
                            break;
                        }
                        let idx = next.fetch_add(1, Ordering::SeqCst);
                        if idx >= total {
                            break;
                        }
                        let item = work[idx]
                            .lock()
                            .ok()
                            .and_then(|mut slot| slot.take());
                        if let Some(item) = item {
                            let result = task(item);
                            if let Ok(mut slot) = slots[idx].lock() {
                                *slot = Some(result);
                            }
                        }
                    }
                });
            }
        });

        let results = slots
            .into_iter()
            .filter_map(|slot| slot.into_inner().ok().flatten())
            .collect();
        PoolOutcome {
            results,
            interrupted: interrupted.load(Ordering::SeqCst),
        }
    }
}

impl Default for WorkerPool {
    fn default() -> Self {
        Self::new(DEFAULT_PARALLEL_WORKERS)
    }
}

/// Run an outbound call under the retry contract.
///
/// [`EngineError::Transient`] failures back off exponentially up to the
/// schedule's attempts; every other failure surfaces on the first attempt.
/// Exhausting the schedule logs a degradation event and yields `Ok(None)`
/// so the caller substitutes a default instead of aborting the graph; the
/// audit blocker gate catches the degraded output downstream.
pub fn call_with_retry<T, F>(operation: &str, backoff: &Backoff, mut call: F) -> Result<Option<T>>
where
    F: FnMut(u32) -> Result<T>,
{
    let outcome = backoff.run(|attempt| {
        call(attempt).map_err(|e| match e {
            EngineError::Transient { .. } => Retry::Transient(e),
            other => Retry::Permanent(other),
        })
    });
    match outcome {
        Ok(value) => Ok(Some(value)),
        Err(Retry::Transient(e)) => {
            warn!(operation, error = %e, "degraded after exhausting retries");
            Ok(None)
        }
        Err(Retry::Permanent(e)) => Err(e),
    }
}
