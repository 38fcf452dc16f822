//! Sequential Job Queue
//!
//! The only way into the slicing engine. One job runs at a time system-wide;
//! waiters are admitted in FIFO order (tokio's semaphore is fair). A caller
//! that waits longer than `wait_timeout`, or whose job runs longer than
//! `job_timeout`, gets `QuoteError::Timeout` and leaves no trace.

use serde::Serialize;
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::config::SlicerSettings;
use crate::error::QuoteError;

/// Extra time the queue allows beyond the engine's own deadline, so the
/// adapter's timeout normally fires first.
const JOB_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    pub waiting: usize,
    pub admitted: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub timed_out: u64,
}

#[derive(Debug)]
pub struct SequentialJobQueue {
    slot: Semaphore,
    wait_timeout: Duration,
    job_timeout: Duration,
    waiting: AtomicUsize,
    admitted: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    timed_out: AtomicU64,
}

impl SequentialJobQueue {
    pub fn new(wait_timeout: Duration, job_timeout: Duration) -> Self {
        Self {
            slot: Semaphore::new(1),
            wait_timeout,
            job_timeout,
            waiting: AtomicUsize::new(0),
            admitted: AtomicU64::new(0),
            succeeded: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            timed_out: AtomicU64::new(0),
        }
    }

    pub fn from_settings(settings: &SlicerSettings) -> Self {
        Self::new(
            Duration::from_secs(settings.queue_wait_seconds),
            Duration::from_secs(settings.timeout_seconds) + JOB_GRACE,
        )
    }

    /// Waits for the slot, then runs `job` under the job deadline.
    pub async fn run<T, F, Fut>(&self, job_id: &str, job: F) -> Result<T, QuoteError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, QuoteError>>,
    {
        let permit = {
            let _waiting = WaitingGuard::enter(&self.waiting);
            timeout(self.wait_timeout, self.slot.acquire()).await
        };
        let _permit = match permit {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => {
                return Err(QuoteError::Timeout("job queue is shutting down".to_string()));
            }
            Err(_) => {
                self.timed_out.fetch_add(1, Ordering::Relaxed);
                warn!(job_id, wait_s = self.wait_timeout.as_secs(), "gave up waiting for slicing slot");
                return Err(QuoteError::Timeout(format!(
                    "waited {}s for the slicing engine",
                    self.wait_timeout.as_secs()
                )));
            }
        };

        self.admitted.fetch_add(1, Ordering::Relaxed);
        debug!(job_id, "job admitted");

        // On timeout the job future is dropped, which kills any child process it owns.
        let result = match timeout(self.job_timeout, job()).await {
            Ok(result) => result,
            Err(_) => {
                warn!(job_id, timeout_s = self.job_timeout.as_secs(), "job exceeded deadline");
                Err(QuoteError::Timeout(format!(
                    "job exceeded {}s",
                    self.job_timeout.as_secs()
                )))
            }
        };

        match &result {
            Ok(_) => self.succeeded.fetch_add(1, Ordering::Relaxed),
            Err(QuoteError::Timeout(_)) => self.timed_out.fetch_add(1, Ordering::Relaxed),
            Err(_) => self.failed.fetch_add(1, Ordering::Relaxed),
        };
        debug!(job_id, ok = result.is_ok(), "job finished");
        result
    }

    /// Abandons every queued job; subsequent `run` calls fail immediately.
    pub fn close(&self) {
        self.slot.close();
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            waiting: self.waiting.load(Ordering::Relaxed),
            admitted: self.admitted.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            timed_out: self.timed_out.load(Ordering::Relaxed),
        }
    }
}

/// Keeps the waiting gauge right even when a waiter is cancelled.
struct WaitingGuard<'a>(&'a AtomicUsize);

impl<'a> WaitingGuard<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::Relaxed);
        Self(counter)
    }
}

impl Drop for WaitingGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}
