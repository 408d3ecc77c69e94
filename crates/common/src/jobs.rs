//! Job Pool
//!
//! A FIFO queue of named jobs drained by lazily-spawned workers. Workers are
//! started as work arrives, up to a ceiling, and exit on their own once the
//! queue is empty. At most one job with a given non-empty name is queued or
//! running at a time; submitting a duplicate is a silent no-op.

use std::collections::{HashSet, VecDeque};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::Notify;
use tracing::{debug, error, trace};

use crate::supervisor::panic_message;

/// Default ceiling on concurrently running workers
pub const DEFAULT_MAX_WORKERS: usize = 1000;

/// Outcome of a failed job, logged by the worker that ran it
#[derive(Debug, Error)]
pub enum JobError {
    #[error("{0}")]
    Failed(String),

    #[error("job panicked: {0}")]
    Panicked(String),
}

impl JobError {
    /// Wrap any displayable error as a job failure
    pub fn failed(err: impl std::fmt::Display) -> Self {
        JobError::Failed(err.to_string())
    }
}

type Job = BoxFuture<'static, Result<(), JobError>>;

struct PoolState {
    queue: VecDeque<(String, Job)>,
    /// Names of jobs queued or running
    names: HashSet<String>,
    workers: usize,
}

struct Inner {
    state: Mutex<PoolState>,
    max_workers: usize,
    idle: Notify,
}

/// Bounded pool of background workers with job deduplication.
///
/// Cloning is cheap and shares the queue.
#[derive(Clone)]
pub struct JobPool {
    inner: Arc<Inner>,
}

impl JobPool {
    /// Create a pool with at most `max_workers` concurrent workers
    /// (0 is treated as 1).
    pub fn new(max_workers: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(PoolState {
                    queue: VecDeque::new(),
                    names: HashSet::new(),
                    workers: 0,
                }),
                max_workers: max_workers.max(1),
                idle: Notify::new(),
            }),
        }
    }

    /// Queue a job. Returns false if a job with the same non-empty name is
    /// already queued or running.
    ///
    /// Never blocks; must be called inside a Tokio runtime.
    pub fn submit<F>(&self, name: impl Into<String>, job: F) -> bool
    where
        F: Future<Output = Result<(), JobError>> + Send + 'static,
    {
        let name = name.into();
        let mut state = self.inner.state.lock();

        if !name.is_empty() {
            if state.names.contains(&name) {
                debug!(job = %name, "Job already queued or running; skipping");
                return false;
            }
            state.names.insert(name.clone());
        }

        state.queue.push_back((name.clone(), job.boxed()));
        trace!(job = %name, queued = state.queue.len(), "Job queued");

        if state.workers < self.inner.max_workers {
            state.workers += 1;
            drop(state);
            tokio::spawn(run_worker(Arc::clone(&self.inner)));
        }
        true
    }

    /// True if a job with this name is queued or running
    pub fn contains(&self, name: &str) -> bool {
        self.inner.state.lock().names.contains(name)
    }

    /// Number of jobs waiting for a worker
    pub fn queued(&self) -> usize {
        self.inner.state.lock().queue.len()
    }

    /// Number of live workers
    pub fn active_workers(&self) -> usize {
        self.inner.state.lock().workers
    }

    /// Resolves once the queue is drained and every worker has exited.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            {
                let state = self.inner.state.lock();
                if state.workers == 0 && state.queue.is_empty() {
                    return;
                }
            }
            notified.await;
        }
    }
}

impl Default for JobPool {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_WORKERS)
    }
}

impl std::fmt::Debug for JobPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("JobPool")
            .field("queued", &state.queue.len())
            .field("workers", &state.workers)
            .field("max_workers", &self.inner.max_workers)
            .finish()
    }
}

async fn run_worker(inner: Arc<Inner>) {
    loop {
        let (name, job) = {
            let mut state = inner.state.lock();
            match state.queue.pop_front() {
                Some(next) => next,
                None => {
                    state.workers -= 1;
                    let idle = state.workers == 0;
                    drop(state);
                    trace!("Job queue drained; worker exiting");
                    if idle {
                        inner.idle.notify_waiters();
                    }
                    return;
                }
            }
        };

        let outcome = match AssertUnwindSafe(job).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => Err(JobError::Panicked(panic_message(panic.as_ref()))),
        };
        match outcome {
            Ok(()) => debug!(job = %name, "Job completed"),
            Err(e) => error!(job = %name, error = %e, "Job failed"),
        }

        if !name.is_empty() {
            inner.state.lock().names.remove(&name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::Semaphore;

    #[tokio::test]
    async fn test_duplicate_names_execute_once() {
        let pool = JobPool::default();
        let runs = Arc::new(AtomicUsize::new(0));
        let gate = Arc::new(Semaphore::new(0));

        for _ in 0..2 {
            let runs = Arc::clone(&runs);
            let gate = Arc::clone(&gate);
            pool.submit("renew_example.com", async move {
                let _permit = gate.acquire().await.map_err(JobError::failed)?;
                runs.fetch_add(1, Ordering::SeqCst);
                Ok::<(), JobError>(())
            });
        }
        assert!(pool.contains("renew_example.com"));

        gate.add_permits(2);
        pool.wait_idle().await;

        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(!pool.contains("renew_example.com"));
    }

    #[tokio::test]
    async fn test_name_reusable_after_completion() {
        let pool = JobPool::default();
        let runs = Arc::new(AtomicUsize::new(0));

        for _ in 0..2 {
            let runs = Arc::clone(&runs);
            assert!(pool.submit("renew_example.com", async move {
                runs.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }));
            pool.wait_idle().await;
        }

        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_empty_names_are_not_deduplicated() {
        let pool = JobPool::default();
        let runs = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let runs = Arc::clone(&runs);
            assert!(pool.submit("", async move {
                runs.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }));
        }
        pool.wait_idle().await;

        assert_eq!(runs.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_failures_and_panics_do_not_stop_pool() {
        let pool = JobPool::new(1);
        let runs = Arc::new(AtomicUsize::new(0));

        pool.submit("fails", async { Err(JobError::failed("issuer unavailable")) });
        pool.submit("panics", async {
            if true {
                panic!("boom");
            }
            Ok(())
        });
        {
            let runs = Arc::clone(&runs);
            pool.submit("succeeds", async move {
                runs.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
        }
        pool.wait_idle().await;

        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(!pool.contains("panics"));
    }

    #[tokio::test]
    async fn test_worker_ceiling() {
        let pool = JobPool::new(2);
        let gate = Arc::new(Semaphore::new(0));
        let runs = Arc::new(AtomicUsize::new(0));

        for i in 0..5 {
            let gate = Arc::clone(&gate);
            let runs = Arc::clone(&runs);
            pool.submit(format!("job-{i}"), async move {
                let _permit = gate.acquire().await.map_err(JobError::failed)?;
                runs.fetch_add(1, Ordering::SeqCst);
                Ok::<(), JobError>(())
            });
        }
        assert_eq!(pool.active_workers(), 2);

        gate.add_permits(5);
        tokio::time::timeout(Duration::from_secs(5), pool.wait_idle())
            .await
            .unwrap();

        assert_eq!(runs.load(Ordering::SeqCst), 5);
        assert_eq!(pool.active_workers(), 0);
        assert_eq!(pool.queued(), 0);
    }
}
