//! Retry Coordinator
//!
//! Runs a unit of work until it succeeds, returns a terminal error, is
//! cancelled, or the policy's total time budget is spent. Waits between
//! attempts follow a fixed schedule weighted toward quick early retries and
//! long later ones; the last interval repeats once the schedule runs out.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, error, warn};

use crate::op::{ContextError, OperationContext};

const MINUTE: u64 = 60;
const HOUR: u64 = 60 * MINUTE;

/// Default wait schedule between attempts
pub const DEFAULT_RETRY_INTERVALS: [Duration; 12] = [
    Duration::from_secs(MINUTE),
    Duration::from_secs(2 * MINUTE),
    Duration::from_secs(2 * MINUTE),
    Duration::from_secs(5 * MINUTE),
    Duration::from_secs(10 * MINUTE),
    Duration::from_secs(20 * MINUTE),
    Duration::from_secs(20 * MINUTE),
    Duration::from_secs(30 * MINUTE),
    Duration::from_secs(30 * MINUTE),
    Duration::from_secs(HOUR),
    Duration::from_secs(3 * HOUR),
    Duration::from_secs(6 * HOUR),
];

/// Default total time budget (30 days)
pub const DEFAULT_MAX_RETRY_DURATION: Duration = Duration::from_secs(30 * 24 * HOUR);

/// Lets the coordinator distinguish terminal failures from transient ones.
pub trait RetryDecision {
    /// True if retrying cannot help (e.g. a definitive rejection)
    fn is_terminal(&self) -> bool;
}

/// Why the coordinator stopped without a result
#[derive(Debug, Error)]
pub enum RetryError<E> {
    /// The unit of work signalled that it must not be retried
    #[error("{0}")]
    Terminal(E),

    /// The time budget ran out
    #[error("giving up after {attempts} attempts over {elapsed:?}: {last}")]
    Exhausted {
        attempts: u32,
        elapsed: Duration,
        last: E,
    },

    /// The operation handle was cancelled or hit its deadline
    #[error("{reason} after {attempts} attempts")]
    Cancelled {
        reason: ContextError,
        attempts: u32,
        last: Option<E>,
    },
}

impl<E> RetryError<E> {
    /// The last error returned by the unit of work, if any
    pub fn into_last(self) -> Option<E> {
        match self {
            RetryError::Terminal(e) => Some(e),
            RetryError::Exhausted { last, .. } => Some(last),
            RetryError::Cancelled { last, .. } => last,
        }
    }

    /// Number of attempts made (terminal errors always stop after the
    /// attempt that produced them, so that count is unknown here)
    pub fn attempts(&self) -> Option<u32> {
        match self {
            RetryError::Terminal(_) => None,
            RetryError::Exhausted { attempts, .. } | RetryError::Cancelled { attempts, .. } => {
                Some(*attempts)
            }
        }
    }
}

/// Backoff schedule and total time budget
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    intervals: Vec<Duration>,
    max_duration: Duration,
}

impl RetryPolicy {
    /// Create a policy with a custom schedule.
    pub fn new(intervals: Vec<Duration>, max_duration: Duration) -> Self {
        Self {
            intervals,
            max_duration,
        }
    }

    /// Replace the total time budget
    pub fn with_max_duration(mut self, max_duration: Duration) -> Self {
        self.max_duration = max_duration;
        self
    }

    /// Total time budget
    pub fn max_duration(&self) -> Duration {
        self.max_duration
    }

    /// Wait before retry number `index` (0-based); the last interval repeats
    pub fn interval(&self, index: usize) -> Duration {
        match self.intervals.get(index) {
            Some(interval) => *interval,
            None => self.intervals.last().copied().unwrap_or(Duration::ZERO),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            intervals: DEFAULT_RETRY_INTERVALS.to_vec(),
            max_duration: DEFAULT_MAX_RETRY_DURATION,
        }
    }
}

/// Run `op` until it succeeds or the coordinator gives up.
///
/// `op` receives a clone of `ctx`; `ctx.attempts()` tells it how many
/// attempts came before, so a collaborator can vary its behavior (for
/// example try a staging endpoint first).
pub async fn do_with_retry<T, E, F, Fut>(
    policy: &RetryPolicy,
    ctx: &OperationContext,
    mut op: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut(OperationContext) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: RetryDecision + Display,
{
    let start = Instant::now();
    let mut attempts: u32 = 0;
    let mut last: Option<E> = None;

    loop {
        if let Some(reason) = ctx.err() {
            return Err(RetryError::Cancelled {
                reason,
                attempts,
                last,
            });
        }

        ctx.set_attempts(attempts);
        let err = match op(ctx.clone()).await {
            Ok(value) => {
                if attempts > 0 {
                    debug!(attempts = attempts + 1, "Operation succeeded after retrying");
                }
                return Ok(value);
            }
            Err(e) => e,
        };
        attempts += 1;

        if err.is_terminal() {
            warn!(attempts = attempts, error = %err, "Operation failed with terminal error; not retrying");
            return Err(RetryError::Terminal(err));
        }

        let elapsed = start.elapsed();
        if elapsed >= policy.max_duration {
            error!(
                attempts = attempts,
                elapsed_secs = elapsed.as_secs(),
                error = %err,
                "Final attempt failed; retry budget exhausted"
            );
            return Err(RetryError::Exhausted {
                attempts,
                elapsed,
                last: err,
            });
        }

        let wait = policy.interval(attempts as usize - 1);
        error!(
            attempt = attempts,
            retrying_in_secs = wait.as_secs(),
            elapsed_secs = elapsed.as_secs(),
            max_duration_secs = policy.max_duration.as_secs(),
            error = %err,
            "Operation failed; will retry"
        );

        tokio::select! {
            _ = tokio::time::sleep(wait) => {}
            reason = ctx.done() => {
                return Err(RetryError::Cancelled {
                    reason,
                    attempts,
                    last: Some(err),
                });
            }
        }
        last = Some(err);
    }
}
