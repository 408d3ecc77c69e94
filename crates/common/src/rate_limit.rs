//! Sliding-window rate limiting for outbound issuance attempts.
//!
//! [`RingBufferRateLimiter`] remembers the instants of the last N admissions
//! in a ring. A new admission is granted only once the oldest remembered
//! admission is at least `window` in the past. Blocking waiters are served
//! in arrival order by a background scheduling task; [`allow`] never blocks.
//!
//! [`allow`]: RingBufferRateLimiter::allow

use std::future::pending;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::op::{ContextError, OperationContext};

/// Default number of admissions per window
pub const DEFAULT_MAX_EVENTS: usize = 10;

/// Default sliding window
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(10);

/// Rate limiter errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RateLimitError {
    /// The limiter was stopped while the caller was waiting
    #[error("rate limiter stopped")]
    Stopped,

    /// The caller's operation was cancelled or timed out first
    #[error("rate limiter wait aborted: {0}")]
    Context(#[from] ContextError),
}

// ============================================================================
// Ring state
// ============================================================================

/// What the scheduler should do next
#[derive(Debug, PartialEq, Eq)]
enum Admission {
    Granted,
    RetryAfter(Duration),
    Never,
}

#[derive(Debug)]
struct Ring {
    /// Admission instants; `None` slots have never been used
    slots: Vec<Option<Instant>>,
    /// Index of the oldest slot
    cursor: usize,
    window: Duration,
}

impl Ring {
    fn new(max_events: usize, window: Duration) -> Self {
        Self {
            slots: vec![None; max_events],
            cursor: 0,
            window,
        }
    }

    fn unthrottled(&self) -> bool {
        self.slots.is_empty() && self.window.is_zero()
    }

    /// Record an admission at `now` if the oldest slot permits it.
    fn try_admit(&mut self, now: Instant) -> Admission {
        if self.slots.is_empty() {
            return if self.window.is_zero() {
                Admission::Granted
            } else {
                Admission::Never
            };
        }

        if !self.window.is_zero() {
            if let Some(oldest) = self.slots[self.cursor] {
                let ready_at = oldest + self.window;
                if now < ready_at {
                    return Admission::RetryAfter(ready_at - now);
                }
            }
        }

        self.slots[self.cursor] = Some(now);
        self.cursor = (self.cursor + 1) % self.slots.len();
        Admission::Granted
    }

    /// Resize the ring, keeping the newest history.
    fn resize(&mut self, max_events: usize) {
        let len = self.slots.len();
        let mut ordered: Vec<Option<Instant>> =
            (0..len).map(|i| self.slots[(self.cursor + i) % len]).collect();

        if max_events < len {
            ordered.drain(..len - max_events);
        } else if max_events > len {
            let mut grown = vec![None; max_events - len];
            grown.append(&mut ordered);
            ordered = grown;
        }

        self.slots = ordered;
        self.cursor = 0;
    }
}

// ============================================================================
// Limiter
// ============================================================================

type Ticket = oneshot::Sender<()>;

struct Shared {
    ring: Mutex<Ring>,
    changed: Notify,
    stop: CancellationToken,
}

/// Sliding-window rate limiter with a background ticket scheduler.
///
/// Must be created inside a Tokio runtime. Dropping the limiter stops its
/// scheduling task; pending waiters then receive [`RateLimitError::Stopped`].
pub struct RingBufferRateLimiter {
    shared: Arc<Shared>,
    requests: mpsc::UnboundedSender<Ticket>,
}

impl RingBufferRateLimiter {
    /// Create a limiter admitting at most `max_events` per `window`.
    ///
    /// `max_events == 0` with a zero window disables limiting;
    /// `max_events == 0` with a non-zero window admits nothing.
    pub fn new(max_events: usize, window: Duration) -> Self {
        let shared = Arc::new(Shared {
            ring: Mutex::new(Ring::new(max_events, window)),
            changed: Notify::new(),
            stop: CancellationToken::new(),
        });
        let (requests, rx) = mpsc::unbounded_channel();

        tokio::spawn(schedule_tickets(Arc::clone(&shared), rx));

        trace!(
            max_events = max_events,
            window_ms = window.as_millis() as u64,
            "Created rate limiter"
        );

        Self { shared, requests }
    }

    /// Wait for an admission, in arrival order with other waiters.
    pub async fn wait(&self, ctx: &OperationContext) -> Result<(), RateLimitError> {
        if let Some(reason) = ctx.err() {
            return Err(reason.into());
        }
        if self.shared.ring.lock().unthrottled() {
            return Ok(());
        }

        let (ticket, granted) = oneshot::channel();
        self.requests
            .send(ticket)
            .map_err(|_| RateLimitError::Stopped)?;

        tokio::select! {
            result = granted => result.map_err(|_| RateLimitError::Stopped),
            reason = ctx.done() => Err(reason.into()),
        }
    }

    /// Take an admission only if one is available right now.
    pub fn allow(&self) -> bool {
        if self.shared.stop.is_cancelled() {
            return false;
        }
        self.shared.ring.lock().try_admit(Instant::now()) == Admission::Granted
    }

    /// Change the number of admissions per window.
    ///
    /// Shrinking forgets the oldest admissions; growing keeps all history
    /// and adds immediately-available capacity.
    pub fn set_max_events(&self, max_events: usize) {
        self.shared.ring.lock().resize(max_events);
        self.shared.changed.notify_one();
        debug!(max_events = max_events, "Rate limiter capacity changed");
    }

    /// Change the sliding window
    pub fn set_window(&self, window: Duration) {
        self.shared.ring.lock().window = window;
        self.shared.changed.notify_one();
        debug!(window_ms = window.as_millis() as u64, "Rate limiter window changed");
    }

    /// Current number of admissions per window
    pub fn max_events(&self) -> usize {
        self.shared.ring.lock().slots.len()
    }

    /// Current sliding window
    pub fn window(&self) -> Duration {
        self.shared.ring.lock().window
    }

    /// Stop the scheduling task. Idempotent.
    pub fn stop(&self) {
        self.shared.stop.cancel();
    }
}

impl Drop for RingBufferRateLimiter {
    fn drop(&mut self) {
        self.shared.stop.cancel();
    }
}

impl std::fmt::Debug for RingBufferRateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let ring = self.shared.ring.lock();
        f.debug_struct("RingBufferRateLimiter")
            .field("max_events", &ring.slots.len())
            .field("window", &ring.window)
            .field("stopped", &self.shared.stop.is_cancelled())
            .finish()
    }
}

/// Serve tickets one at a time, sleeping until the ring admits each.
async fn schedule_tickets(shared: Arc<Shared>, mut requests: mpsc::UnboundedReceiver<Ticket>) {
    loop {
        let mut ticket = tokio::select! {
            _ = shared.stop.cancelled() => break,
            next = requests.recv() => match next {
                Some(ticket) => ticket,
                None => break,
            },
        };

        loop {
            if ticket.is_closed() {
                break;
            }

            let admission = shared.ring.lock().try_admit(Instant::now());
            let wait = match admission {
                Admission::Granted => {
                    let _ = ticket.send(());
                    break;
                }
                Admission::RetryAfter(wait) => Some(wait),
                Admission::Never => None,
            };

            let sleep = async {
                match wait {
                    Some(wait) => tokio::time::sleep(wait).await,
                    None => pending::<()>().await,
                }
            };

            tokio::select! {
                _ = shared.stop.cancelled() => {
                    trace!("Rate limiter scheduler stopped");
                    return;
                }
                _ = shared.changed.notified() => {}
                _ = ticket.closed() => break,
                _ = sleep => {}
            }
        }
    }
    trace!("Rate limiter scheduler exiting");
}

// ============================================================================
// Registry
// ============================================================================

/// Rate limiters keyed by (authority, account), created on first use.
pub struct RateLimiterRegistry {
    limiters: DashMap<(String, String), Arc<RingBufferRateLimiter>>,
    max_events: usize,
    window: Duration,
}

impl RateLimiterRegistry {
    /// Create a registry whose limiters admit `max_events` per `window`
    pub fn new(max_events: usize, window: Duration) -> Self {
        Self {
            limiters: DashMap::new(),
            max_events,
            window,
        }
    }

    /// Get or create the limiter for an (authority, account) pair.
    pub fn get(&self, authority: &str, account: &str) -> Arc<RingBufferRateLimiter> {
        let key = (authority.to_string(), account.to_string());
        let entry = self.limiters.entry(key).or_insert_with(|| {
            debug!(
                authority = %authority,
                account = %account,
                max_events = self.max_events,
                "Creating rate limiter for issuer account"
            );
            Arc::new(RingBufferRateLimiter::new(self.max_events, self.window))
        });
        Arc::clone(entry.value())
    }

    /// Number of limiters created so far
    pub fn len(&self) -> usize {
        self.limiters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.limiters.is_empty()
    }

    /// Stop and forget every limiter
    pub fn stop_all(&self) {
        for entry in self.limiters.iter() {
            entry.value().stop();
        }
        self.limiters.clear();
    }
}

impl Default for RateLimiterRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_EVENTS, DEFAULT_WINDOW)
    }
}

impl std::fmt::Debug for RateLimiterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiterRegistry")
            .field("limiters", &self.limiters.len())
            .field("max_events", &self.max_events)
            .field("window", &self.window)
            .finish()
    }
}
