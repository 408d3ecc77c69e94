//! Certward common building blocks
//!
//! Concurrency primitives shared by the certificate manager. None of these
//! know anything about certificates; they coordinate work around an
//! expensive, rate-limited upstream.
//!
//! - [`OperationContext`] - cancellable, deadline-bearing handle passed to
//!   every network-bound operation
//! - [`RetryPolicy`] / [`do_with_retry`] - bounded retries on a fixed backoff
//!   schedule that respects cancellation and terminal errors
//! - [`RingBufferRateLimiter`] - sliding-window rate limiter with a
//!   background ticket scheduler
//! - [`JobPool`] - lazily-spawned workers draining a deduplicated FIFO queue
//! - [`supervise`] - restart a background loop after a panic, a bounded
//!   number of times

pub mod jobs;
pub mod op;
pub mod rate_limit;
pub mod retry;
pub mod supervisor;

pub use jobs::{JobError, JobPool, DEFAULT_MAX_WORKERS};
pub use op::{ContextError, OperationContext};
pub use rate_limit::{RateLimitError, RateLimiterRegistry, RingBufferRateLimiter};
pub use retry::{do_with_retry, RetryDecision, RetryError, RetryPolicy};
pub use supervisor::{supervise, SupervisorHandle, DEFAULT_MAX_RESTARTS};
