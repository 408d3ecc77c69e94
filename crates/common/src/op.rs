//! Operation handles for network-bound work.
//!
//! An [`OperationContext`] bundles a cancellation token, an optional
//! deadline, and the number of attempts the Retry Coordinator has made so
//! far. Clones share all three, so a unit of work handed a clone observes
//! cancellation and attempt numbers set by its caller.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Why an operation stopped early
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ContextError {
    /// The operation was explicitly cancelled
    #[error("operation cancelled")]
    Cancelled,
    /// The operation's deadline passed
    #[error("operation deadline exceeded")]
    DeadlineExceeded,
}

/// Cancellable, deadline-bearing handle for a single logical operation.
#[derive(Debug, Clone)]
pub struct OperationContext {
    token: CancellationToken,
    deadline: Option<Instant>,
    attempts: Arc<AtomicU32>,
}

impl OperationContext {
    /// Create a root context with no deadline
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            deadline: None,
            attempts: Arc::new(AtomicU32::new(0)),
        }
    }

    /// Derive a child context that expires after `timeout`.
    ///
    /// The child is cancelled when the parent is. Its deadline is the
    /// earlier of the parent's deadline and `now + timeout`. The attempt
    /// counter starts fresh because the child is a new operation.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        let candidate = Instant::now() + timeout;
        let deadline = match self.deadline {
            Some(existing) if existing < candidate => existing,
            _ => candidate,
        };
        Self {
            token: self.token.child_token(),
            deadline: Some(deadline),
            attempts: Arc::new(AtomicU32::new(0)),
        }
    }

    /// Derive a child context that shares the parent's deadline
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
            deadline: self.deadline,
            attempts: Arc::new(AtomicU32::new(0)),
        }
    }

    /// Cancel this context and every child derived from it
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Returns the reason the context is finished, if it is
    pub fn err(&self) -> Option<ContextError> {
        if self.token.is_cancelled() {
            return Some(ContextError::Cancelled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Some(ContextError::DeadlineExceeded),
            _ => None,
        }
    }

    /// True once the context is cancelled or past its deadline
    pub fn is_done(&self) -> bool {
        self.err().is_some()
    }

    /// The deadline, if any
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left before the deadline; `None` means unbounded
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    /// Resolves when the context is cancelled or its deadline passes.
    pub async fn done(&self) -> ContextError {
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    _ = self.token.cancelled() => ContextError::Cancelled,
                    _ = tokio::time::sleep_until(deadline) => ContextError::DeadlineExceeded,
                }
            }
            None => {
                self.token.cancelled().await;
                ContextError::Cancelled
            }
        }
    }

    /// Number of attempts already made by the Retry Coordinator.
    ///
    /// Zero on the first attempt.
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::Acquire)
    }

    pub(crate) fn set_attempts(&self, attempts: u32) {
        self.attempts.store(attempts, Ordering::Release);
    }

    /// The underlying cancellation token
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

impl Default for OperationContext {
    fn default() -> Self {
        Self::new()
    }
}
