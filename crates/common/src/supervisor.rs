//! Supervised background tasks.
//!
//! [`supervise`] runs a long-lived loop on the Tokio runtime and restarts it
//! if it panics, up to a fixed number of times, so a systematic bug cannot
//! turn into an endless crash loop. The loop receives a cancellation token
//! and should return once it fires.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use futures::FutureExt;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Default number of restarts after a panic
pub const DEFAULT_MAX_RESTARTS: u32 = 10;

/// Best-effort text of a panic payload
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Handle to a supervised task
pub struct SupervisorHandle {
    name: String,
    token: CancellationToken,
    restarts: Arc<AtomicU32>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl SupervisorHandle {
    /// Task name used in logs
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of times the loop has been restarted after a panic
    pub fn restarts(&self) -> u32 {
        self.restarts.load(Ordering::Acquire)
    }

    /// Signal the loop to stop without waiting for it
    pub fn stop(&self) {
        self.token.cancel();
    }

    /// True once the loop has exited for good
    pub fn is_finished(&self) -> bool {
        self.task
            .lock()
            .as_ref()
            .map_or(true, |task| task.is_finished())
    }

    /// Stop the loop and wait for it to exit
    pub async fn shutdown(&self) {
        self.token.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(task = %self.name, error = %e, "Supervised task did not shut down cleanly");
            }
        }
    }
}

impl std::fmt::Debug for SupervisorHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SupervisorHandle")
            .field("name", &self.name)
            .field("restarts", &self.restarts())
            .field("stopped", &self.token.is_cancelled())
            .finish()
    }
}

/// Spawn `factory`'s loop and keep it alive across panics.
///
/// `factory` is called once per (re)start with the supervisor's
/// cancellation token. A loop that returns normally is not restarted.
/// After `max_restarts` restarts the next panic is logged and the task
/// stays down.
pub fn supervise<F, Fut>(name: impl Into<String>, max_restarts: u32, mut factory: F) -> SupervisorHandle
where
    F: FnMut(CancellationToken) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let name = name.into();
    let token = CancellationToken::new();
    let restarts = Arc::new(AtomicU32::new(0));

    let task = {
        let name = name.clone();
        let token = token.clone();
        let restarts = Arc::clone(&restarts);
        tokio::spawn(async move {
            loop {
                let run = factory(token.clone());
                let panic = match AssertUnwindSafe(run).catch_unwind().await {
                    Ok(()) => {
                        info!(task = %name, "Supervised task exited");
                        return;
                    }
                    Err(panic) => panic_message(panic.as_ref()),
                };

                if token.is_cancelled() {
                    error!(task = %name, panic = %panic, "Supervised task panicked during shutdown");
                    return;
                }

                let restarted = restarts.load(Ordering::Acquire);
                if restarted >= max_restarts {
                    error!(
                        task = %name,
                        panic = %panic,
                        restarts = restarted,
                        "Supervised task panicked too many times; giving up"
                    );
                    return;
                }

                restarts.store(restarted + 1, Ordering::Release);
                error!(
                    task = %name,
                    panic = %panic,
                    restart = restarted + 1,
                    max_restarts = max_restarts,
                    "Supervised task panicked; restarting"
                );
            }
        })
    };

    SupervisorHandle {
        name,
        token,
        restarts,
        task: Mutex::new(Some(task)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[tokio::test]
    async fn test_gives_up_after_max_restarts() {
        let starts = Arc::new(AtomicUsize::new(0));
        let handle = {
            let starts = Arc::clone(&starts);
            supervise("always-panics", 3, move |_token| {
                starts.fetch_add(1, Ordering::SeqCst);
                async {
                    panic!("systematic bug");
                }
            })
        };

        tokio::time::timeout(Duration::from_secs(5), async {
            while !handle.is_finished() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        assert_eq!(starts.load(Ordering::SeqCst), 4);
        assert_eq!(handle.restarts(), 3);
    }

    #[tokio::test]
    async fn test_recovers_from_single_panic() {
        let starts = Arc::new(AtomicUsize::new(0));
        let handle = {
            let starts = Arc::clone(&starts);
            supervise("flaky", 10, move |token| {
                let attempt = starts.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt == 0 {
                        panic!("first tick fault");
                    }
                    token.cancelled().await;
                }
            })
        };

        tokio::time::timeout(Duration::from_secs(5), async {
            while handle.restarts() == 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        assert!(!handle.is_finished());

        handle.shutdown().await;
        assert!(handle.is_finished());
        assert_eq!(starts.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_panic_message() {
        let payload: Box<dyn Any + Send> = Box::new("static message");
        assert_eq!(panic_message(payload.as_ref()), "static message");

        let payload: Box<dyn Any + Send> = Box::new(String::from("owned message"));
        assert_eq!(panic_message(payload.as_ref()), "owned message");

        let payload: Box<dyn Any + Send> = Box::new(42u8);
        assert_eq!(panic_message(payload.as_ref()), "unknown panic");
    }
}
