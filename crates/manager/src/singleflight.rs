//! Per-name wait tokens.
//!
//! The first caller to [`SingleFlight::begin`] for a name becomes the
//! leader and receives a [`FlightGuard`]; everyone arriving while the guard
//! lives receives a [`Waiter`] instead. The guard publishes its outcome with
//! [`FlightGuard::finish`]. Dropping it without finishing (for example when
//! the leader's task is cancelled) still releases the waiters.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::trace;

use crate::error::CertError;

/// Result of a finished operation, shared with every waiter
pub type FlightOutcome = Result<(), Arc<CertError>>;

type Slot = watch::Receiver<Option<FlightOutcome>>;

/// Table of in-flight operations keyed by name. Clones share the table.
#[derive(Clone, Default)]
pub struct SingleFlight {
    flights: Arc<Mutex<HashMap<String, Slot>>>,
}

/// Role assigned by [`SingleFlight::begin`]
pub enum Flight {
    Leader(FlightGuard),
    Follower(Waiter),
}

impl SingleFlight {
    pub fn new() -> Self {
        Self::default()
    }

    /// Join the flight for `name`, creating it if none is in progress.
    pub fn begin(&self, name: &str) -> Flight {
        let mut flights = self.flights.lock();
        if let Some(rx) = flights.get(name) {
            trace!(name = %name, "Joining in-flight operation");
            return Flight::Follower(Waiter { rx: rx.clone() });
        }

        let (tx, rx) = watch::channel(None);
        flights.insert(name.to_string(), rx);
        Flight::Leader(FlightGuard {
            name: name.to_string(),
            tx,
            flights: Arc::clone(&self.flights),
        })
    }

    /// True if an operation for `name` is in progress
    pub fn in_flight(&self, name: &str) -> bool {
        self.flights.lock().contains_key(name)
    }

    /// Number of operations in progress
    pub fn len(&self) -> usize {
        self.flights.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for SingleFlight {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SingleFlight")
            .field("in_flight", &self.len())
            .finish()
    }
}

/// Held by the leader of a flight
pub struct FlightGuard {
    name: String,
    tx: watch::Sender<Option<FlightOutcome>>,
    flights: Arc<Mutex<HashMap<String, Slot>>>,
}

impl FlightGuard {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Publish the outcome and release every waiter
    pub fn finish(self, outcome: FlightOutcome) {
        self.tx.send_replace(Some(outcome));
    }
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        self.flights.lock().remove(&self.name);
    }
}

/// Held by callers that arrived while a flight was in progress
pub struct Waiter {
    rx: Slot,
}

impl Waiter {
    /// Wait for the leader.
    ///
    /// Returns `None` if the leader went away without publishing an
    /// outcome.
    pub async fn wait(mut self) -> Option<FlightOutcome> {
        loop {
            if let Some(outcome) = self.rx.borrow_and_update().clone() {
                return Some(outcome);
            }
            if self.rx.changed().await.is_err() {
                return self.rx.borrow().clone();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_second_caller_is_follower() {
        let flights = SingleFlight::new();
        let leader = match flights.begin("a.example.com") {
            Flight::Leader(guard) => guard,
            Flight::Follower(_) => panic!("first caller must lead"),
        };
        assert!(matches!(flights.begin("a.example.com"), Flight::Follower(_)));
        assert!(matches!(flights.begin("b.example.com"), Flight::Leader(_)));

        leader.finish(Ok(()));
        assert!(!flights.in_flight("a.example.com"));
        assert!(matches!(flights.begin("a.example.com"), Flight::Leader(_)));
    }

    #[tokio::test]
    async fn test_waiters_receive_outcome() {
        let flights = SingleFlight::new();
        let Flight::Leader(leader) = flights.begin("a") else {
            panic!("expected leader");
        };

        let mut waiters = Vec::new();
        for _ in 0..5 {
            let Flight::Follower(waiter) = flights.begin("a") else {
                panic!("expected follower");
            };
            waiters.push(tokio::spawn(waiter.wait()));
        }

        tokio::time::sleep(Duration::from_millis(10)).await;
        leader.finish(Err(Arc::new(CertError::NoIssuers)));

        for waiter in waiters {
            let outcome = waiter.await.unwrap().expect("leader published an outcome");
            assert!(matches!(outcome.unwrap_err().as_ref(), CertError::NoIssuers));
        }
    }

    #[tokio::test]
    async fn test_dropped_leader_releases_waiters() {
        let flights = SingleFlight::new();
        let Flight::Leader(leader) = flights.begin("a") else {
            panic!("expected leader");
        };
        let Flight::Follower(waiter) = flights.begin("a") else {
            panic!("expected follower");
        };

        drop(leader);
        assert!(waiter.wait().await.is_none());
        assert!(flights.is_empty());
    }

    #[tokio::test]
    async fn test_late_follower_sees_published_outcome() {
        let flights = SingleFlight::new();
        let Flight::Leader(leader) = flights.begin("a") else {
            panic!("expected leader");
        };
        let Flight::Follower(waiter) = flights.begin("a") else {
            panic!("expected follower");
        };
        leader.finish(Ok(()));
        assert!(matches!(waiter.wait().await, Some(Ok(()))));
    }
}
