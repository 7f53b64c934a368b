//! Per-key in-flight deduplication.
//!
//! The first caller for a key (the leader) runs the work; callers that
//! arrive while it is running (followers) wait for the leader's outcome
//! instead of issuing a duplicate dispatch. The map entry is removed when
//! the leader finishes, fails, or is dropped mid-flight. A follower whose
//! leader was dropped runs the work itself.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Mutex, PoisonError};

use tokio::sync::watch;
use tracing::debug;

use crate::Result;

type Slot<T> = watch::Receiver<Option<Result<T>>>;

enum Flight<T> {
    Leader(watch::Sender<Option<Result<T>>>),
    Follower(Slot<T>),
}

/// Deduplicates concurrent work by key.
pub struct SingleFlight<T> {
    inflight: Mutex<HashMap<String, Slot<T>>>,
}

impl<T> Default for SingleFlight<T> {
    fn default() -> Self {
        Self {
            inflight: Mutex::new(HashMap::new()),
        }
    }
}

impl<T: Clone> SingleFlight<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys currently in flight.
    pub fn in_flight(&self) -> usize {
        self.inflight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Run `work` for `key`, or join a call already running for it.
    pub async fn run<F, Fut>(&self, key: &str, work: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let flight = {
            let mut map = self.inflight.lock().unwrap_or_else(PoisonError::into_inner);
            match map.get(key) {
                Some(slot) => Flight::Follower(slot.clone()),
                None => {
                    let (tx, rx) = watch::channel(None);
                    map.insert(key.to_string(), rx);
                    Flight::Leader(tx)
                }
            }
        };

        match flight {
            Flight::Leader(tx) => {
                let _guard = FlightGuard {
                    inflight: &self.inflight,
                    key,
                };
                let result = work().await;
                tx.send_replace(Some(result.clone()));
                result
            }
            Flight::Follower(mut slot) => {
                let shared = slot
                    .wait_for(Option::is_some)
                    .await
                    .ok()
                    .and_then(|outcome| outcome.clone());
                match shared {
                    Some(result) => result,
                    None => {
                        debug!(key, "in-flight leader dropped, running call directly");
                        work().await
                    }
                }
            }
        }
    }
}

/// Removes the map entry however the leader exits.
struct FlightGuard<'a, T> {
    inflight: &'a Mutex<HashMap<String, Slot<T>>>,
    key: &'a str,
}

impl<T> Drop for FlightGuard<'_, T> {
    fn drop(&mut self) {
        self.inflight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(self.key);
    }
}
