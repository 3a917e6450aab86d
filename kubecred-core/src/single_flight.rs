//! Per-key request coalescing.
//!
//! The first caller for a key becomes the leader and its future is shared;
//! every concurrent caller for the same key awaits that same future and
//! observes the same result. The entry is removed when the future settles,
//! success or failure, so failures are never remembered.
//!
//! Any write-through the caller needs must happen inside the future, so a
//! caller arriving after deregistration finds the value in the cache.

use futures_util::future::{BoxFuture, FutureExt, Shared};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

type SharedFlight<V, E> = Shared<BoxFuture<'static, Result<V, E>>>;

/// Whether the caller started the flight or joined one in progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlightRole {
    Leader,
    Joined,
}

struct FlightSlot<V, E> {
    id: u64,
    flight: SharedFlight<V, E>,
}

/// Coalesces concurrent work per string key.
pub struct SingleFlight<V, E> {
    in_flight: Arc<Mutex<HashMap<String, FlightSlot<V, E>>>>,
    next_id: AtomicU64,
}

impl<V, E> Default for SingleFlight<V, E> {
    fn default() -> Self {
        Self {
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(0),
        }
    }
}

impl<V, E> SingleFlight<V, E>
where
    V: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `work` for `key` unless a flight for `key` is already running,
    /// in which case join it. `work` is only invoked by the leader.
    pub async fn run<F, Fut>(&self, key: &str, work: F) -> (Result<V, E>, FlightRole)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
    {
        let (flight, role) = {
            let mut map = self.in_flight.lock().await;
            match map.get(key) {
                Some(slot) => (slot.flight.clone(), FlightRole::Joined),
                None => {
                    let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                    let registry = Arc::clone(&self.in_flight);
                    let owned_key = key.to_string();
                    let inner = work();
                    let flight = async move {
                        let result = inner.await;
                        let mut map = registry.lock().await;
                        if map.get(&owned_key).is_some_and(|slot| slot.id == id) {
                            map.remove(&owned_key);
                        }
                        result
                    }
                    .boxed()
                    .shared();
                    map.insert(
                        key.to_string(),
                        FlightSlot {
                            id,
                            flight: flight.clone(),
                        },
                    );
                    (flight, FlightRole::Leader)
                }
            }
        };
        (flight.await, role)
    }

    /// Number of flights currently registered.
    pub async fn in_flight(&self) -> usize {
        self.in_flight.lock().await.len()
    }

    /// Detach every running flight. Their current callers still get the
    /// result; later callers start a new flight.
    pub async fn forget_all(&self) {
        self.in_flight.lock().await.clear();
    }
}
