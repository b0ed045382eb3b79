//! Single-flight deduplication of concurrent identical async calls.
//!
//! Used by the upload manager to collapse the remote directory-marker
//! creation races that a streaming tree walk produces: many file jobs
//! sharing one parent directory resolve to one in-flight call whose
//! outcome everyone observes.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use futures_util::FutureExt;
use futures_util::future::Shared;

type FlightResult<T> = Result<T, String>;
type FlightFuture<T> = Shared<Pin<Box<dyn Future<Output = FlightResult<T>> + Send>>>;

/// Collapses concurrent calls sharing a key into one execution.
///
/// Invariant: at most one outstanding execution per key at any
/// instant. The entry is evicted once the flight settles, so a later
/// non-overlapping call performs a fresh invocation. No queueing.
pub struct SingleFlight<T: Clone + Send + Sync + 'static> {
    inflight: Arc<Mutex<HashMap<String, FlightFuture<T>>>>,
}

impl<T: Clone + Send + Sync + 'static> Default for SingleFlight<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + Sync + 'static> SingleFlight<T> {
    pub fn new() -> Self {
        Self {
            inflight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Executes `f` unless a call with the same `key` is already in
    /// flight, in which case the in-flight outcome is shared. Errors
    /// are carried as display strings so every caller can observe the
    /// same failure.
    pub async fn call<F, Fut, E>(&self, key: &str, f: F) -> FlightResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        E: std::fmt::Display,
    {
        let flight = {
            let mut map = self.inflight.lock().unwrap();
            if let Some(existing) = map.get(key) {
                existing.clone()
            } else {
                let map_ref = Arc::clone(&self.inflight);
                let evict_key = key.to_string();
                let fut = f();
                let flight: FlightFuture<T> = async move {
                    let out = fut.await.map_err(|e| e.to_string());
                    // Settle first, then evict: a caller arriving after
                    // this point starts a fresh flight.
                    map_ref.lock().unwrap().remove(&evict_key);
                    out
                }
                .boxed()
                .shared();
                map.insert(key.to_string(), flight.clone());
                flight
            }
        };
        flight.await
    }

    /// Number of keys currently in flight.
    pub fn len(&self) -> usize {
        self.inflight.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inflight.lock().unwrap().is_empty()
    }
}
