//! Stampede coordination: at most one concurrent build per key.
//!
//! When many callers miss the same key at once, only one factory
//! invocation actually runs; the rest attach to its result. The
//! in-flight build is driven by its own spawned task so that a caller
//! dropping out (cancellation) never cancels the build for everyone
//! else — only the distinguished leader's cancellation (via
//! [`StampedeCoordinator::cancel`]) does, and even then only when the
//! policy marks the factory as cancel-safe.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::broadcast;

use crate::error::{CacheError, CacheResult};
use crate::keygen::CacheKey;
use crate::policy::StampedeMode;

/// Result type threaded through the broadcast channel every waiter
/// subscribes to; errors are stringified since `CacheError` is not
/// `Clone` and every waiter needs its own copy of the outcome.
type BuildOutcome<V> = Result<Arc<V>, String>;

struct InFlight<V> {
    tx: broadcast::Sender<BuildOutcome<V>>,
    cancel_safe: bool,
    abort: Option<tokio::task::AbortHandle>,
}

/// Coordinates factory invocations so at most one runs per key at a
/// time within this process.
pub struct StampedeCoordinator<V> {
    in_flight: Arc<DashMap<CacheKey, InFlight<V>>>,
}

impl<V: Send + Sync + 'static> Default for StampedeCoordinator<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V: Send + Sync + 'static> StampedeCoordinator<V> {
    /// Construct an empty coordinator.
    pub fn new() -> Self {
        Self {
            in_flight: Arc::new(DashMap::new()),
        }
    }

    /// Run `factory` for `key` under single-flight semantics: if a build
    /// for `key` is already in flight, await its result instead of
    /// starting a new one. The factory's success is visible to every
    /// waiter at the same logical point — no waiter observes a
    /// partially-applied write.
    pub async fn compute_once<F, Fut>(&self, key: &CacheKey, cancel_safe: bool, factory: F) -> CacheResult<Arc<V>>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = CacheResult<V>> + Send + 'static,
    {
        let mut factory = Some(factory);

        loop {
            if let Some(in_flight) = self.in_flight.get(key) {
                let mut rx = in_flight.tx.subscribe();
                drop(in_flight);
                match rx.recv().await {
                    Ok(Ok(value)) => return Ok(value),
                    Ok(Err(message)) => return Err(CacheError::FactoryFailed(key.to_string(), message)),
                    // Sender dropped without sending (leader's task panicked)
                    // or this receiver fell behind the single-slot channel:
                    // either way, retry as if no build were in flight.
                    Err(broadcast::error::RecvError::Closed)
                    | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                }
            }

            let (tx, _rx) = broadcast::channel(1);
            if let dashmap::mapref::entry::Entry::Vacant(slot) = self.in_flight.entry(key.clone()) {
                slot.insert(InFlight { tx: tx.clone(), cancel_safe, abort: None });

                if let Some(factory) = factory.take() {
                    // Spawned independently of this call's future: if the
                    // original caller is dropped, the build still runs to
                    // completion and every other waiter still observes its
                    // result.
                    let in_flight_map = self.in_flight.clone();
                    let key_owned = key.clone();
                    let key_for_handle = key.clone();
                    let handle = tokio::spawn(async move {
                        let result = factory().await;
                        in_flight_map.remove(&key_owned);
                        match result {
                            Ok(value) => {
                                let _ = tx.send(Ok(Arc::new(value)));
                            }
                            Err(error) => {
                                let _ = tx.send(Err(error.to_string()));
                            }
                        }
                    });
                    if let Some(mut entry) = self.in_flight.get_mut(&key_for_handle) {
                        entry.abort = Some(handle.abort_handle());
                    }
                }
            }
            // Either we just registered the spawned build, or another
            // caller won the race between our first check and this
            // insert attempt; in both cases loop back and subscribe like
            // every other waiter.
        }
    }

    /// Remove the in-flight record for `key` if present and its build
    /// was registered as cancel-safe, allowing the next caller to start
    /// a fresh attempt immediately instead of waiting on one that will
    /// never complete.
    pub fn cancel(&self, key: &CacheKey) -> bool {
        match self.in_flight.get(key) {
            Some(in_flight) if in_flight.cancel_safe => {
                if let Some(abort) = &in_flight.abort {
                    abort.abort();
                }
                drop(in_flight);
                self.in_flight.remove(key);
                true
            }
            _ => false,
        }
    }

    /// Whether a build for `key` is currently in flight.
    pub fn is_in_flight(&self, key: &CacheKey) -> bool {
        self.in_flight.contains_key(key)
    }
}

/// Probability of preemptive recomputation under probabilistic early
/// refresh: `p = exp(-beta * remaining_ttl / mean_build_time)`. As
/// `remaining_ttl` shrinks toward zero, `p` rises toward 1; as it grows,
/// `p` falls toward 0. `mean_build_time` of zero is treated as
/// "instant factory", always triggering early refresh once inside the
/// window.
pub fn probabilistic_refresh_probability(beta: f64, remaining_ttl: Duration, mean_build_time: Duration) -> f64 {
    if mean_build_time.is_zero() {
        return 1.0;
    }
    let ratio = remaining_ttl.as_secs_f64() / mean_build_time.as_secs_f64();
    (-beta * ratio).exp().clamp(0.0, 1.0)
}

/// Decide, given a policy's stampede mode and a random draw, whether a
/// near-expiry read should trigger a probabilistic early refresh. Pure
/// function so callers supply their own RNG draw for testability.
pub fn should_probabilistically_refresh(
    mode: StampedeMode,
    draw: f64,
    beta: f64,
    remaining_ttl: Duration,
    mean_build_time: Duration,
) -> bool {
    if mode != StampedeMode::Probabilistic {
        return false;
    }
    draw < probabilistic_refresh_probability(beta, remaining_ttl, mean_build_time)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn concurrent_callers_collapse_to_one_build() {
        let coordinator = Arc::new(StampedeCoordinator::<u64>::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let key = CacheKey(String::from("k"));

        let mut handles = Vec::new();
        for _ in 0..10 {
            let coordinator = coordinator.clone();
            let calls = calls.clone();
            let key = key.clone();
            handles.push(tokio::spawn(async move {
                coordinator
                    .compute_once(&key, false, move || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        Ok(42u64)
                    })
                    .await
            }));
        }

        for h in handles {
            let v = h.await.unwrap().unwrap();
            assert_eq!(*v, 42);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn probability_rises_as_ttl_shrinks() {
        let p_far = probabilistic_refresh_probability(1.0, Duration::from_secs(100), Duration::from_secs(1));
        let p_near = probabilistic_refresh_probability(1.0, Duration::from_millis(10), Duration::from_secs(1));
        assert!(p_near > p_far);
    }

    #[test]
    fn none_mode_never_refreshes() {
        assert!(!should_probabilistically_refresh(
            StampedeMode::None,
            0.0,
            1.0,
            Duration::from_millis(1),
            Duration::from_secs(1)
        ));
    }
}
