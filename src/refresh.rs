//! Refresh-ahead scheduling: rebuild an entry in the background before it
//! expires, so a foreground read never blocks on a stale-but-still-valid
//! value.
//!
//! Scheduled refreshes run on a bounded work pool shared with the hybrid
//! manager's asynchronous write-behind writers (see `hybrid`). When the
//! pool is saturated, scheduling a refresh is dropped — best-effort —
//! and logged; the entry simply expires normally and the next reader
//! takes a regular miss.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;

use crate::error::CacheResult;
use crate::keygen::CacheKey;
use crate::stampede::StampedeCoordinator;

/// Schedules background rebuilds for entries nearing expiry, bounded by
/// a shared permit pool so refresh work cannot starve write-behind
/// flushes (or vice versa).
pub struct RefreshScheduler<V> {
    pool: Arc<Semaphore>,
    stampede: Arc<StampedeCoordinator<V>>,
}

impl<V: Send + Sync + 'static> RefreshScheduler<V> {
    /// Construct a scheduler sharing `pool` (its permits are also drawn
    /// on by async write-behind writers) and coordinating rebuilds
    /// through `stampede` so a scheduled refresh collapses with any
    /// concurrent miss-triggered build for the same key.
    pub fn new(pool: Arc<Semaphore>, stampede: Arc<StampedeCoordinator<V>>) -> Self {
        Self { pool, stampede }
    }

    /// Whether a read should schedule a refresh, given how much of the
    /// entry's lifetime remains and the configured threshold (a
    /// fraction of total duration, or an absolute remaining-time bound).
    pub fn should_refresh(remaining: Duration, total: Duration, threshold_fraction: f64) -> bool {
        if total.is_zero() {
            return false;
        }
        let remaining_fraction = remaining.as_secs_f64() / total.as_secs_f64();
        remaining_fraction < threshold_fraction
    }

    /// Attempt to schedule a background rebuild of `key` using `factory`.
    /// Returns `true` if a permit was available and the rebuild was
    /// scheduled; `false` if the shared pool was saturated, in which
    /// case the caller should log this as a best-effort drop and fall
    /// through to normal expiry handling.
    pub fn try_schedule<F, Fut>(&self, key: CacheKey, factory: F) -> bool
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = CacheResult<V>> + Send + 'static,
    {
        let permit = match self.pool.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                log::warn!("refresh-ahead pool saturated; dropping scheduled refresh for `{key}`");
                return false;
            }
        };

        let stampede = self.stampede.clone();
        tokio::spawn(async move {
            let _permit = permit;
            // Errors surface to whichever caller is waiting on this key's
            // single-flight slot (if any); a refresh with no waiters
            // simply logs on failure, since there is no foreground caller
            // to propagate to.
            if let Err(error) = stampede.compute_once(&key, true, factory).await {
                log::warn!("background refresh for `{key}` failed: {error}");
            }
        });
        true
    }
}
