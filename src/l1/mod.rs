//! The in-process L1 memory store.
//!
//! A concurrent key→entry table (`dashmap::DashMap`) with lazy expiry,
//! pluggable eviction, and a fast path for the hottest reads. Lazy expiry
//! means a `get` past an entry's absolute expiration removes it and
//! reports a miss on the spot; a background task additionally sweeps
//! expired entries in bounded batches every `cleanup_interval` so cold
//! keys that are never read again still get reclaimed.

pub mod eviction;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use dashmap::DashMap;

use crate::config::{L1Config, MemoryCalcMode};
use crate::keygen::CacheKey;
use eviction::EvictionPolicy;

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Per-entry access bookkeeping, read by the eviction sampler and bumped
/// on every non-fast-path hit.
#[derive(Debug, Clone, Copy)]
pub struct AccessStats {
    /// Monotonic-millis timestamp of the most recent access.
    pub last_access_millis: u64,
    /// Monotonically increasing access count for this entry's lifetime.
    pub access_count: u64,
}

/// A single L1 entry. `value` is held behind an `Arc` so a hit can hand
/// the caller a cheap clone of the handle without cloning the payload.
pub struct Entry<V> {
    pub(crate) value: Arc<V>,
    pub(crate) tags: Vec<String>,
    pub(crate) absolute_expiration_millis: u64,
    pub(crate) created_millis: u64,
    pub(crate) stats: AccessStats,
    pub(crate) size_bytes: u64,
    /// Monotonic insertion sequence, stamped from the store's own
    /// counter rather than a timestamp, so ties on a score function
    /// (two entries created in the same millisecond) still break by
    /// true insertion order.
    pub(crate) insertion_seq: u64,
}

impl<V> Entry<V> {
    fn is_expired(&self, now: u64) -> bool {
        now > self.absolute_expiration_millis
    }
}

impl<V> Clone for Entry<V> {
    fn clone(&self) -> Self {
        Self {
            value: self.value.clone(),
            tags: self.tags.clone(),
            absolute_expiration_millis: self.absolute_expiration_millis,
            created_millis: self.created_millis,
            stats: self.stats,
            size_bytes: self.size_bytes,
            insertion_seq: self.insertion_seq,
        }
    }
}

/// Snapshot of L1 store statistics. Counters are additive and
/// monotonic; reads are approximate under concurrent mutation (relaxed
/// atomics), which is acceptable for observability purposes.
#[derive(Debug, Clone, Copy, Default)]
pub struct L1Stats {
    /// Total hits since the store was created.
    pub hits: u64,
    /// Total misses since the store was created.
    pub misses: u64,
    /// Total evictions since the store was created.
    pub evictions: u64,
    /// Current estimated/accurate byte footprint, per `memory_calc_mode`.
    pub estimated_bytes: u64,
    /// Current number of live entries.
    pub entry_count: u64,
    /// Number of eviction triggers that found no candidate (the
    /// degenerate case called out by the capacity-enforcement contract).
    pub degenerate_evictions: u64,
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    degenerate_evictions: AtomicU64,
    bytes: AtomicU64,
}

/// The L1 in-process memory store.
pub struct L1Store<V> {
    entries: DashMap<CacheKey, Entry<V>>,
    config: L1Config,
    counters: Counters,
    insertion_seq: AtomicU64,
}

/// Size estimate for a value under the configured accounting mode. The
/// default assumes a fixed per-entry overhead; callers with accurate
/// sizing needs supply a real estimate through [`L1Store::set_sized`].
const ESTIMATED_ENTRY_OVERHEAD_BYTES: u64 = 64;

impl<V> L1Store<V> {
    /// Construct an empty store under the given configuration.
    pub fn new(config: L1Config) -> Self {
        Self {
            entries: DashMap::new(),
            config,
            counters: Counters::default(),
            insertion_seq: AtomicU64::new(0),
        }
    }

    /// Read a value, taking the fast path when the store is configured
    /// for it. A fast-path hit skips statistics updates entirely; misses
    /// always take the full path so eviction and expiry bookkeeping stay
    /// correct.
    pub fn get(&self, key: &CacheKey) -> Option<Arc<V>> {
        if self.config.enable_fast_path && !self.config.fast_path_track_metrics {
            if let Some(entry) = self.entries.get(key) {
                if !entry.is_expired(now_millis()) {
                    return Some(entry.value.clone());
                }
            } else {
                return None;
            }
            // fall through: expired, needs full-path removal + miss accounting
        }
        self.get_full(key)
    }

    fn get_full(&self, key: &CacheKey) -> Option<Arc<V>> {
        let now = now_millis();
        let hit = match self.entries.get_mut(key) {
            Some(mut entry) => {
                if entry.is_expired(now) {
                    drop(entry);
                    self.entries.remove(key);
                    None
                } else {
                    entry.stats.last_access_millis = now;
                    entry.stats.access_count += 1;
                    Some(entry.value.clone())
                }
            }
            None => None,
        };

        if self.config.enable_statistics {
            match &hit {
                Some(_) => self.counters.hits.fetch_add(1, Ordering::Relaxed),
                None => self.counters.misses.fetch_add(1, Ordering::Relaxed),
            };
        }
        hit
    }

    /// Insert or replace `key` with `value`, tagged with `tags` and
    /// expiring after `ttl` (clamped to `max_ttl`). Triggers eviction if
    /// the post-insert state would violate `max_entries` or `max_bytes`.
    pub fn set(&self, key: CacheKey, value: V, ttl: Duration, tags: Vec<String>) {
        self.set_sized(key, value, ttl, tags, ESTIMATED_ENTRY_OVERHEAD_BYTES)
    }

    /// Like [`Self::set`], but with an explicit size estimate for
    /// `memory_calc_mode = Accurate` callers that have already computed
    /// the payload's footprint.
    pub fn set_sized(&self, key: CacheKey, value: V, ttl: Duration, tags: Vec<String>, size_bytes: u64) {
        let ttl = ttl.min(self.config.max_ttl);
        let now = now_millis();
        let entry = Entry {
            value: Arc::new(value),
            tags,
            absolute_expiration_millis: now + ttl.as_millis() as u64,
            created_millis: now,
            stats: AccessStats {
                last_access_millis: now,
                access_count: 0,
            },
            size_bytes: if matches!(self.config.memory_calc_mode, MemoryCalcMode::Fast) {
                0
            } else {
                size_bytes
            },
            insertion_seq: self.insertion_seq.fetch_add(1, Ordering::Relaxed),
        };

        let previous_size = self
            .entries
            .insert(key, entry)
            .map(|old| old.size_bytes)
            .unwrap_or(0);

        if previous_size > 0 {
            self.counters.bytes.fetch_sub(previous_size, Ordering::Relaxed);
        }
        self.counters.bytes.fetch_add(size_bytes, Ordering::Relaxed);

        self.enforce_capacity();
    }

    fn enforce_capacity(&self) {
        let over_count = self.entries.len() > self.config.max_entries;
        let over_bytes = !matches!(self.config.memory_calc_mode, MemoryCalcMode::Fast)
            && self.counters.bytes.load(Ordering::Relaxed) > self.config.max_bytes;

        if !over_count && !over_bytes {
            return;
        }

        let sample_size = ((self.entries.len() as f64 * self.config.eviction_sample_percentage) as usize).max(1);

        // Project a snapshot of (key, entry) pairs before picking a
        // candidate so the eviction sampler never holds a DashMap shard
        // lock across its own scan.
        let snapshot: Vec<(CacheKey, Entry<V>)> = self
            .entries
            .iter()
            .map(|r| (r.key().clone(), r.value().clone()))
            .collect();
        let refs: Vec<(&CacheKey, &Entry<V>)> = snapshot.iter().map(|(k, e)| (k, e)).collect();
        let victim = eviction::pick_eviction_candidate(self.config.eviction_policy, refs.into_iter(), sample_size);

        match victim {
            Some(key) => {
                if let Some((_, entry)) = self.entries.remove(&key) {
                    self.counters.bytes.fetch_sub(entry.size_bytes, Ordering::Relaxed);
                }
                self.counters.evictions.fetch_add(1, Ordering::Relaxed);
            }
            None => {
                self.counters.degenerate_evictions.fetch_add(1, Ordering::Relaxed);
                log::warn!("eviction triggered with no candidate found; store may be empty mid-sweep");
            }
        }
    }

    /// Remove `key` unconditionally.
    pub fn remove(&self, key: &CacheKey) -> bool {
        match self.entries.remove(key) {
            Some((_, entry)) => {
                self.counters.bytes.fetch_sub(entry.size_bytes, Ordering::Relaxed);
                true
            }
            None => false,
        }
    }

    /// Remove every entry tagged with `tag`, returning the removed keys.
    pub fn remove_by_tag(&self, tag: &str) -> Vec<CacheKey> {
        let matching: Vec<CacheKey> = self
            .entries
            .iter()
            .filter(|r| r.value().tags.iter().any(|t| t == tag))
            .map(|r| r.key().clone())
            .collect();
        for key in &matching {
            self.remove(key);
        }
        matching
    }

    /// True if `key` is present and unexpired, without bumping access
    /// statistics.
    pub fn exists(&self, key: &CacheKey) -> bool {
        self.entries
            .get(key)
            .map(|e| !e.is_expired(now_millis()))
            .unwrap_or(false)
    }

    /// Sweep up to `batch_size` expired entries starting after the
    /// internal cursor, wrapping around. Intended to be driven by a
    /// periodic background task at `cleanup_interval`.
    pub fn sweep_expired(&self, batch_size: usize) -> usize {
        let now = now_millis();
        let keys: Vec<CacheKey> = self
            .entries
            .iter()
            .filter(|r| r.value().is_expired(now))
            .take(batch_size)
            .map(|r| r.key().clone())
            .collect();
        let removed = keys.len();
        for key in keys {
            self.remove(&key);
        }
        removed
    }

    /// Current statistics snapshot.
    pub fn stats(&self) -> L1Stats {
        L1Stats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            estimated_bytes: self.counters.bytes.load(Ordering::Relaxed),
            entry_count: self.entries.len() as u64,
            degenerate_evictions: self.counters.degenerate_evictions.load(Ordering::Relaxed),
        }
    }

    /// Tags currently associated with `key`, if present.
    pub fn tags_of(&self, key: &CacheKey) -> Option<Vec<String>> {
        self.entries.get(key).map(|e| e.tags.clone())
    }

    /// Time remaining until `key` expires, if present and unexpired. Used
    /// by refresh-ahead scheduling to decide whether a read is close
    /// enough to expiry to warrant a background rebuild.
    pub fn remaining_ttl(&self, key: &CacheKey) -> Option<Duration> {
        let now = now_millis();
        self.entries.get(key).map(|e| {
            if e.absolute_expiration_millis > now {
                Duration::from_millis(e.absolute_expiration_millis - now)
            } else {
                Duration::ZERO
            }
        })
    }

    /// Remove every entry, resetting the store to empty. Counters are
    /// left intact (they are lifetime totals, not point-in-time state).
    pub fn clear(&self) {
        self.entries.clear();
        self.counters.bytes.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> L1Store<String> {
        L1Store::new(L1Config {
            max_entries: 3,
            enable_fast_path: false,
            ..L1Config::default()
        })
    }

    fn key(s: &str) -> CacheKey {
        CacheKey(s.to_string())
    }

    #[test]
    fn set_then_get_hits() {
        let store = store();
        store.set(key("a"), "v".to_string(), Duration::from_secs(60), vec![]);
        assert_eq!(store.get(&key("a")).map(|v| (*v).clone()), Some("v".to_string()));
        assert_eq!(store.stats().hits, 1);
    }

    #[test]
    fn lazy_expiry_reports_miss_and_removes() {
        let store = store();
        store.set(key("a"), "v".to_string(), Duration::from_millis(0), vec![]);
        std::thread::sleep(Duration::from_millis(5));
        assert!(store.get(&key("a")).is_none());
        assert!(!store.exists(&key("a")));
    }

    #[test]
    fn remove_by_tag_removes_all_matching() {
        let store = store();
        store.set(key("a"), "1".into(), Duration::from_secs(60), vec!["t".into()]);
        store.set(key("b"), "2".into(), Duration::from_secs(60), vec!["t".into()]);
        store.set(key("c"), "3".into(), Duration::from_secs(60), vec!["other".into()]);
        let removed = store.remove_by_tag("t");
        assert_eq!(removed.len(), 2);
        assert!(store.exists(&key("c")));
    }

    #[test]
    fn eviction_triggers_at_capacity() {
        let store = store();
        for i in 0..5 {
            store.set(key(&i.to_string()), i.to_string(), Duration::from_secs(60), vec![]);
        }
        assert!(store.stats().entry_count <= 3);
        assert!(store.stats().evictions > 0);
    }
}
