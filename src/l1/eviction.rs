//! Eviction policy selection and candidate-picking algorithms for the L1
//! store.
//!
//! Approximate policies (the default) sample a bounded subset of entries
//! rather than scanning the whole table, trading a small chance of
//! evicting a non-optimal candidate for O(sample) cost instead of O(N).
//! Precise policies guarantee the global optimum at O(N log N).

use rand::seq::IteratorRandom;
use serde::{Deserialize, Serialize};

use super::Entry;
use crate::keygen::CacheKey;

/// Which eviction policy governs an L1 store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EvictionPolicy {
    /// Approximate least-recently-used, sampled.
    Lru,
    /// Approximate least-frequently-used, sampled.
    Lfu,
    /// Exact least-frequently-used, full scan.
    LfuPrecise,
    /// Approximate nearest-to-expiration, sampled.
    Ttl,
    /// Exact nearest-to-expiration, full scan.
    TtlPrecise,
    /// Oldest-inserted-first, full scan.
    Fifo,
    /// Uniform random sample.
    Random,
}

/// Minimum candidate pool size below which the sampled policies fall
/// back to scanning every entry, since a bounded sample over a small
/// table is not meaningfully cheaper than a full scan.
const SAMPLE_FALLBACK_THRESHOLD_FACTOR: usize = 2;

/// Cap on reservoir-sampling candidates for the `Random` policy.
const RANDOM_SAMPLE_CAP: usize = 100;

/// Pick the key to evict from `entries` under the given policy and
/// sample size. Returns `None` only in the degenerate case of an empty
/// candidate set.
pub fn pick_eviction_candidate<'a, V: 'a, I>(
    policy: EvictionPolicy,
    entries: I,
    sample_size: usize,
) -> Option<CacheKey>
where
    I: Iterator<Item = (&'a CacheKey, &'a Entry<V>)> + Clone,
{
    let count = entries.clone().count();
    if count == 0 {
        return None;
    }

    let use_full_scan = matches!(
        policy,
        EvictionPolicy::LfuPrecise | EvictionPolicy::TtlPrecise | EvictionPolicy::Fifo
    ) || count <= SAMPLE_FALLBACK_THRESHOLD_FACTOR * sample_size;

    match policy {
        EvictionPolicy::Lru => {
            pick_by_min(entries, use_full_scan, sample_size, |e| e.stats.last_access_millis)
        }
        EvictionPolicy::Lfu | EvictionPolicy::LfuPrecise => {
            pick_by_min(entries, use_full_scan, sample_size, |e| e.stats.access_count)
        }
        EvictionPolicy::Ttl | EvictionPolicy::TtlPrecise => {
            pick_by_min(entries, use_full_scan, sample_size, |e| e.absolute_expiration_millis)
        }
        EvictionPolicy::Fifo => {
            pick_by_min(entries, true, sample_size, |e| e.created_millis)
        }
        EvictionPolicy::Random => {
            let cap = RANDOM_SAMPLE_CAP.min(count / 4 + 1);
            let mut rng = rand::thread_rng();
            entries.choose_multiple(&mut rng, cap).into_iter().next().map(|(k, _)| k.clone())
        }
    }
}

/// Pick the candidate minimizing `key_fn`, ties broken by insertion order
/// (the earlier-inserted entry is evicted first). `DashMap` iteration
/// order carries no insertion information of its own, so entries are
/// compared on `(key_fn(e), e.insertion_seq)` rather than `key_fn(e)`
/// alone.
fn pick_by_min<'a, V: 'a, I, F>(
    entries: I,
    full_scan: bool,
    sample_size: usize,
    key_fn: F,
) -> Option<CacheKey>
where
    I: Iterator<Item = (&'a CacheKey, &'a Entry<V>)>,
    F: Fn(&Entry<V>) -> u64,
{
    const MAX_INSPECTION_FACTOR: usize = 10;

    if full_scan {
        return entries
            .min_by_key(|(_, e)| (key_fn(e), e.insertion_seq))
            .map(|(k, _)| k.clone());
    }

    let max_inspection = MAX_INSPECTION_FACTOR * sample_size;
    entries
        .take(max_inspection)
        .min_by_key(|(_, e)| (key_fn(e), e.insertion_seq))
        .map(|(k, _)| k.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keygen::{fast_hash::FastHashKeyGenerator, KeyGenerator, KeyPart};
    use crate::l1::{AccessStats, Entry};
    use std::sync::Arc;

    fn entry(created: u64, last_access: u64, access_count: u64, expiry: u64) -> Entry<()> {
        entry_seq(created, last_access, access_count, expiry, 0)
    }

    fn entry_seq(created: u64, last_access: u64, access_count: u64, expiry: u64, insertion_seq: u64) -> Entry<()> {
        Entry {
            value: Arc::new(()),
            tags: Vec::new(),
            absolute_expiration_millis: expiry,
            created_millis: created,
            stats: AccessStats {
                last_access_millis: last_access,
                access_count,
            },
            size_bytes: 8,
            insertion_seq,
        }
    }

    fn key(i: u64) -> CacheKey {
        FastHashKeyGenerator::new().generate("K", &[KeyPart::UInt(i)], 1)
    }

    #[test]
    fn lru_precise_picks_oldest_access() {
        let entries = vec![
            (key(1), entry(0, 500, 10, 10_000)),
            (key(2), entry(0, 100, 10, 10_000)),
            (key(3), entry(0, 900, 10, 10_000)),
        ];
        let refs: Vec<(&CacheKey, &Entry<()>)> = entries.iter().map(|(k, e)| (k, e)).collect();
        let picked = pick_eviction_candidate(EvictionPolicy::Lru, refs.into_iter(), 1000);
        assert_eq!(picked, Some(key(2)));
    }

    #[test]
    fn fifo_picks_earliest_created() {
        let entries = vec![
            (key(1), entry(500, 0, 0, 10_000)),
            (key(2), entry(100, 0, 0, 10_000)),
        ];
        let refs: Vec<(&CacheKey, &Entry<()>)> = entries.iter().map(|(k, e)| (k, e)).collect();
        let picked = pick_eviction_candidate(EvictionPolicy::Fifo, refs.into_iter(), 1000);
        assert_eq!(picked, Some(key(2)));
    }

    #[test]
    fn lfu_precise_ties_break_by_insertion_order() {
        // Both entries have the same access_count (0), so LfuPrecise's
        // primary score ties; the one inserted first must be picked.
        let entries = vec![
            (key(1), entry_seq(0, 0, 0, 10_000, 5)),
            (key(2), entry_seq(0, 0, 0, 10_000, 2)),
            (key(3), entry_seq(0, 0, 0, 10_000, 9)),
        ];
        let refs: Vec<(&CacheKey, &Entry<()>)> = entries.iter().map(|(k, e)| (k, e)).collect();
        let picked = pick_eviction_candidate(EvictionPolicy::LfuPrecise, refs.into_iter(), 1000);
        assert_eq!(picked, Some(key(2)));
    }

    #[test]
    fn ttl_precise_ties_break_by_insertion_order() {
        // Both entries expire at the same millisecond, so TtlPrecise's
        // primary score ties; the one inserted first must be picked.
        let entries = vec![
            (key(1), entry_seq(0, 0, 0, 10_000, 7)),
            (key(2), entry_seq(0, 0, 0, 10_000, 1)),
        ];
        let refs: Vec<(&CacheKey, &Entry<()>)> = entries.iter().map(|(k, e)| (k, e)).collect();
        let picked = pick_eviction_candidate(EvictionPolicy::TtlPrecise, refs.into_iter(), 1000);
        assert_eq!(picked, Some(key(2)));
    }

    #[test]
    fn empty_candidate_set_returns_none() {
        let entries: Vec<(CacheKey, Entry<()>)> = Vec::new();
        let refs: Vec<(&CacheKey, &Entry<()>)> = entries.iter().map(|(k, e)| (k, e)).collect();
        assert_eq!(pick_eviction_candidate(EvictionPolicy::Lru, refs.into_iter(), 10), None);
    }
}
