//! Configuration surface for the L1 store, the hybrid storage coordinator,
//! and policy defaults.
//!
//! Mirrors the layout and `from_file`/`save` round-trip of configuration
//! structs elsewhere in this codebase: plain `serde`-derived structs with a
//! hand-written `Default` impl carrying the recommended numbers, loadable
//! from and savable to JSON.

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{CacheError, CacheResult};
use crate::l1::eviction::EvictionPolicy;

/// Memory accounting strategy for the L1 store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MemoryCalcMode {
    /// Skip size accounting entirely; `max_bytes` is not enforced.
    Fast,
    /// Cheap heuristic based on type size and a fixed per-entry overhead.
    Estimated,
    /// Walk the value to compute an exact byte count; most expensive.
    Accurate,
}

impl Default for MemoryCalcMode {
    fn default() -> Self {
        MemoryCalcMode::Estimated
    }
}

/// Retry policy for a remote storage provider (L2 or L3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of retry attempts after the initial try.
    pub max_retries: u32,
    /// Delay before the first retry.
    #[serde(with = "duration_millis")]
    pub base_delay: Duration,
    /// Upper bound on any single retry delay.
    #[serde(with = "duration_millis")]
    pub max_delay: Duration,
    /// Whether delays double after each attempt, capped at `max_delay`.
    pub use_exponential_backoff: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(2),
            use_exponential_backoff: true,
        }
    }
}

/// Configuration for the L1 in-process memory store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct L1Config {
    /// Maximum number of entries before eviction kicks in.
    pub max_entries: usize,
    /// Maximum estimated/accurate byte footprint before eviction kicks in.
    /// Ignored when `memory_calc_mode` is `Fast`.
    pub max_bytes: u64,
    /// Default time-to-live applied when a policy does not specify one.
    #[serde(with = "duration_millis")]
    pub default_ttl: Duration,
    /// Hard ceiling on any entry's time-to-live, regardless of policy.
    #[serde(with = "duration_millis")]
    pub max_ttl: Duration,
    /// Which eviction policy governs this store.
    pub eviction_policy: EvictionPolicy,
    /// Interval between background cleanup sweeps.
    #[serde(with = "duration_millis")]
    pub cleanup_interval: Duration,
    /// Whether a background task performs periodic expired-entry cleanup.
    pub enable_background_cleanup: bool,
    /// Whether hit/miss/eviction counters are maintained.
    pub enable_statistics: bool,
    /// Whether the sub-60ns fast path is available for eligible reads.
    pub enable_fast_path: bool,
    /// Whether the fast path still records statistics (at a latency cost).
    pub fast_path_track_metrics: bool,
    /// How entry size is computed for `max_bytes` enforcement.
    pub memory_calc_mode: MemoryCalcMode,
    /// Fraction (0.0-1.0) of entries sampled for statistics-driven decisions.
    pub sampling_percentage: f64,
    /// Sample size used by approximate eviction policies.
    pub eviction_sample_percentage: f64,
}

impl Default for L1Config {
    fn default() -> Self {
        Self {
            max_entries: 100_000,
            max_bytes: 256 * 1024 * 1024,
            default_ttl: Duration::from_secs(300),
            max_ttl: Duration::from_secs(86_400),
            eviction_policy: EvictionPolicy::Lru,
            cleanup_interval: Duration::from_secs(30),
            enable_background_cleanup: true,
            enable_statistics: true,
            enable_fast_path: true,
            fast_path_track_metrics: false,
            memory_calc_mode: MemoryCalcMode::Estimated,
            sampling_percentage: 1.0,
            eviction_sample_percentage: 0.05,
        }
    }
}

/// Configuration for the hybrid L1/L2/L3 storage coordinator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HybridConfig {
    /// Whether an L2 (distributed) tier is active.
    pub l2_enabled: bool,
    /// Whether an L3 (persistent) tier is active.
    pub l3_enabled: bool,
    /// Default TTL applied to L1 writes.
    #[serde(with = "duration_millis")]
    pub l1_default_ttl: Duration,
    /// Default TTL applied to L2 writes.
    #[serde(with = "duration_millis")]
    pub l2_default_ttl: Duration,
    /// Default TTL applied to L3 writes.
    #[serde(with = "duration_millis")]
    pub l3_default_ttl: Duration,
    /// Whether L2 writes are queued (write-behind) rather than synchronous.
    pub async_l2_writes: bool,
    /// Whether L3 writes are queued (write-behind) rather than synchronous.
    pub async_l3_writes: bool,
    /// Capacity of the bounded write-behind queue shared by L2/L3 writers.
    pub async_write_queue_capacity: usize,
    /// Maximum concurrent in-flight L2 operations.
    pub max_concurrent_l2: usize,
    /// Maximum concurrent in-flight L3 operations.
    pub max_concurrent_l3: usize,
    /// Whether invalidations are published to the cross-process backplane.
    pub enable_backplane: bool,
    /// Identifier for this process, used to suppress self-originated
    /// backplane messages.
    pub instance_id: String,
    /// Prefix prepended to every generated key before it reaches a
    /// remote tier, namespacing this process's keys from others sharing
    /// the same L2/L3 backend.
    pub key_prefix: String,
    /// Retry policy applied to L2 operations.
    pub l2_retry: RetryConfig,
    /// Retry policy applied to L3 operations.
    pub l3_retry: RetryConfig,
    /// Whether L3 hits may promote an entry back to L1.
    pub enable_l3_promotion: bool,
    /// Minimum observed access age (since last promotion check) before an
    /// L3 hit is eligible for promotion, preventing one-shot reads from
    /// polluting L1.
    #[serde(with = "duration_millis")]
    pub l3_promotion_threshold: Duration,
    /// Whether the tag index is consulted to invalidate L1 entries
    /// directly by tag, instead of falling back to a full scan.
    pub enable_efficient_l1_tag_invalidation: bool,
    /// Upper bound on total (key, tag) pairs tracked by the tag index.
    pub max_tag_mappings: usize,
}

impl Default for HybridConfig {
    fn default() -> Self {
        Self {
            l2_enabled: false,
            l3_enabled: false,
            l1_default_ttl: Duration::from_secs(300),
            l2_default_ttl: Duration::from_secs(900),
            l3_default_ttl: Duration::from_secs(3600),
            async_l2_writes: true,
            async_l3_writes: true,
            async_write_queue_capacity: 1024,
            max_concurrent_l2: 32,
            max_concurrent_l3: 16,
            enable_backplane: true,
            instance_id: uuid::Uuid::new_v4().to_string(),
            key_prefix: String::from("tiercache"),
            l2_retry: RetryConfig::default(),
            l3_retry: RetryConfig::default(),
            enable_l3_promotion: true,
            l3_promotion_threshold: Duration::from_secs(5),
            enable_efficient_l1_tag_invalidation: true,
            max_tag_mappings: 1_000_000,
        }
    }
}

/// Default policy fields applied when a caller-supplied policy descriptor
/// leaves a field unset. Layered beneath attribute, fluent-builder, and
/// config-file sources in the policy registry's precedence chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyDefaults {
    /// Fallback cache duration.
    #[serde(with = "duration_millis")]
    pub duration: Duration,
    /// Fallback refresh-ahead threshold, as a fraction of `duration`.
    pub refresh_ahead_fraction: Option<f64>,
    /// Fallback stampede-protection mode.
    pub stampede_mode: crate::policy::StampedeMode,
    /// Beta coefficient for probabilistic early refresh.
    pub probabilistic_beta: f64,
    /// Fallback policy version; bumping it invalidates every key generated
    /// under the old version.
    pub version: u32,
}

impl Default for PolicyDefaults {
    fn default() -> Self {
        Self {
            duration: Duration::from_secs(300),
            refresh_ahead_fraction: None,
            stampede_mode: crate::policy::StampedeMode::SingleFlight,
            probabilistic_beta: 1.0,
            version: 1,
        }
    }
}

/// Top-level configuration bundling the L1, hybrid, and policy defaults
/// sections, loadable from and savable to a single JSON document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheConfig {
    /// L1 store configuration.
    pub l1: L1Config,
    /// Hybrid storage coordinator configuration.
    pub hybrid: HybridConfig,
    /// Policy defaults layer.
    pub policy_defaults: PolicyDefaults,
}

impl CacheConfig {
    /// Load a configuration document from a JSON file on disk.
    pub fn from_file(path: impl AsRef<Path>) -> CacheResult<Self> {
        let raw = fs::read_to_string(path.as_ref())
            .map_err(|e| CacheError::Config(format!("failed to read {:?}: {e}", path.as_ref())))?;
        serde_json::from_str(&raw).map_err(|e| CacheError::Config(format!("invalid config JSON: {e}")))
    }

    /// Save this configuration to disk as pretty-printed JSON.
    pub fn save(&self, path: impl AsRef<Path>) -> CacheResult<()> {
        let raw = serde_json::to_string_pretty(self)
            .map_err(|e| CacheError::Config(format!("failed to serialize config: {e}")))?;
        fs::write(path.as_ref(), raw)
            .map_err(|e| CacheError::Config(format!("failed to write {:?}: {e}", path.as_ref())))
    }
}

mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let millis = u64::deserialize(d)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_json() {
        let cfg = CacheConfig::default();
        let raw = serde_json::to_string(&cfg).unwrap();
        let back: CacheConfig = serde_json::from_str(&raw).unwrap();
        assert_eq!(cfg.l1.max_entries, back.l1.max_entries);
        assert_eq!(cfg.hybrid.key_prefix, back.hybrid.key_prefix);
    }

    #[test]
    fn defaults_are_sane() {
        let cfg = CacheConfig::default();
        assert!(cfg.l1.max_entries > 0);
        assert!(cfg.l1.default_ttl <= cfg.l1.max_ttl);
        assert_eq!(cfg.hybrid.l2_enabled, false);
    }
}
