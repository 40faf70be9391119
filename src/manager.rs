//! The public cache manager facade.
//!
//! [`CacheManager`] is the one type most callers interact with directly;
//! everything else in this crate is a component it wires together. A call
//! to [`CacheManager::get_or_create`] (or the method-oriented
//! [`CacheManager::get_or_create_by`]) flows through the pipeline in
//! order: key generation (`keygen`), policy resolution (`policy`), a
//! tiered read against the hybrid store (`hybrid`), single-flight/refresh
//! coordination on a miss (`stampede`, `refresh`), and tag bookkeeping
//! (`tag_index`) on a write. Invalidation (by key or by tag) additionally
//! reaches the cross-process backplane (`backplane`) when one is
//! configured.

use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::{de::DeserializeOwned, Serialize};
use tokio::sync::Semaphore;

use crate::backplane::Backplane;
use crate::config::CacheConfig;
use crate::error::CacheResult;
use crate::hybrid::provider::StorageProvider;
use crate::hybrid::{HybridStore, HybridStoreBuilder};
use crate::keygen::fast_hash::FastHashKeyGenerator;
use crate::keygen::{encode_args, CacheKey, KeyGenerator, ToKeyPart};
use crate::l1::L1Store;
use crate::policy::{self, PolicyDescriptor, PolicyRegistry, StampedeMode};
use crate::refresh::RefreshScheduler;
use crate::stampede::{should_probabilistically_refresh, StampedeCoordinator};
use crate::tag_index::TagIndex;

/// Default assumed factory build time for a key with no measured history
/// yet, used to seed the probabilistic early-refresh calculation before
/// this process has observed a real build for that key.
const DEFAULT_MEAN_BUILD_TIME: Duration = Duration::from_millis(50);

/// Gathers the pieces a [`CacheManager`] needs before it can be built: the
/// backing configuration, optional L2/L3 providers, an optional
/// backplane, and an optional non-default key generator.
pub struct CacheManagerBuilder<V> {
    config: CacheConfig,
    l2_provider: Option<Arc<dyn StorageProvider>>,
    l3_provider: Option<Arc<dyn StorageProvider>>,
    backplane: Option<Arc<dyn Backplane>>,
    key_generator: Option<Arc<dyn KeyGenerator + Send + Sync>>,
    _marker: PhantomData<V>,
}

impl<V> Default for CacheManagerBuilder<V>
where
    V: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<V> CacheManagerBuilder<V>
where
    V: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    /// Start building a manager under default configuration: L1 only, no
    /// L2/L3, the in-process backplane, fast-hash keys.
    pub fn new() -> Self {
        Self {
            config: CacheConfig::default(),
            l2_provider: None,
            l3_provider: None,
            backplane: None,
            key_generator: None,
            _marker: PhantomData,
        }
    }

    /// Replace the default configuration wholesale.
    pub fn with_config(mut self, config: CacheConfig) -> Self {
        self.config = config;
        self
    }

    /// Attach an L2 (distributed) storage provider and enable the L2 tier.
    pub fn with_l2(mut self, provider: Arc<dyn StorageProvider>) -> Self {
        self.l2_provider = Some(provider);
        self.config.hybrid.l2_enabled = true;
        self
    }

    /// Attach an L3 (persistent) storage provider and enable the L3 tier.
    pub fn with_l3(mut self, provider: Arc<dyn StorageProvider>) -> Self {
        self.l3_provider = Some(provider);
        self.config.hybrid.l3_enabled = true;
        self
    }

    /// Attach a backplane for cross-process invalidation.
    pub fn with_backplane(mut self, backplane: Arc<dyn Backplane>) -> Self {
        self.backplane = Some(backplane);
        self
    }

    /// Use a non-default key generator (human-readable or binary-compact,
    /// or a caller-supplied one) instead of the fast-hash default.
    pub fn with_key_generator(mut self, generator: Arc<dyn KeyGenerator + Send + Sync>) -> Self {
        self.key_generator = Some(generator);
        self
    }

    /// Assemble the manager, constructing the L1 store, the tag index,
    /// the hybrid coordinator (spawning its backplane listener and any
    /// write-behind workers), the stampede coordinator, and the shared
    /// refresh-ahead scheduler.
    pub fn build(self) -> CacheManager<V> {
        let l1 = Arc::new(L1Store::new(self.config.l1.clone()));
        let tag_index = Arc::new(TagIndex::new(self.config.hybrid.max_tag_mappings));

        let cleanup_handle = if self.config.l1.enable_background_cleanup {
            Some(spawn_cleanup_task(l1.clone(), self.config.l1.cleanup_interval))
        } else {
            None
        };

        let mut hybrid_builder = HybridStoreBuilder::new(l1, self.config.hybrid.clone(), tag_index);
        if let Some(l2) = self.l2_provider {
            hybrid_builder = hybrid_builder.with_l2(l2);
        }
        if let Some(l3) = self.l3_provider {
            hybrid_builder = hybrid_builder.with_l3(l3);
        }
        if let Some(backplane) = self.backplane {
            hybrid_builder = hybrid_builder.with_backplane(backplane);
        }
        let hybrid = hybrid_builder.build();

        let stampede = Arc::new(StampedeCoordinator::new());
        let refresh_permits = self
            .config
            .hybrid
            .max_concurrent_l2
            .max(self.config.hybrid.max_concurrent_l3)
            .max(1);
        let refresh_pool = Arc::new(Semaphore::new(refresh_permits));
        let refresh = Arc::new(RefreshScheduler::new(refresh_pool, stampede.clone()));

        let policy_registry = Arc::new(PolicyRegistry::new(self.config.policy_defaults.clone()));
        let key_generator = self
            .key_generator
            .unwrap_or_else(|| Arc::new(FastHashKeyGenerator::new()));

        CacheManager {
            hybrid,
            stampede,
            refresh,
            policy_registry,
            key_generator,
            build_times: DashMap::new(),
            cleanup_handle,
        }
    }
}

/// Number of expired entries reclaimed per cleanup tick, bounding how long
/// a single sweep can hold up the background task.
const CLEANUP_BATCH_SIZE: usize = 256;

/// How long [`CacheManager::shutdown`] waits for outstanding write-behind
/// and refresh-ahead work to drain before returning.
const SHUTDOWN_GRACE_PERIOD: Duration = Duration::from_millis(500);

fn spawn_cleanup_task<V: Send + Sync + 'static>(l1: Arc<L1Store<V>>, interval: Duration) -> tokio::task::AbortHandle {
    let handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let removed = l1.sweep_expired(CLEANUP_BATCH_SIZE);
            if removed > 0 {
                log::debug!("background cleanup reclaimed {removed} expired L1 entries");
            }
        }
    });
    handle.abort_handle()
}

/// The public facade over the whole cache runtime: key generation,
/// policy resolution, tiered storage, stampede protection, refresh-ahead
/// scheduling, and tag-based invalidation, under one type.
pub struct CacheManager<V> {
    hybrid: Arc<HybridStore<V>>,
    stampede: Arc<StampedeCoordinator<V>>,
    refresh: Arc<RefreshScheduler<V>>,
    policy_registry: Arc<PolicyRegistry>,
    key_generator: Arc<dyn KeyGenerator + Send + Sync>,
    build_times: DashMap<CacheKey, Duration>,
    cleanup_handle: Option<tokio::task::AbortHandle>,
}

impl<V> CacheManager<V>
where
    V: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    /// Start a [`CacheManagerBuilder`] under default configuration.
    pub fn builder() -> CacheManagerBuilder<V> {
        CacheManagerBuilder::new()
    }

    /// The policy registry backing this manager, for installing
    /// attribute/fluent/config-file/runtime layers.
    pub fn policy_registry(&self) -> &Arc<PolicyRegistry> {
        &self.policy_registry
    }

    /// Look up a key without ever invoking a factory; `None` on a miss in
    /// every enabled tier.
    pub async fn try_get(&self, key: &CacheKey) -> CacheResult<Option<Arc<V>>> {
        self.hybrid.get(key).await
    }

    /// Current L1 store statistics (hits, misses, evictions, entry count).
    pub fn l1_stats(&self) -> crate::l1::L1Stats {
        self.hybrid.l1().stats()
    }

    /// Generate a key for `method_id` and `args` under `policy`'s version,
    /// then behave as [`Self::get_or_create`]. `factory` must be callable
    /// more than once: it backs both the initial build on a miss and any
    /// later refresh-ahead rebuild, so it should be a repeatable call into
    /// the underlying method rather than a one-shot resource consumer.
    pub async fn get_or_create_by<F, Fut>(
        &self,
        method_id: &str,
        args: &[&dyn ToKeyPart],
        policy: PolicyDescriptor,
        factory: F,
    ) -> CacheResult<V>
    where
        F: Fn() -> Fut + Send + Sync + Clone + 'static,
        Fut: Future<Output = CacheResult<V>> + Send + 'static,
    {
        let parts = encode_args(args);
        let key = self.key_generator.generate(method_id, &parts, policy.version);
        let value = self.get_or_create(key, policy, factory).await?;
        Ok((*value).clone())
    }

    /// Read `key`, building and caching it under `policy` on a miss.
    /// Concurrent misses for the same key collapse to a single factory
    /// invocation unless `policy.stampede_mode` is
    /// [`StampedeMode::None`]. A hit close enough to expiry (per
    /// `policy.refresh_ahead_fraction`, or a probabilistic draw under
    /// [`StampedeMode::Probabilistic`]) schedules a background rebuild
    /// without delaying this read's return.
    pub async fn get_or_create<F, Fut>(&self, key: CacheKey, policy: PolicyDescriptor, factory: F) -> CacheResult<Arc<V>>
    where
        F: Fn() -> Fut + Send + Sync + Clone + 'static,
        Fut: Future<Output = CacheResult<V>> + Send + 'static,
    {
        policy::validate(&policy)?;

        if let Some(value) = self.hybrid.get(&key).await? {
            self.maybe_schedule_refresh(&key, &policy, factory);
            return Ok(value);
        }

        let duration = policy.duration;
        let tags = policy.tags.clone();

        let built = if policy.stampede_mode == StampedeMode::None {
            let start = Instant::now();
            let value = factory().await?;
            self.build_times.insert(key.clone(), start.elapsed());
            Arc::new(value)
        } else {
            let build_times = self.build_times.clone();
            let key_for_timing = key.clone();
            self.stampede
                .compute_once(&key, true, move || async move {
                    let start = Instant::now();
                    let result = factory().await;
                    if result.is_ok() {
                        build_times.insert(key_for_timing, start.elapsed());
                    }
                    result
                })
                .await?
        };

        self.hybrid.set(key, (*built).clone(), duration, tags).await?;
        Ok(built)
    }

    /// Invalidate every key tagged with any of `tags`, across every
    /// enabled tier, publishing each invalidation to the backplane if one
    /// is configured. Returns the union of keys actually removed.
    pub async fn invalidate_by_tags(&self, tags: &[&str]) -> CacheResult<Vec<CacheKey>> {
        let mut removed = Vec::new();
        for tag in tags {
            removed.extend(self.hybrid.remove_by_tag(tag).await?);
        }
        Ok(removed)
    }

    /// Remove a single key from every tier, publishing the invalidation to
    /// the backplane if one is configured.
    pub async fn invalidate(&self, key: &CacheKey) -> CacheResult<()> {
        self.hybrid.remove(key).await
    }

    /// Run [`Self::get_or_create`] for each `(key, policy, factory)`
    /// triple in order, collecting one result per request. Requests are
    /// awaited sequentially, not concurrently; callers needing
    /// parallelism should spawn their own tasks around individual calls.
    pub async fn get_or_create_bulk<F, Fut>(&self, requests: Vec<(CacheKey, PolicyDescriptor, F)>) -> Vec<CacheResult<Arc<V>>>
    where
        F: Fn() -> Fut + Send + Sync + Clone + 'static,
        Fut: Future<Output = CacheResult<V>> + Send + 'static,
    {
        let mut results = Vec::with_capacity(requests.len());
        for (key, policy, factory) in requests {
            results.push(self.get_or_create(key, policy, factory).await);
        }
        results
    }

    /// Run [`Self::invalidate_by_tags`] once per tag group in `groups`,
    /// collecting one result per group.
    pub async fn invalidate_by_tags_bulk(&self, groups: &[&[&str]]) -> Vec<CacheResult<Vec<CacheKey>>> {
        let mut results = Vec::with_capacity(groups.len());
        for tags in groups {
            results.push(self.invalidate_by_tags(tags).await);
        }
        results
    }

    /// Stop the background cleanup timer (if one is running) and give
    /// outstanding write-behind and refresh-ahead work a bounded grace
    /// period to finish before returning. Does not cancel in-flight
    /// stampede builds; those are detached and outlive any single caller
    /// by design.
    pub async fn shutdown(&self) {
        if let Some(handle) = &self.cleanup_handle {
            handle.abort();
        }
        tokio::time::sleep(SHUTDOWN_GRACE_PERIOD).await;
    }

    fn maybe_schedule_refresh<F, Fut>(&self, key: &CacheKey, policy: &PolicyDescriptor, factory: F)
    where
        F: Fn() -> Fut + Send + Sync + Clone + 'static,
        Fut: Future<Output = CacheResult<V>> + Send + 'static,
    {
        let Some(fraction) = policy.refresh_ahead_fraction else {
            return;
        };
        // Remaining TTL is only tracked for L1-resident entries; a hit
        // served purely from a colder tier has no local expiry clock to
        // schedule against, so refresh-ahead is skipped for it.
        let Some(remaining) = self.hybrid.l1().remaining_ttl(key) else {
            return;
        };

        let should_refresh = match policy.stampede_mode {
            StampedeMode::Probabilistic => {
                let mean_build_time = self
                    .build_times
                    .get(key)
                    .map(|entry| *entry)
                    .unwrap_or(DEFAULT_MEAN_BUILD_TIME);
                let draw: f64 = rand::random();
                should_probabilistically_refresh(policy.stampede_mode, draw, policy.probabilistic_beta, remaining, mean_build_time)
            }
            _ => RefreshScheduler::<V>::should_refresh(remaining, policy.duration, fraction),
        };

        if !should_refresh {
            return;
        }

        let hybrid = self.hybrid.clone();
        let duration = policy.duration;
        let tags = policy.tags.clone();
        let key_for_store = key.clone();
        let build_times = self.build_times.clone();
        let key_for_timing = key.clone();

        self.refresh.try_schedule(key.clone(), move || {
            let factory = factory.clone();
            let hybrid = hybrid.clone();
            let tags = tags.clone();
            let key_for_store = key_for_store.clone();
            let build_times = build_times.clone();
            let key_for_timing = key_for_timing.clone();
            async move {
                let start = Instant::now();
                let value = factory().await?;
                build_times.insert(key_for_timing, start.elapsed());
                // Persist the rebuilt value so the next read observes it;
                // `RefreshScheduler` only drives the single-flight build,
                // it does not know about storage.
                hybrid.set(key_for_store, value.clone(), duration, tags).await?;
                Ok(value)
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn manager() -> CacheManager<String> {
        CacheManager::<String>::builder().build()
    }

    #[tokio::test]
    async fn miss_then_hit_invokes_factory_once() {
        let cache = manager();
        let calls = Arc::new(AtomicUsize::new(0));

        let policy = PolicyDescriptor::new("Get").with_duration(Duration::from_secs(30));
        let key = crate::keygen::fast_hash::FastHashKeyGenerator::new().generate("Get", &[], 1);

        for _ in 0..3 {
            let calls = calls.clone();
            let value = cache
                .get_or_create(key.clone(), policy.clone(), move || {
                    let calls = calls.clone();
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Ok::<_, crate::error::CacheError>("built".to_string())
                    }
                })
                .await
                .unwrap();
            assert_eq!(*value, "built");
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn get_or_create_by_generates_stable_keys_for_same_args() {
        let cache = manager();
        let policy = PolicyDescriptor::new("GetUser").with_duration(Duration::from_secs(30));

        let first = cache
            .get_or_create_by("GetUser", &[&7i64], policy.clone(), || async {
                Ok::<_, crate::error::CacheError>("user-7".to_string())
            })
            .await
            .unwrap();
        let second = cache
            .get_or_create_by("GetUser", &[&7i64], policy, || async {
                Ok::<_, crate::error::CacheError>("different-build".to_string())
            })
            .await
            .unwrap();

        assert_eq!(first, "user-7");
        assert_eq!(second, "user-7");
    }

    #[tokio::test]
    async fn invalidate_by_tags_removes_tagged_entries() {
        let cache = manager();
        let policy = PolicyDescriptor::new("Get")
            .with_duration(Duration::from_secs(30))
            .with_tag("users");
        let key = crate::keygen::fast_hash::FastHashKeyGenerator::new().generate("Get", &[], 1);

        cache
            .get_or_create(key.clone(), policy, || async { Ok::<_, crate::error::CacheError>("v".to_string()) })
            .await
            .unwrap();
        assert!(cache.try_get(&key).await.unwrap().is_some());

        let removed = cache.invalidate_by_tags(&["users"]).await.unwrap();
        assert_eq!(removed, vec![key.clone()]);
        assert!(cache.try_get(&key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn stampede_mode_none_runs_factory_for_every_concurrent_miss() {
        let cache = Arc::new(manager());
        let calls = Arc::new(AtomicUsize::new(0));
        let policy = PolicyDescriptor::new("Get")
            .with_duration(Duration::from_secs(30))
            .with_stampede_mode(StampedeMode::None);
        let key = crate::keygen::fast_hash::FastHashKeyGenerator::new().generate("Get", &[], 1);

        let mut handles = Vec::new();
        for _ in 0..4 {
            let cache = cache.clone();
            let calls = calls.clone();
            let policy = policy.clone();
            let key = key.clone();
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_create(key, policy, move || {
                        let calls = calls.clone();
                        async move {
                            calls.fetch_add(1, Ordering::SeqCst);
                            Ok::<_, crate::error::CacheError>("v".to_string())
                        }
                    })
                    .await
            }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }

        assert!(calls.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test]
    async fn background_cleanup_reclaims_expired_entries_without_a_read() {
        let mut config = crate::config::CacheConfig::default();
        config.l1.enable_background_cleanup = true;
        config.l1.cleanup_interval = Duration::from_millis(20);
        let cache = CacheManager::<String>::builder().with_config(config).build();

        let policy = PolicyDescriptor::new("Get").with_duration(Duration::from_millis(1));
        let key = crate::keygen::fast_hash::FastHashKeyGenerator::new().generate("Get", &[], 1);
        cache
            .get_or_create(key.clone(), policy, || async { Ok::<_, crate::error::CacheError>("v".to_string()) })
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(cache.hybrid.l1().stats().entry_count, 0);

        cache.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_is_idempotent_with_cleanup_disabled() {
        let mut config = crate::config::CacheConfig::default();
        config.l1.enable_background_cleanup = false;
        let cache = CacheManager::<String>::builder().with_config(config).build();
        cache.shutdown().await;
        cache.shutdown().await;
    }
}
