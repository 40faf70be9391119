//! The hybrid L1/L2/L3 storage coordinator.
//!
//! Presents a single logical store over up to three tiers: L1 (always
//! present, in-process), and optional L2 (distributed) and L3
//! (persistent) tiers reached through the [`provider::StorageProvider`]
//! contract. Reads try tiers warm-to-cold and promote on a cold hit once
//! the key's observed access age clears `promotion_threshold`, so a
//! single one-shot read does not pollute L1. Writes always land in L1
//! synchronously; L2/L3 writes are synchronous or queued write-behind
//! per `async_l2_writes`/`async_l3_writes`, falling back to synchronous
//! for a given call when the bounded queue is full.

pub mod circuit_breaker;
pub mod provider;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::{de::DeserializeOwned, Serialize};
use tokio::sync::mpsc;

use crate::backplane::{is_self_originated, Backplane, MessageKind};
use crate::config::{HybridConfig, RetryConfig};
use crate::error::{CacheError, CacheResult};
use crate::keygen::CacheKey;
use crate::l1::L1Store;
use crate::tag_index::TagIndex;
use circuit_breaker::{Admission, CircuitBreaker, CircuitBreakerConfig};
use provider::StorageProvider;

struct WriteBehindJob {
    key: String,
    bytes: Vec<u8>,
    ttl: Duration,
    tags: Vec<String>,
}

struct TierHandle {
    provider: Arc<dyn StorageProvider>,
    circuit_breaker: CircuitBreaker,
    retry: RetryConfig,
    default_ttl: Duration,
    write_behind_tx: Option<mpsc::Sender<WriteBehindJob>>,
}

impl TierHandle {
    async fn get_with_retry(&self, key: &str) -> CacheResult<Option<Vec<u8>>> {
        if self.circuit_breaker.admit() == Admission::Blocked {
            return Err(CacheError::CircuitOpen(key.to_string()));
        }
        let result = with_retry(&self.retry, || self.provider.get(key)).await;
        self.circuit_breaker.record(result.is_ok());
        result
    }

    async fn remove_with_retry(&self, key: &str) -> CacheResult<()> {
        if self.circuit_breaker.admit() == Admission::Blocked {
            return Err(CacheError::CircuitOpen(key.to_string()));
        }
        let result = with_retry(&self.retry, || self.provider.remove(key)).await;
        self.circuit_breaker.record(result.is_ok());
        result
    }

    async fn remove_by_tag_with_retry(&self, tag: &str) -> CacheResult<()> {
        if self.circuit_breaker.admit() == Admission::Blocked {
            return Err(CacheError::CircuitOpen(tag.to_string()));
        }
        let result = with_retry(&self.retry, || self.provider.remove_by_tag(tag)).await;
        self.circuit_breaker.record(result.is_ok());
        result
    }

    async fn set_with_retry(&self, key: &str, bytes: Vec<u8>, ttl: Duration, tags: &[String]) -> CacheResult<()> {
        if self.circuit_breaker.admit() == Admission::Blocked {
            return Err(CacheError::CircuitOpen(key.to_string()));
        }
        let tags_owned = tags.to_vec();
        let result = with_retry(&self.retry, || self.provider.set(key, bytes.clone(), ttl, &tags_owned)).await;
        self.circuit_breaker.record(result.is_ok());
        result
    }
}

async fn with_retry<T, F, Fut>(retry: &RetryConfig, mut call: F) -> CacheResult<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = CacheResult<T>>,
{
    let mut delay = retry.base_delay;
    let mut attempt = 0;
    loop {
        match call().await {
            Ok(value) => return Ok(value),
            Err(error) if attempt < retry.max_retries && error.is_retryable() => {
                attempt += 1;
                tokio::time::sleep(delay).await;
                if retry.use_exponential_backoff {
                    delay = (delay * 2).min(retry.max_delay);
                }
            }
            Err(error) => return Err(error),
        }
    }
}

fn spawn_write_behind_worker(
    provider: Arc<dyn StorageProvider>,
    retry: RetryConfig,
    mut rx: mpsc::Receiver<WriteBehindJob>,
) {
    tokio::spawn(async move {
        while let Some(job) = rx.recv().await {
            let tags = job.tags.clone();
            let result = with_retry(&retry, || provider.set(&job.key, job.bytes.clone(), job.ttl, &tags)).await;
            if let Err(error) = result {
                log::warn!("write-behind flush for `{}` failed permanently: {error}", job.key);
            }
        }
    });
}

/// The hybrid storage coordinator.
pub struct HybridStore<V> {
    l1: Arc<L1Store<V>>,
    l2: Option<TierHandle>,
    l3: Option<TierHandle>,
    config: HybridConfig,
    tag_index: Arc<TagIndex>,
    backplane: Option<Arc<dyn Backplane>>,
    first_seen: DashMap<CacheKey, Instant>,
    degenerate_tag_cleanups: AtomicU64,
}

/// Builder gathering the pieces a [`HybridStore`] needs before it can be
/// constructed: the L1 store it always owns, and optionally an L2/L3
/// provider pair and a backplane for cross-process invalidation.
pub struct HybridStoreBuilder<V> {
    l1: Arc<L1Store<V>>,
    config: HybridConfig,
    tag_index: Arc<TagIndex>,
    l2_provider: Option<Arc<dyn StorageProvider>>,
    l3_provider: Option<Arc<dyn StorageProvider>>,
    backplane: Option<Arc<dyn Backplane>>,
}

impl<V> HybridStoreBuilder<V>
where
    V: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// Start building a hybrid store around an existing L1 instance.
    pub fn new(l1: Arc<L1Store<V>>, config: HybridConfig, tag_index: Arc<TagIndex>) -> Self {
        Self {
            l1,
            config,
            tag_index,
            l2_provider: None,
            l3_provider: None,
            backplane: None,
        }
    }

    /// Attach an L2 (distributed) provider.
    pub fn with_l2(mut self, provider: Arc<dyn StorageProvider>) -> Self {
        self.l2_provider = Some(provider);
        self
    }

    /// Attach an L3 (persistent) provider.
    pub fn with_l3(mut self, provider: Arc<dyn StorageProvider>) -> Self {
        self.l3_provider = Some(provider);
        self
    }

    /// Attach a backplane for cross-process invalidation.
    pub fn with_backplane(mut self, backplane: Arc<dyn Backplane>) -> Self {
        self.backplane = Some(backplane);
        self
    }

    /// Build the store, spawning write-behind workers for any tier
    /// configured for asynchronous writes.
    pub fn build(self) -> Arc<HybridStore<V>> {
        let l2 = self.l2_provider.filter(|_| self.config.l2_enabled).map(|provider| {
            build_tier_handle(provider, self.config.l2_retry.clone(), self.config.l2_default_ttl, self.config.async_l2_writes, self.config.async_write_queue_capacity)
        });
        let l3 = self.l3_provider.filter(|_| self.config.l3_enabled).map(|provider| {
            build_tier_handle(provider, self.config.l3_retry.clone(), self.config.l3_default_ttl, self.config.async_l3_writes, self.config.async_write_queue_capacity)
        });

        let store = Arc::new(HybridStore {
            l1: self.l1,
            l2,
            l3,
            config: self.config,
            tag_index: self.tag_index,
            backplane: self.backplane,
            first_seen: DashMap::new(),
            degenerate_tag_cleanups: AtomicU64::new(0),
        });

        if let Some(backplane) = &store.backplane {
            spawn_backplane_listener(store.clone(), backplane.clone());
        }

        store
    }
}

fn build_tier_handle(
    provider: Arc<dyn StorageProvider>,
    retry: RetryConfig,
    default_ttl: Duration,
    async_writes: bool,
    queue_capacity: usize,
) -> TierHandle {
    let write_behind_tx = if async_writes {
        let (tx, rx) = mpsc::channel(queue_capacity);
        spawn_write_behind_worker(provider.clone(), retry.clone(), rx);
        Some(tx)
    } else {
        None
    };

    TierHandle {
        provider,
        circuit_breaker: CircuitBreaker::new(CircuitBreakerConfig::default()),
        retry,
        default_ttl,
        write_behind_tx,
    }
}

fn spawn_backplane_listener<V>(store: Arc<HybridStore<V>>, backplane: Arc<dyn Backplane>)
where
    V: Send + Sync + 'static,
{
    tokio::spawn(async move {
        let mut subscription = backplane.subscribe();
        while let Some(message) = subscription.recv().await {
            if is_self_originated(&message, &store.config.instance_id) {
                continue;
            }
            match message.kind {
                MessageKind::Key => {
                    let key = CacheKey(message.payload);
                    store.l1.remove(&key);
                    store.tag_index.drop_key(&key);
                }
                MessageKind::Tag => {
                    let keys = store.tag_index.keys_for_tag(&message.payload);
                    for key in keys {
                        store.l1.remove(&key);
                        store.tag_index.drop_key(&key);
                    }
                }
                MessageKind::ClearAll => {
                    store.l1.clear();
                }
            }
        }
    });
}

impl<V> HybridStore<V>
where
    V: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    fn encode(&self, value: &V) -> CacheResult<Vec<u8>> {
        bincode::serialize(value).map_err(|e| CacheError::Serialization(e.to_string()))
    }

    fn decode(&self, bytes: &[u8]) -> CacheResult<V> {
        bincode::deserialize(bytes).map_err(|e| CacheError::Serialization(e.to_string()))
    }

    /// The key a remote (L2/L3) tier actually sees: this process's
    /// `key_prefix` joined to the generated key, so distinct processes
    /// sharing one backend never collide on bare keys.
    fn remote_key(&self, key: &CacheKey) -> String {
        format!("{}:{}", self.config.key_prefix, key.as_str())
    }

    /// Read path: L1, then L2, then L3, promoting a cold hit to the
    /// warmer tiers once it clears the promotion-age check.
    pub async fn get(&self, key: &CacheKey) -> CacheResult<Option<Arc<V>>> {
        if let Some(value) = self.l1.get(key) {
            return Ok(Some(value));
        }

        if let Some(l2) = &self.l2 {
            if let Some(bytes) = self.try_tier_get(l2, key).await {
                let value = self.decode(&bytes)?;
                let value = Arc::new(value);
                self.maybe_promote(key, &value, self.tag_index.tags_for_key(key));
                return Ok(Some(value));
            }
        }

        if let Some(l3) = &self.l3 {
            if let Some(bytes) = self.try_tier_get(l3, key).await {
                let value = self.decode(&bytes)?;
                let value = Arc::new(value);
                if self.config.enable_l3_promotion {
                    self.maybe_promote(key, &value, self.tag_index.tags_for_key(key));
                }
                return Ok(Some(value));
            }
        }

        Ok(None)
    }

    async fn try_tier_get(&self, tier: &TierHandle, key: &CacheKey) -> Option<Vec<u8>> {
        match tier.get_with_retry(&self.remote_key(key)).await {
            Ok(bytes) => bytes,
            Err(error) => {
                log::warn!("tier read for `{key}` degraded to next tier: {error}");
                None
            }
        }
    }

    fn maybe_promote(&self, key: &CacheKey, value: &Arc<V>, tags: Vec<String>) {
        let now = Instant::now();
        let first_seen = *self.first_seen.entry(key.clone()).or_insert(now);
        if now.duration_since(first_seen) < self.config.l3_promotion_threshold {
            return;
        }
        self.l1.set(key.clone(), (**value).clone(), self.config.l1_default_ttl, tags);
    }

    /// Write path: always write L1; write L2/L3 synchronously or
    /// enqueue write-behind, falling back to synchronous when the
    /// bounded queue is full.
    pub async fn set(&self, key: CacheKey, value: V, ttl: Duration, tags: Vec<String>) -> CacheResult<()> {
        self.l1.set(key.clone(), value.clone(), ttl, tags.clone());
        self.tag_index.associate(&key, &tags);

        let bytes = self.encode(&value)?;
        if let Some(l2) = &self.l2 {
            self.write_to_tier(l2, &key, bytes.clone(), ttl, &tags).await;
        }
        if let Some(l3) = &self.l3 {
            self.write_to_tier(l3, &key, bytes, ttl, &tags).await;
        }
        Ok(())
    }

    async fn write_to_tier(&self, tier: &TierHandle, key: &CacheKey, bytes: Vec<u8>, ttl: Duration, tags: &[String]) {
        let remote_key = self.remote_key(key);
        let ttl = if ttl.is_zero() { tier.default_ttl } else { ttl };
        if let Some(tx) = &tier.write_behind_tx {
            let job = WriteBehindJob {
                key: remote_key.clone(),
                bytes: bytes.clone(),
                ttl,
                tags: tags.to_vec(),
            };
            if tx.try_send(job).is_ok() {
                return;
            }
            log::warn!("write-behind queue full for `{key}`; falling back to synchronous write");
        }
        if let Err(error) = tier.set_with_retry(&remote_key, bytes, ttl, tags).await {
            log::warn!("synchronous tier write for `{key}` failed: {error}");
        }
    }

    /// Delete `key` from every enabled tier and publish the
    /// invalidation to the backplane, if one is configured.
    pub async fn remove(&self, key: &CacheKey) -> CacheResult<()> {
        self.l1.remove(key);
        self.tag_index.drop_key(key);

        let remote_key = self.remote_key(key);
        if let Some(l2) = &self.l2 {
            if let Err(error) = l2.remove_with_retry(&remote_key).await {
                log::warn!("L2 delete for `{key}` failed, not rolling back L1: {error}");
            }
        }
        if let Some(l3) = &self.l3 {
            if let Err(error) = l3.remove_with_retry(&remote_key).await {
                log::warn!("L3 delete for `{key}` failed, not rolling back L1: {error}");
            }
        }

        if self.config.enable_backplane {
            if let Some(backplane) = &self.backplane {
                backplane.publish_key(key.as_str()).await?;
            }
        }
        Ok(())
    }

    /// Invalidate every key associated with `tag`, across all tiers,
    /// then publish the tag invalidation to the backplane.
    pub async fn remove_by_tag(&self, tag: &str) -> CacheResult<Vec<CacheKey>> {
        let keys = if self.config.enable_efficient_l1_tag_invalidation {
            self.tag_index.keys_for_tag(tag)
        } else {
            self.l1.remove_by_tag(tag)
        };

        for key in &keys {
            self.l1.remove(key);
            self.tag_index.drop_key(key);
        }

        if keys.is_empty() {
            self.degenerate_tag_cleanups.fetch_add(1, Ordering::Relaxed);
        }

        if let Some(l2) = &self.l2 {
            if let Err(error) = l2.remove_by_tag_with_retry(tag).await {
                log::warn!("L2 tag invalidation for `{tag}` failed: {error}");
            }
        }
        if let Some(l3) = &self.l3 {
            if let Err(error) = l3.remove_by_tag_with_retry(tag).await {
                log::warn!("L3 tag invalidation for `{tag}` failed: {error}");
            }
        }

        if self.config.enable_backplane {
            if let Some(backplane) = &self.backplane {
                backplane.publish_tag(tag).await?;
            }
        }

        Ok(keys)
    }

    /// The L1 layer underlying this store, for callers (the cache
    /// manager facade, the refresh scheduler) that need direct L1
    /// access without going through the tiered read path.
    pub fn l1(&self) -> &Arc<L1Store<V>> {
        &self.l1
    }

    /// Count of `remove_by_tag` calls that matched zero keys — the
    /// degenerate case called out for eviction, tracked here too since
    /// it shares the same "no candidate, still must return" contract.
    pub fn degenerate_tag_cleanups(&self) -> u64 {
        self.degenerate_tag_cleanups.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::L1Config;

    fn key(s: &str) -> CacheKey {
        CacheKey(s.to_string())
    }

    fn store() -> Arc<HybridStore<String>> {
        let l1 = Arc::new(L1Store::new(L1Config::default()));
        let tag_index = Arc::new(TagIndex::new(1000));
        HybridStoreBuilder::new(l1, HybridConfig { enable_backplane: false, ..HybridConfig::default() }, tag_index).build()
    }

    #[tokio::test]
    async fn set_then_get_hits_l1() {
        let store = store();
        store.set(key("a"), "v".into(), Duration::from_secs(60), vec![]).await.unwrap();
        let got = store.get(&key("a")).await.unwrap();
        assert_eq!(got.map(|v| (*v).clone()), Some("v".to_string()));
    }

    #[tokio::test]
    async fn remove_clears_l1_and_tags() {
        let store = store();
        store.set(key("a"), "v".into(), Duration::from_secs(60), vec!["t".into()]).await.unwrap();
        store.remove(&key("a")).await.unwrap();
        assert!(store.get(&key("a")).await.unwrap().is_none());
        assert!(store.tag_index.tags_for_key(&key("a")).is_empty());
    }

    #[tokio::test]
    async fn remove_by_tag_removes_all_matching_keys() {
        let store = store();
        store.set(key("a"), "1".into(), Duration::from_secs(60), vec!["t".into()]).await.unwrap();
        store.set(key("b"), "2".into(), Duration::from_secs(60), vec!["t".into()]).await.unwrap();
        let removed = store.remove_by_tag("t").await.unwrap();
        assert_eq!(removed.len(), 2);
    }

    #[tokio::test]
    async fn degenerate_tag_cleanup_is_counted() {
        let store = store();
        store.remove_by_tag("nonexistent").await.unwrap();
        assert_eq!(store.degenerate_tag_cleanups(), 1);
    }
}
