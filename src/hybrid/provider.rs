//! The storage-provider contract for remote (L2) and persistent (L3)
//! tiers. Concrete providers (a Redis client, an on-disk store, ...) are
//! out of scope here; this crate ships the contract and an in-memory
//! reference implementation used by tests and as a drop-in L2/L3 during
//! development.

use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;

use crate::error::CacheResult;

/// A byte-oriented backing store behind the hybrid manager. Every method
/// operates on raw bytes; the hybrid manager owns encoding/decoding the
/// cached value type.
#[async_trait]
pub trait StorageProvider: Send + Sync {
    /// Fetch the bytes stored under `key`, or `None` on a miss.
    async fn get(&self, key: &str) -> CacheResult<Option<Vec<u8>>>;

    /// Store `value` under `key`, tagged with `tags`, expiring after
    /// `ttl`.
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration, tags: &[String]) -> CacheResult<()>;

    /// Remove `key`, if present.
    async fn remove(&self, key: &str) -> CacheResult<()>;

    /// Remove every key associated with `tag`. Providers that cannot
    /// delete atomically should document the non-atomic fallback they
    /// use internally; callers only see the aggregate success/failure.
    async fn remove_by_tag(&self, tag: &str) -> CacheResult<()>;

    /// Whether `key` is present, without fetching its value.
    async fn exists(&self, key: &str) -> CacheResult<bool>;

    /// Lightweight liveness check used by the circuit breaker and
    /// health endpoints; should not perform a full round trip of real
    /// cache traffic.
    async fn health(&self) -> CacheResult<()>;
}

struct StoredValue {
    bytes: Vec<u8>,
    tags: Vec<String>,
    expires_at: std::time::Instant,
}

/// An in-memory [`StorageProvider`], useful as an L2/L3 stand-in for
/// tests and local development. Never durable across process restarts.
#[derive(Default)]
pub struct InMemoryProvider {
    table: DashMap<String, StoredValue>,
}

impl InMemoryProvider {
    /// Construct an empty in-memory provider.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StorageProvider for InMemoryProvider {
    async fn get(&self, key: &str) -> CacheResult<Option<Vec<u8>>> {
        match self.table.get(key) {
            Some(entry) if entry.expires_at > std::time::Instant::now() => Ok(Some(entry.bytes.clone())),
            Some(_) => {
                self.table.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration, tags: &[String]) -> CacheResult<()> {
        self.table.insert(
            key.to_string(),
            StoredValue {
                bytes: value,
                tags: tags.to_vec(),
                expires_at: std::time::Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn remove(&self, key: &str) -> CacheResult<()> {
        self.table.remove(key);
        Ok(())
    }

    async fn remove_by_tag(&self, tag: &str) -> CacheResult<()> {
        let matching: Vec<String> = self
            .table
            .iter()
            .filter(|r| r.value().tags.iter().any(|t| t == tag))
            .map(|r| r.key().clone())
            .collect();
        for key in matching {
            self.table.remove(&key);
        }
        Ok(())
    }

    async fn exists(&self, key: &str) -> CacheResult<bool> {
        Ok(self.get(key).await?.is_some())
    }

    async fn health(&self) -> CacheResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_then_get_round_trips() {
        let provider = InMemoryProvider::new();
        provider.set("k", b"v".to_vec(), Duration::from_secs(60), &[]).await.unwrap();
        assert_eq!(provider.get("k").await.unwrap(), Some(b"v".to_vec()));
    }

    #[tokio::test]
    async fn remove_by_tag_removes_matching_keys_only() {
        let provider = InMemoryProvider::new();
        provider.set("a", b"1".to_vec(), Duration::from_secs(60), &["t".into()]).await.unwrap();
        provider.set("b", b"2".to_vec(), Duration::from_secs(60), &["other".into()]).await.unwrap();
        provider.remove_by_tag("t").await.unwrap();
        assert_eq!(provider.get("a").await.unwrap(), None);
        assert_eq!(provider.get("b").await.unwrap(), Some(b"2".to_vec()));
    }
}
