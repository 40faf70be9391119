//! Bidirectional key/tag index used for surgical invalidation.
//!
//! Two concurrent maps — tag → key set and key → tag set — kept mutually
//! consistent: every `(key, tag)` pair appears in both or neither. The
//! total pair count is bounded by `max_tag_mappings`; once the budget is
//! reached, new associations for a call are dropped with a warning
//! rather than failing the call, since correctness (no incorrect hits)
//! is preserved even when a tag can no longer surgically invalidate
//! everything it should.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};

use dashmap::DashMap;

use crate::keygen::CacheKey;

/// Bidirectional tag/key index.
///
/// `tag_to_keys` and `keys_to_tags` are independent `DashMap`s, each
/// internally sharded, giving per-tag/per-key lock granularity without a
/// single coarse lock over the whole index.
pub struct TagIndex {
    tag_to_keys: DashMap<String, HashSet<CacheKey>>,
    keys_to_tags: DashMap<CacheKey, HashSet<String>>,
    mapping_count: AtomicUsize,
    max_mappings: usize,
}

/// Outcome of an `associate` call, distinguishing a full success from a
/// partial one where the budget was hit partway through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AssociateOutcome {
    /// Number of `(key, tag)` pairs actually recorded.
    pub associated: usize,
    /// Number of tags dropped because `max_tag_mappings` was reached.
    pub dropped: usize,
}

impl TagIndex {
    /// Construct an empty index with the given total-mapping budget.
    pub fn new(max_mappings: usize) -> Self {
        Self {
            tag_to_keys: DashMap::new(),
            keys_to_tags: DashMap::new(),
            mapping_count: AtomicUsize::new(0),
            max_mappings,
        }
    }

    /// Current count of `(key, tag)` pairs tracked by the index.
    pub fn mapping_count(&self) -> usize {
        self.mapping_count.load(Ordering::Relaxed)
    }

    /// Associate `key` with each tag in `tags`. Stops adding new pairs
    /// once the configured budget is reached; tags already associated
    /// with `key` are idempotent and do not consume budget.
    pub fn associate(&self, key: &CacheKey, tags: &[String]) -> AssociateOutcome {
        let mut associated = 0;
        let mut dropped = 0;

        for tag in tags {
            let mut key_entry = self.keys_to_tags.entry(key.clone()).or_default();
            if key_entry.contains(tag) {
                continue;
            }

            if self.mapping_count.load(Ordering::Relaxed) >= self.max_mappings {
                dropped += 1;
                log::warn!(
                    "tag index capacity ({}) reached; dropping association of key `{}` with tag `{}`",
                    self.max_mappings,
                    key,
                    tag
                );
                continue;
            }

            key_entry.insert(tag.clone());
            self.tag_to_keys.entry(tag.clone()).or_default().insert(key.clone());
            self.mapping_count.fetch_add(1, Ordering::Relaxed);
            associated += 1;
        }

        AssociateOutcome { associated, dropped }
    }

    /// Remove the association between `key` and each tag in `tags`, if
    /// present. Releases the tag's bucket entirely once its last key is
    /// removed, re-checking under the bucket's own lock to avoid a
    /// check-then-remove race against a concurrent `associate`.
    pub fn dissociate(&self, key: &CacheKey, tags: &[String]) {
        for tag in tags {
            let mut removed = false;
            if let Some(mut key_entry) = self.keys_to_tags.get_mut(key) {
                if key_entry.remove(tag) {
                    removed = true;
                }
            }
            if !removed {
                continue;
            }
            self.mapping_count.fetch_sub(1, Ordering::Relaxed);

            if let Some(mut bucket) = self.tag_to_keys.get_mut(tag) {
                bucket.remove(key);
                let is_empty = bucket.is_empty();
                drop(bucket);
                if is_empty {
                    // Re-check under `remove_if` so a concurrent associate
                    // that repopulated the bucket between the drop above
                    // and this call is not clobbered.
                    self.tag_to_keys.remove_if(tag, |_, keys| keys.is_empty());
                }
            }
        }
        if let Some(key_entry) = self.keys_to_tags.get(key) {
            if key_entry.is_empty() {
                drop(key_entry);
                self.keys_to_tags.remove_if(key, |_, tags| tags.is_empty());
            }
        }
    }

    /// All keys currently associated with `tag`.
    pub fn keys_for_tag(&self, tag: &str) -> Vec<CacheKey> {
        self.tag_to_keys
            .get(tag)
            .map(|bucket| bucket.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// All tags currently associated with `key`.
    pub fn tags_for_key(&self, key: &CacheKey) -> Vec<String> {
        self.keys_to_tags
            .get(key)
            .map(|bucket| bucket.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Remove every association for `key`, across all of its tags.
    pub fn drop_key(&self, key: &CacheKey) {
        let tags = self.tags_for_key(key);
        self.dissociate(key, &tags);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(s: &str) -> CacheKey {
        crate::keygen::fast_hash::FastHashKeyGenerator::new()
            .generate(s, &[], 1)
    }

    use crate::keygen::KeyGenerator;

    #[test]
    fn associate_and_lookup_both_directions() {
        let index = TagIndex::new(1000);
        let k = key("Get_1");
        index.associate(&k, &["a".into(), "b".into()]);
        assert_eq!(index.keys_for_tag("a"), vec![k.clone()]);
        let mut tags = index.tags_for_key(&k);
        tags.sort();
        assert_eq!(tags, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn dissociate_releases_empty_tag_bucket() {
        let index = TagIndex::new(1000);
        let k = key("Get_1");
        index.associate(&k, &["a".into()]);
        index.dissociate(&k, &["a".into()]);
        assert!(index.keys_for_tag("a").is_empty());
        assert_eq!(index.mapping_count(), 0);
    }

    #[test]
    fn drop_key_removes_all_its_tags() {
        let index = TagIndex::new(1000);
        let k = key("Get_1");
        index.associate(&k, &["a".into(), "b".into()]);
        index.drop_key(&k);
        assert!(index.tags_for_key(&k).is_empty());
        assert!(index.keys_for_tag("a").is_empty());
        assert!(index.keys_for_tag("b").is_empty());
    }

    #[test]
    fn budget_exceeded_drops_and_reports() {
        let index = TagIndex::new(1);
        let k1 = key("Get_1");
        let k2 = key("Get_2");
        let outcome1 = index.associate(&k1, &["a".into()]);
        assert_eq!(outcome1, AssociateOutcome { associated: 1, dropped: 0 });
        let outcome2 = index.associate(&k2, &["b".into()]);
        assert_eq!(outcome2, AssociateOutcome { associated: 0, dropped: 1 });
        // correctness preserved: k1 still resolves correctly, no phantom hit for k2
        assert_eq!(index.keys_for_tag("a"), vec![k1]);
        assert!(index.keys_for_tag("b").is_empty());
    }

    #[test]
    fn mutual_consistency_invariant() {
        let index = TagIndex::new(1000);
        let k = key("Get_1");
        index.associate(&k, &["a".into(), "b".into()]);
        for tag in index.tags_for_key(&k) {
            assert!(index.keys_for_tag(&tag).contains(&k));
        }
    }
}
