//! Human-readable key generator: `"{method_id}:{value1}:{value2}:..."`,
//! useful for debugging and log correlation. Length is bounded; inputs
//! that would produce an overlong key have their tail truncated and
//! replaced with a hash of the truncated portion so the key stays
//! deterministic and collision-resistant even past the bound.

use xxhash_rust::xxh3::xxh3_64;

use super::{CacheKey, KeyGenerator, KeyPart};

/// Default maximum key length before truncate-and-hash kicks in.
pub const DEFAULT_MAX_LEN: usize = 200;

/// Generates keys as a colon-joined, human-legible rendering of the
/// method id, version, and each argument.
#[derive(Debug, Clone, Copy)]
pub struct HumanReadableKeyGenerator {
    max_len: usize,
}

impl Default for HumanReadableKeyGenerator {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_LEN)
    }
}

impl HumanReadableKeyGenerator {
    /// Construct a generator with a custom length bound.
    pub fn new(max_len: usize) -> Self {
        Self { max_len }
    }
}

impl KeyGenerator for HumanReadableKeyGenerator {
    fn generate(&self, method_id: &str, parts: &[KeyPart], version: u32) -> CacheKey {
        let mut rendered = String::from(method_id);
        rendered.push(':');
        rendered.push_str(&version.to_string());
        for part in parts {
            rendered.push(':');
            rendered.push_str(&part.render());
        }

        if rendered.len() <= self.max_len {
            return CacheKey(rendered);
        }

        let keep = self.max_len.saturating_sub(17); // room for "_" + 16 hex digits
        let mut truncated: String = rendered.chars().take(keep).collect();
        let digest = xxh3_64(rendered.as_bytes());
        truncated.push('_');
        truncated.push_str(&format!("{digest:016x}"));
        CacheKey(truncated)
    }
}
