//! Error types shared across the cache runtime.

use thiserror::Error;

/// Result alias used throughout the crate.
pub type CacheResult<T> = Result<T, CacheError>;

/// Errors raised by key generation, policy resolution, storage tiers,
/// stampede coordination, and the backplane.
#[derive(Error, Debug)]
pub enum CacheError {
    /// The requested key was not present in any tier.
    #[error("cache miss for key `{0}`")]
    Miss(String),

    /// The factory invoked to build a value failed.
    #[error("factory failed for key `{0}`: {1}")]
    FactoryFailed(String, String),

    /// Serialization or deserialization of a cached value failed.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// A backing storage provider (L2/L3) reported a failure.
    #[error("storage provider error: {0}")]
    Provider(String),

    /// The circuit breaker guarding a provider is open.
    #[error("circuit breaker open for provider `{0}`")]
    CircuitOpen(String),

    /// A policy could not be resolved for the given method/key shape.
    #[error("policy resolution error: {0}")]
    Policy(String),

    /// The tag index rejected an operation because its capacity budget
    /// was exceeded.
    #[error("tag index capacity exceeded: {0}")]
    TagBudgetExceeded(String),

    /// The backplane failed to publish or deliver an invalidation message.
    #[error("backplane error: {0}")]
    Backplane(String),

    /// A stampede-coordinated build was cancelled before completion.
    #[error("build cancelled for key `{0}`")]
    Cancelled(String),

    /// Configuration was invalid or could not be loaded.
    #[error("configuration error: {0}")]
    Config(String),

    /// Catch-all for conditions not covered by a more specific variant.
    #[error("{0}")]
    Other(String),
}

impl CacheError {
    /// True if the error represents a transient condition worth retrying
    /// (provider errors and an open circuit breaker); false for
    /// definitional errors like a bad policy or a cancelled build.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CacheError::Provider(_) | CacheError::CircuitOpen(_))
    }
}
