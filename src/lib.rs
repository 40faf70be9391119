//! # tiercache
//!
//! A method-result cache runtime: an in-process L1 store with policy-driven
//! eviction and statistics, a hybrid L1/L2/L3 storage coordinator with
//! asynchronous promotion/demotion and a pub/sub backplane, a key-generation
//! and runtime-policy resolution pipeline, stampede-prevention and
//! refresh-ahead machinery, and a tag-based invalidation index.
//!
//! ## Architecture
//!
//! - `keygen`: deterministic, collision-resistant cache key generation
//! - `policy`: runtime policy descriptors, merged from layered sources
//! - `tag_index`: bidirectional key/tag mapping for surgical invalidation
//! - `l1`: the in-process memory store, with pluggable eviction policies
//! - `stampede`: at-most-one-build-per-key coordination
//! - `refresh`: background refresh-ahead scheduling
//! - `hybrid`: the L1/L2/L3 storage coordinator and provider contract
//! - `backplane`: cross-process invalidation pub/sub
//! - `manager`: the public facade (`CacheManager`) tying the above together
//!
//! ## Quick start
//!
//! ```no_run
//! use std::time::Duration;
//! use tiercache::manager::CacheManager;
//! use tiercache::policy::{PolicyDescriptor, StampedeMode};
//!
//! # async fn example() -> tiercache::error::CacheResult<()> {
//! let cache = CacheManager::<String>::builder()
//!     .build();
//!
//! let policy = PolicyDescriptor::new("GetUser")
//!     .with_duration(Duration::from_secs(30))
//!     .with_stampede_mode(StampedeMode::SingleFlight);
//!
//! let value = cache
//!     .get_or_create_by("GetUser", &[&7i64], policy, || async {
//!         Ok::<_, tiercache::error::CacheError>("user-7".to_string())
//!     })
//!     .await?;
//! assert_eq!(value, "user-7");
//! # Ok(())
//! # }
//! ```
//!
//! ## Thread safety
//!
//! All public types are `Send + Sync` and designed for a preemptive,
//! multithreaded runtime; suspension happens only at factory invocation,
//! backplane publish, and remote-tier I/O, per the crate's concurrency
//! model (see `DESIGN.md`).

#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]

/// Crate-wide error types
pub mod error;

/// Configuration surface for L1, hybrid storage, and policy defaults
pub mod config;

/// Deterministic cache key generation (C1)
pub mod keygen;

/// Runtime policy descriptors and the layered policy registry (C2)
pub mod policy;

/// Bidirectional tag/key index for surgical invalidation (C3)
pub mod tag_index;

/// The in-process L1 memory store and its eviction policies (C4)
pub mod l1;

/// At-most-one-build-per-key stampede coordination (C5)
pub mod stampede;

/// Background refresh-ahead scheduling (C6)
pub mod refresh;

/// The hybrid L1/L2/L3 storage coordinator and the provider contract (C7)
pub mod hybrid;

/// Cross-process invalidation pub/sub (C8)
pub mod backplane;

/// The public cache manager facade and fluent builder (C9)
pub mod manager;

pub use error::{CacheError, CacheResult};
pub use keygen::CacheKey;
pub use manager::CacheManager;
pub use policy::{PolicyDescriptor, StampedeMode};

/// Crate version, re-exported for diagnostics and compatibility checks.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Crate name, re-exported for diagnostics.
pub const NAME: &str = env!("CARGO_PKG_NAME");
