//! Runtime policy descriptors and the layered policy registry.
//!
//! A [`PolicyDescriptor`] carries everything C1 (key generation) and C7
//! (hybrid storage) need to treat one cached method correctly: its
//! duration, tag templates, stampede-protection mode, and version. The
//! [`PolicyRegistry`] resolves a descriptor for a method id by merging
//! four layers in ascending precedence — compile-time attributes,
//! startup fluent configuration, configuration files, and runtime
//! overrides — and exposes a wait-free read path: every resolution reads
//! a single `Arc` snapshot, so a concurrent reload never blocks a reader
//! or hands back a torn mix of old and new fields.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::Lazy;
use parking_lot::RwLock;
use regex::Regex;
use tokio::sync::broadcast;

use crate::error::{CacheError, CacheResult};

/// Method ids must look like a dotted/namespaced identifier — this is
/// also what a `keygen` generator's output is keyed on, so a malformed id
/// here would otherwise surface only much later as a confusing key
/// collision or an unreadable human-readable key.
static METHOD_ID_PATTERN: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z0-9_.:-]{1,256}$").expect("static pattern is valid"));

/// Stampede-protection strategy applied on a cache miss.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum StampedeMode {
    /// No coordination; every concurrent miss invokes the factory.
    None,
    /// At most one concurrent build per key; other callers wait for it.
    SingleFlight,
    /// Single-flight plus probabilistic early refresh ahead of expiry.
    Probabilistic,
    /// Coordination is handed off to a distributed lock on L2.
    DistributedLock,
}

/// The layer a field in a resolved [`PolicyDescriptor`] was sourced from,
/// returned alongside the descriptor so callers (and tests) can verify
/// precedence was applied as documented.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provenance {
    /// No layer set this method id at all; pure defaults were used.
    Default,
    /// Set by a compile-time attribute layer.
    Attribute,
    /// Set by startup fluent configuration.
    FluentConfig,
    /// Set by a loaded configuration file.
    ConfigFile,
    /// Set by a runtime override applied after startup.
    RuntimeOverride,
}

/// Per-call policy for one cached method. Every field is optional at the
/// per-layer level (see [`PolicyLayer`]); this type is the fully resolved
/// result after merge and always has concrete values.
#[derive(Debug, Clone)]
pub struct PolicyDescriptor {
    /// Identifies the cached method this policy governs.
    pub method_id: String,
    /// How long a value stays fresh after being cached.
    pub duration: Duration,
    /// If set, a read within this window of expiration slides the
    /// expiration forward instead of leaving it untouched.
    pub sliding_extension: Option<Duration>,
    /// Fraction of `duration` (0.0-1.0) remaining at which a background
    /// refresh is scheduled; `None` disables refresh-ahead.
    pub refresh_ahead_fraction: Option<f64>,
    /// Tag templates applied to every entry generated under this policy.
    /// Unioned across layers, never replaced, so a default/group tag
    /// cannot be silently dropped by a higher-precedence layer.
    pub tags: Vec<String>,
    /// Incorporated into every generated key; bumping it invalidates
    /// every key generated under the prior version.
    pub version: u32,
    /// Stampede-protection strategy for this method.
    pub stampede_mode: StampedeMode,
    /// Beta coefficient for probabilistic early refresh, per
    /// `p = exp(-beta * remaining_ttl / mean_build_time)`.
    pub probabilistic_beta: f64,
    /// Free-form metadata carried alongside the descriptor (e.g. for
    /// metrics tagging or event hooks set by the fluent builder).
    pub metadata: HashMap<String, String>,
}

impl PolicyDescriptor {
    /// Start building a policy descriptor for `method_id`, seeded with
    /// crate defaults.
    pub fn new(method_id: impl Into<String>) -> Self {
        Self {
            method_id: method_id.into(),
            duration: Duration::from_secs(300),
            sliding_extension: None,
            refresh_ahead_fraction: None,
            tags: Vec::new(),
            version: 1,
            stampede_mode: StampedeMode::SingleFlight,
            probabilistic_beta: 1.0,
            metadata: HashMap::new(),
        }
    }

    /// Set the cache duration.
    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = duration;
        self
    }

    /// Set the sliding expiration extension.
    pub fn with_sliding_extension(mut self, extension: Duration) -> Self {
        self.sliding_extension = Some(extension);
        self
    }

    /// Set the refresh-ahead threshold as a fraction of `duration`.
    pub fn with_refresh_ahead(mut self, fraction: f64) -> Self {
        self.refresh_ahead_fraction = Some(fraction);
        self
    }

    /// Add a tag template, unioned with any existing tags.
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    /// Set the policy version.
    pub fn with_version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    /// Set the stampede-protection mode.
    pub fn with_stampede_mode(mut self, mode: StampedeMode) -> Self {
        self.stampede_mode = mode;
        self
    }
}

/// A partial policy, as supplied by one precedence layer. `None` fields
/// fall through to the next lower-precedence layer (or the hardcoded
/// default if no layer sets them); `tags` is always unioned regardless
/// of precedence.
#[derive(Debug, Clone, Default)]
pub struct PolicyLayer {
    /// Overridden duration, if this layer sets one.
    pub duration: Option<Duration>,
    /// Overridden sliding extension, if this layer sets one.
    pub sliding_extension: Option<Duration>,
    /// Overridden refresh-ahead fraction, if this layer sets one.
    pub refresh_ahead_fraction: Option<f64>,
    /// Tags contributed by this layer; unioned with every other layer's.
    pub tags: Vec<String>,
    /// Overridden version, if this layer sets one.
    pub version: Option<u32>,
    /// Overridden stampede mode, if this layer sets one.
    pub stampede_mode: Option<StampedeMode>,
    /// Overridden probabilistic beta, if this layer sets one.
    pub probabilistic_beta: Option<f64>,
    /// Metadata entries contributed by this layer; merged key-wise with
    /// higher-precedence layers winning on collision.
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Default, Clone)]
struct MethodLayers {
    attribute: Option<PolicyLayer>,
    fluent: Option<PolicyLayer>,
    config_file: Option<PolicyLayer>,
    runtime_override: Option<PolicyLayer>,
}

impl MethodLayers {
    fn resolve(&self, method_id: &str) -> (PolicyDescriptor, Provenance) {
        let mut resolved = PolicyDescriptor::new(method_id);
        let mut provenance = Provenance::Default;

        let ordered = [
            (&self.attribute, Provenance::Attribute),
            (&self.fluent, Provenance::FluentConfig),
            (&self.config_file, Provenance::ConfigFile),
            (&self.runtime_override, Provenance::RuntimeOverride),
        ];

        for (layer, layer_provenance) in ordered {
            let Some(layer) = layer else { continue };
            if let Some(d) = layer.duration {
                resolved.duration = d;
                provenance = layer_provenance;
            }
            if let Some(s) = layer.sliding_extension {
                resolved.sliding_extension = Some(s);
                provenance = layer_provenance;
            }
            if let Some(r) = layer.refresh_ahead_fraction {
                resolved.refresh_ahead_fraction = Some(r);
                provenance = layer_provenance;
            }
            if let Some(v) = layer.version {
                resolved.version = v;
                provenance = layer_provenance;
            }
            if let Some(m) = layer.stampede_mode {
                resolved.stampede_mode = m;
                provenance = layer_provenance;
            }
            if let Some(b) = layer.probabilistic_beta {
                resolved.probabilistic_beta = b;
                provenance = layer_provenance;
            }
            for tag in &layer.tags {
                if !resolved.tags.contains(tag) {
                    resolved.tags.push(tag.clone());
                }
            }
            for (k, v) in &layer.metadata {
                resolved.metadata.insert(k.clone(), v.clone());
            }
        }

        (resolved, provenance)
    }
}

#[derive(Debug, Clone)]
struct RegistrySnapshot {
    methods: HashMap<String, MethodLayers>,
}

/// Change notification delivered to subscribers after a resolution for
/// `method_id` changes as a result of an `upsert`.
#[derive(Debug, Clone)]
pub struct PolicyChange {
    /// The method id whose resolved policy changed.
    pub method_id: String,
}

/// Resolves, stores, and hot-reloads per-method policy descriptors.
///
/// Reads take a single atomic `Arc` clone of the current snapshot and
/// never block on a concurrent writer; writers build a new snapshot and
/// swap the pointer, so readers mid-resolution see either the entire old
/// snapshot or the entire new one, never a torn mix.
pub struct PolicyRegistry {
    snapshot: RwLock<Arc<RegistrySnapshot>>,
    defaults: crate::config::PolicyDefaults,
    change_tx: broadcast::Sender<PolicyChange>,
}

impl PolicyRegistry {
    /// Construct a registry seeded with the given default layer values
    /// and no per-method overrides.
    pub fn new(defaults: crate::config::PolicyDefaults) -> Self {
        let (change_tx, _) = broadcast::channel(256);
        Self {
            snapshot: RwLock::new(Arc::new(RegistrySnapshot {
                methods: HashMap::new(),
            })),
            defaults,
            change_tx,
        }
    }

    /// Resolve the effective policy for `method_id`, returning the
    /// descriptor along with which layer determined its most
    /// precedence-significant field.
    pub fn get_policy(&self, method_id: &str) -> (PolicyDescriptor, Provenance) {
        let snapshot = self.snapshot.read().clone();
        match snapshot.methods.get(method_id) {
            Some(layers) => layers.resolve(method_id),
            None => {
                let mut defaulted = PolicyDescriptor::new(method_id);
                defaulted.duration = self.defaults.duration;
                defaulted.refresh_ahead_fraction = self.defaults.refresh_ahead_fraction;
                defaulted.stampede_mode = self.defaults.stampede_mode;
                defaulted.probabilistic_beta = self.defaults.probabilistic_beta;
                defaulted.version = self.defaults.version;
                (defaulted, Provenance::Default)
            }
        }
    }

    /// Install or replace a layer for `method_id` at a given precedence
    /// tier, then atomically publish a new snapshot and notify
    /// subscribers.
    pub fn upsert(&self, method_id: &str, tier: PrecedenceTier, layer: PolicyLayer) {
        let mut guard = self.snapshot.write();
        let mut methods = guard.methods.clone();
        let entry = methods.entry(method_id.to_string()).or_default();
        match tier {
            PrecedenceTier::Attribute => entry.attribute = Some(layer),
            PrecedenceTier::FluentConfig => entry.fluent = Some(layer),
            PrecedenceTier::ConfigFile => entry.config_file = Some(layer),
            PrecedenceTier::RuntimeOverride => entry.runtime_override = Some(layer),
        }
        *guard = Arc::new(RegistrySnapshot { methods });
        drop(guard);

        let _ = self.change_tx.send(PolicyChange {
            method_id: method_id.to_string(),
        });
    }

    /// Subscribe to policy change notifications. Delivery is
    /// asynchronous and best-effort: a slow subscriber may miss
    /// notifications once the broadcast channel's buffer fills, per
    /// `tokio::sync::broadcast` semantics.
    pub fn subscribe(&self) -> broadcast::Receiver<PolicyChange> {
        self.change_tx.subscribe()
    }
}

/// Which precedence layer an `upsert` targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrecedenceTier {
    /// Lowest precedence: compile-time attributes.
    Attribute,
    /// Startup fluent configuration.
    FluentConfig,
    /// Loaded configuration files.
    ConfigFile,
    /// Highest precedence: runtime overrides.
    RuntimeOverride,
}

/// Validate that a descriptor is internally consistent before it is used
/// to drive caching decisions (e.g. from a fluent builder's `execute`).
pub fn validate(descriptor: &PolicyDescriptor) -> CacheResult<()> {
    if !METHOD_ID_PATTERN.is_match(&descriptor.method_id) {
        return Err(CacheError::Policy(format!(
            "method id `{}` does not match the required pattern {}",
            descriptor.method_id,
            METHOD_ID_PATTERN.as_str()
        )));
    }
    if descriptor.duration.is_zero() {
        return Err(CacheError::Policy(format!(
            "policy for `{}` has zero duration",
            descriptor.method_id
        )));
    }
    if let Some(f) = descriptor.refresh_ahead_fraction {
        if !(0.0..1.0).contains(&f) {
            return Err(CacheError::Policy(format!(
                "policy for `{}` has refresh_ahead_fraction {f} outside [0, 1)",
                descriptor.method_id
            )));
        }
    }
    Ok(())
}
