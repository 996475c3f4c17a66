//! Engine Configuration
//!
//! Every field has a default, so an empty YAML document is a valid config.
//!
//! ```yaml
//! sweep_interval_ms: 60000
//! default_stale_after_ms: 30000
//! default_evict_after_ms: 300000
//! default_strategy: stale-while-revalidate
//! retry:
//!   max_attempts: 3
//!   base_delay_ms: 1000
//! bridge:
//!   id_field: id
//!   dedup_capacity: 1024
//! key_classes:
//!   - pattern: "feed:*"
//!     stale_after_ms: 5000
//!     strategy: cache-first
//! ```
//!
//! Key classes are matched in order with the invalidation pattern syntax;
//! the first match wins and unset fields fall back to the defaults.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::cache::entry::EntryOptions;
use crate::cache::pattern::PatternMatcher;
use crate::error::{Error, Result};
use crate::query::coordinator::ReadStrategy;
use crate::query::retry::RetryPolicy;
use crate::realtime::bridge::BridgeConfig;

/// Top-level engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Interval between expiry sweeps
    pub sweep_interval_ms: u64,

    /// Staleness threshold for entries without a class policy
    pub default_stale_after_ms: u64,

    /// Eviction threshold for entries without a class policy
    pub default_evict_after_ms: u64,

    /// Read strategy when neither the call nor a class sets one
    pub default_strategy: ReadStrategy,

    /// Fetch retry policy
    pub retry: RetryPolicy,

    /// Push update handling
    pub bridge: BridgeConfig,

    /// Per key class overrides, first match wins
    pub key_classes: Vec<KeyClassPolicy>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sweep_interval_ms: 60_000,
            default_stale_after_ms: 30_000,
            default_evict_after_ms: 300_000,
            default_strategy: ReadStrategy::default(),
            retry: RetryPolicy::default(),
            bridge: BridgeConfig::default(),
            key_classes: Vec::new(),
        }
    }
}

impl EngineConfig {
    /// Parse and validate a YAML document.
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {}", path.display(), e)))?;
        Self::from_yaml_str(&raw)
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_default_strategy(mut self, strategy: ReadStrategy) -> Self {
        self.default_strategy = strategy;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_bridge(mut self, bridge: BridgeConfig) -> Self {
        self.bridge = bridge;
        self
    }

    pub fn with_key_class(mut self, class: KeyClassPolicy) -> Self {
        self.key_classes.push(class);
        self
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    /// Entry options for keys without a class policy.
    pub fn default_entry_options(&self) -> Result<EntryOptions> {
        EntryOptions::from_millis(self.default_stale_after_ms, self.default_evict_after_ms)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.sweep_interval_ms == 0 {
            return Err(Error::Config("sweep_interval_ms must be > 0".into()));
        }
        self.default_entry_options()?;
        self.retry.validate()?;
        self.bridge.validate()?;
        self.resolver().map(|_| ())
    }

    /// Compile key classes into a resolver.
    pub fn resolver(&self) -> Result<PolicyResolver> {
        let defaults = ResolvedPolicy {
            options: self.default_entry_options()?,
            strategy: self.default_strategy,
        };
        let classes = self
            .key_classes
            .iter()
            .map(|class| {
                let matcher = PatternMatcher::compile(&class.pattern)?;
                Ok((matcher, class.resolve(&defaults)?))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(PolicyResolver { defaults, classes })
    }

    /// Resolve the policy for one key. Prefer a cached `resolver()` on hot paths.
    pub fn policy_for(&self, key: &str) -> Result<ResolvedPolicy> {
        Ok(self.resolver()?.resolve(key))
    }
}

/// Overrides for keys matching `pattern`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyClassPolicy {
    pub pattern: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stale_after_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evict_after_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<ReadStrategy>,
}

impl KeyClassPolicy {
    pub fn new(pattern: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            stale_after_ms: None,
            evict_after_ms: None,
            strategy: None,
        }
    }

    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after_ms = Some(stale_after.as_millis() as u64);
        self
    }

    pub fn with_evict_after(mut self, evict_after: Duration) -> Self {
        self.evict_after_ms = Some(evict_after.as_millis() as u64);
        self
    }

    pub fn with_strategy(mut self, strategy: ReadStrategy) -> Self {
        self.strategy = Some(strategy);
        self
    }

    fn resolve(&self, defaults: &ResolvedPolicy) -> Result<ResolvedPolicy> {
        let stale_after = self
            .stale_after_ms
            .map(Duration::from_millis)
            .unwrap_or(defaults.options.stale_after);
        let evict_after = self
            .evict_after_ms
            .map(Duration::from_millis)
            .unwrap_or(defaults.options.evict_after);
        let options = EntryOptions::new(stale_after, evict_after).map_err(|e| {
            Error::Config(format!("key class '{}': {}", self.pattern, e))
        })?;
        Ok(ResolvedPolicy {
            options,
            strategy: self.strategy.unwrap_or(defaults.strategy),
        })
    }
}

/// Effective freshness options and strategy for a key.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResolvedPolicy {
    pub options: EntryOptions,
    pub strategy: ReadStrategy,
}

/// Key classes with pre-compiled matchers.
#[derive(Debug, Clone)]
pub struct PolicyResolver {
    defaults: ResolvedPolicy,
    classes: Vec<(PatternMatcher, ResolvedPolicy)>,
}

impl Default for PolicyResolver {
    fn default() -> Self {
        Self {
            defaults: ResolvedPolicy {
                options: EntryOptions::default(),
                strategy: ReadStrategy::default(),
            },
            classes: Vec::new(),
        }
    }
}

impl PolicyResolver {
    pub fn resolve(&self, key: &str) -> ResolvedPolicy {
        self.classes
            .iter()
            .find(|(matcher, _)| matcher.matches(key))
            .map(|(_, policy)| *policy)
            .unwrap_or(self.defaults)
    }

    pub fn defaults(&self) -> ResolvedPolicy {
        self.defaults
    }
}

// =============================================================================
// Tests
// =============================================================================
