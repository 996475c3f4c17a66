//! Cache Entry Types
//!
//! One entry per key, carrying the data plus the freshness bookkeeping used
//! for staleness decisions and the expiry sweep.

use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::time::Instant;

use crate::error::{Error, Result};

/// Default duration before an entry is considered stale (30s)
pub const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(30);

/// Default duration before the sweep removes an entry (5 minutes)
pub const DEFAULT_EVICT_AFTER: Duration = Duration::from_secs(300);

/// Freshness options attached to every write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryOptions {
    /// Age after which a read should trigger a refresh
    pub stale_after: Duration,
    /// Age after which the sweep removes the entry
    pub evict_after: Duration,
}

impl Default for EntryOptions {
    fn default() -> Self {
        Self {
            stale_after: DEFAULT_STALE_AFTER,
            evict_after: DEFAULT_EVICT_AFTER,
        }
    }
}

impl EntryOptions {
    /// Create validated options.
    pub fn new(stale_after: Duration, evict_after: Duration) -> Result<Self> {
        let options = Self {
            stale_after,
            evict_after,
        };
        options.validate()?;
        Ok(options)
    }

    /// Options from millisecond values.
    pub fn from_millis(stale_after_ms: u64, evict_after_ms: u64) -> Result<Self> {
        Self::new(
            Duration::from_millis(stale_after_ms),
            Duration::from_millis(evict_after_ms),
        )
    }

    /// An entry cannot be evicted before it is stale.
    pub fn validate(&self) -> Result<()> {
        if self.evict_after < self.stale_after {
            return Err(Error::InvalidOptions(format!(
                "evict_after ({:?}) must be >= stale_after ({:?})",
                self.evict_after, self.stale_after
            )));
        }
        Ok(())
    }
}

/// A cached value with its bookkeeping.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    key: String,
    data: Value,
    written_at: Instant,
    options: EntryOptions,
    access_count: u64,
    last_accessed_at: Instant,
    /// Set by `mark_stale`; cleared on the next write
    forced_stale: bool,
}

impl CacheEntry {
    /// Create an entry written at `now`.
    pub fn new(key: impl Into<String>, data: Value, options: EntryOptions, now: Instant) -> Self {
        Self {
            key: key.into(),
            data,
            written_at: now,
            options,
            access_count: 0,
            last_accessed_at: now,
            forced_stale: false,
        }
    }

    #[inline]
    pub fn key(&self) -> &str {
        &self.key
    }

    #[inline]
    pub fn data(&self) -> &Value {
        &self.data
    }

    /// Consume the entry and return its data.
    pub fn into_data(self) -> Value {
        self.data
    }

    #[inline]
    pub fn written_at(&self) -> Instant {
        self.written_at
    }

    #[inline]
    pub fn options(&self) -> EntryOptions {
        self.options
    }

    #[inline]
    pub fn stale_after(&self) -> Duration {
        self.options.stale_after
    }

    #[inline]
    pub fn evict_after(&self) -> Duration {
        self.options.evict_after
    }

    #[inline]
    pub fn access_count(&self) -> u64 {
        self.access_count
    }

    #[inline]
    pub fn last_accessed_at(&self) -> Instant {
        self.last_accessed_at
    }

    /// Whether the entry was explicitly flagged stale.
    #[inline]
    pub fn is_forced_stale(&self) -> bool {
        self.forced_stale
    }

    /// Age of the data at `now`.
    pub fn age_at(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.written_at)
    }

    /// `now - writtenAt > (custom ?? staleAfter)`, or flagged stale.
    pub fn is_stale_at(&self, now: Instant, custom_stale_after: Option<Duration>) -> bool {
        if self.forced_stale {
            return true;
        }
        let threshold = custom_stale_after.unwrap_or(self.options.stale_after);
        self.age_at(now) > threshold
    }

    /// `now - writtenAt > evictAfter`
    pub fn is_expired_at(&self, now: Instant) -> bool {
        self.age_at(now) > self.options.evict_after
    }

    pub(crate) fn record_access(&mut self, now: Instant) {
        self.access_count += 1;
        self.last_accessed_at = now;
    }

    pub(crate) fn mark_stale(&mut self) {
        self.forced_stale = true;
    }

    /// Serializable view of this entry at `now`.
    pub fn summary(&self, now: Instant) -> EntrySummary {
        EntrySummary {
            key: self.key.clone(),
            data: self.data.clone(),
            age_ms: self.age_at(now).as_millis() as u64,
            stale: self.is_stale_at(now, None),
            stale_after_ms: self.options.stale_after.as_millis() as u64,
            evict_after_ms: self.options.evict_after.as_millis() as u64,
            access_count: self.access_count,
        }
    }
}

/// Serializable summary of an entry (for dumps and diagnostics).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntrySummary {
    pub key: String,
    pub data: Value,
    pub age_ms: u64,
    pub stale: bool,
    pub stale_after_ms: u64,
    pub evict_after_ms: u64,
    pub access_count: u64,
}

// =============================================================================
// Tests
// =============================================================================
