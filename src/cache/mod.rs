//! Cache Layer
//!
//! In-memory key → entry store with staleness bookkeeping, per-key
//! subscribers, pattern invalidation and observational metrics.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                           CacheStore                             │
//! ├──────────────────────────────────────────────────────────────────┤
//! │  entries: RwLock<HashMap<key, CacheEntry>>                       │
//! │  subscribers: key → [callback]          (fired outside the lock) │
//! │  sweeper: periodic, cooperative expiry                           │
//! └──────────────────────────────────────────────────────────────────┘
//!          ▲                        ▲                       ▲
//!          │ remove / mark_stale    │ record_*              │ set / get
//! ┌──────────────────┐     ┌──────────────────┐    ┌──────────────────┐
//! │ InvalidationEng. │     │ MetricsCollector │    │ coordinators /   │
//! │ (compiled cache) │     │ (atomics)        │    │ realtime bridge  │
//! └──────────────────┘     └──────────────────┘    └──────────────────┘
//! ```
//!
//! # Freshness
//!
//! - **fresh**: `age <= stale_after`; served without a fetch
//! - **stale**: `age > stale_after` (or flagged); served, refresh scheduled
//! - **expired**: `age > evict_after`; removed by the next sweep

pub mod entry;
pub mod invalidation;
pub mod metrics;
pub mod pattern;
pub mod store;

#[cfg(test)]
mod proptest;

pub use entry::{CacheEntry, EntryOptions, EntrySummary, DEFAULT_EVICT_AFTER, DEFAULT_STALE_AFTER};
pub use invalidation::{InvalidationEngine, InvalidationMode};
pub use metrics::{KeyMetricsSnapshot, LatencyTracker, MetricsCollector, MetricsSnapshot};
pub use pattern::{InvalidationPattern, PatternMatcher};
pub use store::{CacheStore, EntryUpdate, Subscription, DEFAULT_SWEEP_INTERVAL};
