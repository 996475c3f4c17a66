//! Engine Metrics Collection
//!
//! Counters and latency tracking per engine and per key. Purely
//! observational: nothing in the engine branches on these values.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::Serialize;

/// Per-key counters.
#[derive(Debug, Default)]
pub struct KeyMetrics {
    reads: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    fetches: AtomicU64,
    fetch_failures: AtomicU64,
    push_updates: AtomicU64,
    fetch_latency_us: AtomicU64,
}

impl KeyMetrics {
    pub fn reads(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn fetches(&self) -> u64 {
        self.fetches.load(Ordering::Relaxed)
    }

    pub fn fetch_failures(&self) -> u64 {
        self.fetch_failures.load(Ordering::Relaxed)
    }

    pub fn push_updates(&self) -> u64 {
        self.push_updates.load(Ordering::Relaxed)
    }

    pub fn fetch_latency(&self) -> Duration {
        Duration::from_micros(self.fetch_latency_us.load(Ordering::Relaxed))
    }

    fn snapshot(&self) -> KeyMetricsSnapshot {
        KeyMetricsSnapshot {
            reads: self.reads(),
            hits: self.hits(),
            misses: self.misses(),
            fetches: self.fetches(),
            fetch_failures: self.fetch_failures(),
            push_updates: self.push_updates(),
            fetch_latency_us: self.fetch_latency().as_micros() as u64,
        }
    }
}

/// Engine metrics collector
#[derive(Debug, Default)]
pub struct MetricsCollector {
    // Reads
    hits: AtomicU64,
    misses: AtomicU64,
    stale_hits: AtomicU64,

    // Fetches
    fetches: AtomicU64,
    fetch_failures: AtomicU64,
    retries: AtomicU64,
    dedup_joins: AtomicU64,
    background_refreshes: AtomicU64,
    soft_failures: AtomicU64,
    fetch_latency_us: AtomicU64,

    // Mutations
    mutations: AtomicU64,
    commits: AtomicU64,
    rollbacks: AtomicU64,

    // Removal
    invalidated_keys: AtomicU64,
    evictions: AtomicU64,

    // Push updates
    push_applied: AtomicU64,
    push_skipped: AtomicU64,
    push_duplicates: AtomicU64,
    push_out_of_order: AtomicU64,

    per_key: DashMap<String, KeyMetrics>,
}

impl MetricsCollector {
    /// Create a new metrics collector
    pub fn new() -> Self {
        Self::default()
    }

    fn with_key(&self, key: &str, f: impl FnOnce(&KeyMetrics)) {
        if let Some(metrics) = self.per_key.get(key) {
            f(&metrics);
            return;
        }
        let metrics = self.per_key.entry(key.to_string()).or_default();
        f(&metrics);
    }

    // Reads
    pub fn record_hit(&self, key: &str) {
        self.hits.fetch_add(1, Ordering::Relaxed);
        self.with_key(key, |m| {
            m.reads.fetch_add(1, Ordering::Relaxed);
            m.hits.fetch_add(1, Ordering::Relaxed);
        });
    }

    pub fn record_stale_hit(&self, key: &str) {
        self.stale_hits.fetch_add(1, Ordering::Relaxed);
        self.record_hit(key);
    }

    pub fn record_miss(&self, key: &str) {
        self.misses.fetch_add(1, Ordering::Relaxed);
        self.with_key(key, |m| {
            m.reads.fetch_add(1, Ordering::Relaxed);
            m.misses.fetch_add(1, Ordering::Relaxed);
        });
    }

    // Fetches
    pub fn record_fetch(&self, key: &str, latency: Duration) {
        self.fetches.fetch_add(1, Ordering::Relaxed);
        update_latency_ema(&self.fetch_latency_us, latency);
        self.with_key(key, |m| {
            m.fetches.fetch_add(1, Ordering::Relaxed);
            update_latency_ema(&m.fetch_latency_us, latency);
        });
    }

    pub fn record_fetch_failure(&self, key: &str) {
        self.fetch_failures.fetch_add(1, Ordering::Relaxed);
        self.with_key(key, |m| {
            m.fetch_failures.fetch_add(1, Ordering::Relaxed);
        });
    }

    pub fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dedup_join(&self) {
        self.dedup_joins.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_background_refresh(&self) {
        self.background_refreshes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_soft_failure(&self) {
        self.soft_failures.fetch_add(1, Ordering::Relaxed);
    }

    // Mutations
    pub fn record_mutation(&self) {
        self.mutations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_commit(&self) {
        self.commits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rollback(&self) {
        self.rollbacks.fetch_add(1, Ordering::Relaxed);
    }

    // Removal
    pub fn record_invalidated(&self, count: u64) {
        self.invalidated_keys.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_evictions(&self, count: u64) {
        self.evictions.fetch_add(count, Ordering::Relaxed);
    }

    // Push updates
    pub fn record_push_applied(&self, key: &str) {
        self.push_applied.fetch_add(1, Ordering::Relaxed);
        self.with_key(key, |m| {
            m.push_updates.fetch_add(1, Ordering::Relaxed);
        });
    }

    pub fn record_push_skipped(&self) {
        self.push_skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_push_duplicate(&self) {
        self.push_duplicates.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_push_out_of_order(&self) {
        self.push_out_of_order.fetch_add(1, Ordering::Relaxed);
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn fetches(&self) -> u64 {
        self.fetches.load(Ordering::Relaxed)
    }

    pub fn rollbacks(&self) -> u64 {
        self.rollbacks.load(Ordering::Relaxed)
    }

    pub fn hit_ratio(&self) -> f64 {
        let hits = self.hits() as f64;
        let total = hits + self.misses() as f64;
        if total == 0.0 {
            0.0
        } else {
            hits / total
        }
    }

    pub fn fetch_latency(&self) -> Duration {
        Duration::from_micros(self.fetch_latency_us.load(Ordering::Relaxed))
    }

    /// Snapshot of a single key's counters
    pub fn key_snapshot(&self, key: &str) -> Option<KeyMetricsSnapshot> {
        self.per_key.get(key).map(|m| m.snapshot())
    }

    /// Number of keys with recorded activity
    pub fn tracked_keys(&self) -> usize {
        self.per_key.len()
    }

    /// Drop the per-key counters of a key that left the store.
    pub fn forget(&self, key: &str) {
        self.per_key.remove(key);
    }

    pub fn forget_many<S: AsRef<str>>(&self, keys: &[S]) {
        for key in keys {
            self.per_key.remove(key.as_ref());
        }
    }

    /// Keep per-key counters only for keys where `live` holds.
    /// Returns the number dropped.
    pub fn retain_keys(&self, mut live: impl FnMut(&str) -> bool) -> usize {
        let before = self.per_key.len();
        self.per_key.retain(|key, _| live(key.as_str()));
        before.saturating_sub(self.per_key.len())
    }

    /// Get snapshot of all metrics
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            hits: self.hits(),
            misses: self.misses(),
            stale_hits: self.stale_hits.load(Ordering::Relaxed),
            hit_ratio: self.hit_ratio(),
            fetches: self.fetches(),
            fetch_failures: self.fetch_failures.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            dedup_joins: self.dedup_joins.load(Ordering::Relaxed),
            background_refreshes: self.background_refreshes.load(Ordering::Relaxed),
            soft_failures: self.soft_failures.load(Ordering::Relaxed),
            fetch_latency_us: self.fetch_latency().as_micros() as u64,
            mutations: self.mutations.load(Ordering::Relaxed),
            commits: self.commits.load(Ordering::Relaxed),
            rollbacks: self.rollbacks(),
            invalidated_keys: self.invalidated_keys.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            push_applied: self.push_applied.load(Ordering::Relaxed),
            push_skipped: self.push_skipped.load(Ordering::Relaxed),
            push_duplicates: self.push_duplicates.load(Ordering::Relaxed),
            push_out_of_order: self.push_out_of_order.load(Ordering::Relaxed),
            tracked_keys: self.tracked_keys(),
        }
    }

    /// Reset all metrics
    pub fn reset(&self) {
        for counter in [
            &self.hits,
            &self.misses,
            &self.stale_hits,
            &self.fetches,
            &self.fetch_failures,
            &self.retries,
            &self.dedup_joins,
            &self.background_refreshes,
            &self.soft_failures,
            &self.fetch_latency_us,
            &self.mutations,
            &self.commits,
            &self.rollbacks,
            &self.invalidated_keys,
            &self.evictions,
            &self.push_applied,
            &self.push_skipped,
            &self.push_duplicates,
            &self.push_out_of_order,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        self.per_key.clear();
    }
}

/// Exponential moving average, alpha = 0.1
fn update_latency_ema(target: &AtomicU64, duration: Duration) {
    let new_us = duration.as_micros() as u64;
    let alpha = 0.1;

    loop {
        let current = target.load(Ordering::Relaxed);
        let updated = if current == 0 {
            new_us
        } else {
            ((1.0 - alpha) * current as f64 + alpha * new_us as f64) as u64
        };

        if target
            .compare_exchange_weak(current, updated, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
        {
            break;
        }
    }
}

/// Snapshot of a single key's counters
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KeyMetricsSnapshot {
    pub reads: u64,
    pub hits: u64,
    pub misses: u64,
    pub fetches: u64,
    pub fetch_failures: u64,
    pub push_updates: u64,
    pub fetch_latency_us: u64,
}

/// Snapshot of all engine metrics
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    // Reads
    pub hits: u64,
    pub misses: u64,
    pub stale_hits: u64,
    pub hit_ratio: f64,

    // Fetches
    pub fetches: u64,
    pub fetch_failures: u64,
    pub retries: u64,
    pub dedup_joins: u64,
    pub background_refreshes: u64,
    pub soft_failures: u64,
    pub fetch_latency_us: u64,

    // Mutations
    pub mutations: u64,
    pub commits: u64,
    pub rollbacks: u64,

    // Removal
    pub invalidated_keys: u64,
    pub evictions: u64,

    // Push
    pub push_applied: u64,
    pub push_skipped: u64,
    pub push_duplicates: u64,
    pub push_out_of_order: u64,

    pub tracked_keys: usize,
}

/// Latency tracker helper
pub struct LatencyTracker {
    start: Instant,
}

impl LatencyTracker {
    /// Start tracking latency
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Get elapsed duration
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

// =============================================================================
// Tests
// =============================================================================
