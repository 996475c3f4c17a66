//! Cache Store
//!
//! Owns the key → entry map, staleness bookkeeping and per-key subscriber
//! lists. Knows nothing about fetching or mutations.
//!
//! # Design
//!
//! - One `RwLock` over the map; it is never held across an `.await` and
//!   never held while subscriber callbacks run
//! - Every write resets `written_at` and notifies subscribers of the key
//! - Multi-key operations (rollback, pattern invalidation) apply under a
//!   single lock acquisition and then fire one notification batch
//! - The sweep checks one entry per lock acquisition and yields to the
//!   scheduler periodically

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::RwLock;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, trace};

use super::entry::{CacheEntry, EntryOptions, EntrySummary};
use super::metrics::MetricsCollector;
use crate::domain::events::{CacheEvent, RemovalReason, WriteSource};
use crate::error::Result;

/// Default interval between expiry sweeps (60s)
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// The cooperative sweep yields after this many entry checks
pub const SWEEP_YIELD_EVERY: usize = 64;

/// Subscriber callback
pub type SubscriberCallback = Arc<dyn Fn(&CacheEvent) + Send + Sync>;

// =============================================================================
// Subscribers
// =============================================================================

#[derive(Default)]
struct SubscriberRegistry {
    subscribers: RwLock<HashMap<String, Vec<(u64, SubscriberCallback)>>>,
    next_id: AtomicU64,
}

impl SubscriberRegistry {
    fn add(&self, key: &str, callback: SubscriberCallback) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers
            .write()
            .entry(key.to_string())
            .or_default()
            .push((id, callback));
        id
    }

    fn remove(&self, key: &str, id: u64) -> bool {
        let mut subscribers = self.subscribers.write();
        let Some(list) = subscribers.get_mut(key) else {
            return false;
        };
        let before = list.len();
        list.retain(|(sub_id, _)| *sub_id != id);
        let removed = list.len() != before;
        if list.is_empty() {
            subscribers.remove(key);
        }
        removed
    }

    fn count(&self, key: &str) -> usize {
        self.subscribers.read().get(key).map_or(0, Vec::len)
    }

    fn callbacks_for(&self, key: &str) -> Vec<SubscriberCallback> {
        self.subscribers
            .read()
            .get(key)
            .map(|list| list.iter().map(|(_, cb)| Arc::clone(cb)).collect())
            .unwrap_or_default()
    }

    /// Deliver events in order. Must be called with no store lock held.
    fn dispatch(&self, events: &[CacheEvent]) {
        for event in events {
            for callback in self.callbacks_for(event.key()) {
                callback(event);
            }
        }
    }
}

/// Handle for a key subscription.
///
/// Dropping the handle unsubscribes. Call [`Subscription::detach`] to keep
/// the callback registered for the lifetime of the store instead.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    key: String,
    id: u64,
    registry: Weak<SubscriberRegistry>,
    active: bool,
}

impl Subscription {
    /// Key this subscription listens on
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Whether the callback is still registered
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Remove the callback. Returns false if it was already gone.
    pub fn unsubscribe(mut self) -> bool {
        self.release()
    }

    /// Leave the callback registered; the caller gives up the ability to
    /// remove it.
    pub fn detach(mut self) {
        self.active = false;
    }

    fn release(&mut self) -> bool {
        if !self.active {
            return false;
        }
        self.active = false;
        self.registry
            .upgrade()
            .is_some_and(|registry| registry.remove(&self.key, self.id))
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("key", &self.key)
            .field("id", &self.id)
            .field("active", &self.active)
            .finish()
    }
}

// =============================================================================
// Store
// =============================================================================

/// Result of an atomic read-modify-write decision.
#[derive(Debug, Clone, PartialEq)]
pub enum EntryUpdate {
    /// Write new data, keeping the existing entry's options (or the fallback)
    Write(Value),
    /// Write new data with explicit options
    WriteWith(Value, EntryOptions),
    /// Remove the entry
    Remove(RemovalReason),
    /// Leave the entry untouched
    Keep,
}

/// Key → entry map with subscriber notification
pub struct CacheStore {
    entries: RwLock<HashMap<String, CacheEntry>>,
    subscribers: Arc<SubscriberRegistry>,
    defaults: EntryOptions,
    metrics: Arc<MetricsCollector>,
}

impl Default for CacheStore {
    fn default() -> Self {
        Self::new(EntryOptions::default(), Arc::new(MetricsCollector::new()))
    }
}

impl CacheStore {
    /// Create a store with default entry options and a shared metrics collector
    pub fn new(defaults: EntryOptions, metrics: Arc<MetricsCollector>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            subscribers: Arc::new(SubscriberRegistry::default()),
            defaults,
            metrics,
        }
    }

    /// Default options used by `set_with_defaults`
    pub fn defaults(&self) -> EntryOptions {
        self.defaults
    }

    pub fn metrics(&self) -> &Arc<MetricsCollector> {
        &self.metrics
    }

    // -------------------------------------------------------------------------
    // Reads
    // -------------------------------------------------------------------------

    /// Get an entry, recording the access.
    pub fn get(&self, key: &str) -> Option<CacheEntry> {
        let now = Instant::now();
        let mut entries = self.entries.write();
        let entry = entries.get_mut(key)?;
        entry.record_access(now);
        Some(entry.clone())
    }

    /// Get an entry without touching access statistics.
    pub fn peek(&self, key: &str) -> Option<CacheEntry> {
        self.entries.read().get(key).cloned()
    }

    /// Copy several entries (or their absence) under one lock.
    pub fn peek_many(&self, keys: &[String]) -> Vec<(String, Option<CacheEntry>)> {
        let entries = self.entries.read();
        keys.iter()
            .map(|k| (k.clone(), entries.get(k).cloned()))
            .collect()
    }

    /// `now - writtenAt > (custom ?? staleAfter)`. An absent key is stale.
    pub fn is_stale(&self, key: &str, custom_stale_after: Option<Duration>) -> bool {
        let now = Instant::now();
        self.entries
            .read()
            .get(key)
            .map_or(true, |e| e.is_stale_at(now, custom_stale_after))
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.read().contains_key(key)
    }

    /// Live keys, sorted
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.entries.read().keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Serializable view of every entry, sorted by key
    pub fn summaries(&self) -> Vec<EntrySummary> {
        let now = Instant::now();
        let mut summaries: Vec<EntrySummary> =
            self.entries.read().values().map(|e| e.summary(now)).collect();
        summaries.sort_by(|a, b| a.key.cmp(&b.key));
        summaries
    }

    // -------------------------------------------------------------------------
    // Writes
    // -------------------------------------------------------------------------

    /// Create or overwrite an entry and notify subscribers.
    pub fn set(&self, key: &str, data: Value, options: EntryOptions) -> Result<()> {
        self.write(key, data, options, WriteSource::Manual)
    }

    /// `set` with the store's default options.
    pub fn set_with_defaults(&self, key: &str, data: Value) -> Result<()> {
        self.set(key, data, self.defaults)
    }

    pub(crate) fn write(
        &self,
        key: &str,
        data: Value,
        options: EntryOptions,
        source: WriteSource,
    ) -> Result<()> {
        options.validate()?;
        let event = CacheEvent::updated(key, data.clone(), source);
        {
            let entry = CacheEntry::new(key, data, options, Instant::now());
            self.entries.write().insert(key.to_string(), entry);
        }
        trace!(key = %key, source = %source, "Cache write");
        self.subscribers.dispatch(&[event]);
        Ok(())
    }

    /// Atomic read-modify-write.
    ///
    /// `decide` runs under the store lock and must not call back into the
    /// store. `fallback` supplies options when `EntryUpdate::Write` targets
    /// an absent key. Returns whether the entry changed.
    pub fn update_with<F>(
        &self,
        key: &str,
        source: WriteSource,
        fallback: EntryOptions,
        decide: F,
    ) -> Result<bool>
    where
        F: FnOnce(Option<&CacheEntry>) -> Result<EntryUpdate>,
    {
        let event = {
            let mut entries = self.entries.write();
            let current = entries.get(key);
            let existing_options = current.map(CacheEntry::options);

            match decide(current)? {
                EntryUpdate::Keep => None,
                EntryUpdate::Write(data) => {
                    let options = existing_options.unwrap_or(fallback);
                    options.validate()?;
                    let event = CacheEvent::updated(key, data.clone(), source);
                    entries.insert(
                        key.to_string(),
                        CacheEntry::new(key, data, options, Instant::now()),
                    );
                    Some(event)
                }
                EntryUpdate::WriteWith(data, options) => {
                    options.validate()?;
                    let event = CacheEvent::updated(key, data.clone(), source);
                    entries.insert(
                        key.to_string(),
                        CacheEntry::new(key, data, options, Instant::now()),
                    );
                    Some(event)
                }
                EntryUpdate::Remove(reason) => entries
                    .remove(key)
                    .map(|_| CacheEvent::invalidated(key, reason)),
            }
        };

        match event {
            Some(event) => {
                self.subscribers.dispatch(&[event]);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Remove an entry; subscribers receive an `Invalidated` signal.
    pub fn remove(&self, key: &str) -> bool {
        self.remove_with_reason(key, RemovalReason::Removed)
    }

    pub(crate) fn remove_with_reason(&self, key: &str, reason: RemovalReason) -> bool {
        let removed = self.entries.write().remove(key).is_some();
        if removed {
            self.metrics.forget(key);
            debug!(key = %key, reason = ?reason, "Cache entry removed");
            self.subscribers
                .dispatch(&[CacheEvent::invalidated(key, reason)]);
        }
        removed
    }

    /// Remove several keys under one lock; one notification batch.
    pub(crate) fn remove_many(&self, keys: &[String], reason: RemovalReason) -> Vec<String> {
        let removed: Vec<String> = {
            let mut entries = self.entries.write();
            keys.iter()
                .filter(|k| entries.remove(k.as_str()).is_some())
                .cloned()
                .collect()
        };
        self.metrics.forget_many(&removed);
        let events: Vec<CacheEvent> = removed
            .iter()
            .map(|k| CacheEvent::invalidated(k.as_str(), reason))
            .collect();
        self.subscribers.dispatch(&events);
        removed
    }

    /// Flag an entry stale without removing it.
    pub fn mark_stale(&self, key: &str) -> bool {
        let marked = match self.entries.write().get_mut(key) {
            Some(entry) => {
                entry.mark_stale();
                true
            }
            None => false,
        };
        if marked {
            self.subscribers.dispatch(&[CacheEvent::MarkedStale {
                key: key.to_string(),
            }]);
        }
        marked
    }

    /// Flag several keys stale under one lock.
    pub(crate) fn mark_many_stale(&self, keys: &[String]) -> Vec<String> {
        let marked: Vec<String> = {
            let mut entries = self.entries.write();
            keys.iter()
                .filter(|k| match entries.get_mut(k.as_str()) {
                    Some(entry) => {
                        entry.mark_stale();
                        true
                    }
                    None => false,
                })
                .cloned()
                .collect()
        };
        let events: Vec<CacheEvent> = marked
            .iter()
            .map(|k| CacheEvent::MarkedStale { key: k.clone() })
            .collect();
        self.subscribers.dispatch(&events);
        marked
    }

    /// Restore prior entries exactly (data, write time, options).
    ///
    /// `None` means the key did not exist and is removed. All keys change
    /// under one lock acquisition, then one notification batch fires.
    pub(crate) fn restore(&self, prior: &[(String, Option<CacheEntry>)]) {
        let events: Vec<CacheEvent> = {
            let mut entries = self.entries.write();
            prior
                .iter()
                .filter_map(|(key, entry)| match entry {
                    Some(entry) => {
                        entries.insert(key.clone(), entry.clone());
                        Some(CacheEvent::updated(
                            key.as_str(),
                            entry.data().clone(),
                            WriteSource::Rollback,
                        ))
                    }
                    None => entries
                        .remove(key)
                        .map(|_| CacheEvent::invalidated(key.as_str(), RemovalReason::RolledBack)),
                })
                .collect()
        };
        self.subscribers.dispatch(&events);
    }

    /// Remove every entry.
    pub fn clear(&self) {
        let removed: Vec<String> = self.entries.write().drain().map(|(k, _)| k).collect();
        self.metrics.forget_many(&removed);
        let events: Vec<CacheEvent> = removed
            .iter()
            .map(|k| CacheEvent::invalidated(k.as_str(), RemovalReason::Removed))
            .collect();
        self.subscribers.dispatch(&events);
    }

    // -------------------------------------------------------------------------
    // Subscriptions
    // -------------------------------------------------------------------------

    /// Register a callback for events on `key`.
    pub fn subscribe<F>(&self, key: &str, callback: F) -> Subscription
    where
        F: Fn(&CacheEvent) + Send + Sync + 'static,
    {
        let id = self.subscribers.add(key, Arc::new(callback));
        Subscription {
            key: key.to_string(),
            id,
            registry: Arc::downgrade(&self.subscribers),
            active: true,
        }
    }

    /// Number of callbacks registered on `key`
    pub fn subscriber_count(&self, key: &str) -> usize {
        self.subscribers.count(key)
    }

    // -------------------------------------------------------------------------
    // Expiry
    // -------------------------------------------------------------------------

    /// Remove every expired entry in one pass under one lock.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let expired: Vec<String> = {
            let mut entries = self.entries.write();
            let expired: Vec<String> = entries
                .iter()
                .filter(|(_, e)| e.is_expired_at(now))
                .map(|(k, _)| k.clone())
                .collect();
            for key in &expired {
                entries.remove(key);
            }
            expired
        };
        self.finish_sweep(expired)
    }

    /// Sweep holding the lock for one entry check at a time and yielding to
    /// the scheduler every `SWEEP_YIELD_EVERY` checks.
    #[instrument(skip(self))]
    pub async fn sweep_cooperative(&self) -> usize {
        let keys: Vec<String> = self.entries.read().keys().cloned().collect();
        let mut expired = Vec::new();

        for (checked, key) in keys.into_iter().enumerate() {
            if checked > 0 && checked % SWEEP_YIELD_EVERY == 0 {
                tokio::task::yield_now().await;
            }
            if self.evict_if_expired(&key) {
                expired.push(key);
            }
        }

        self.finish_sweep(expired)
    }

    fn evict_if_expired(&self, key: &str) -> bool {
        let now = Instant::now();
        let mut entries = self.entries.write();
        if entries.get(key).is_some_and(|e| e.is_expired_at(now)) {
            entries.remove(key);
            true
        } else {
            false
        }
    }

    fn finish_sweep(&self, expired: Vec<String>) -> usize {
        // Per-key counters only live as long as their entry
        let dropped = {
            let entries = self.entries.read();
            self.metrics.retain_keys(|key| entries.contains_key(key))
        };
        if dropped > 0 {
            debug!(dropped, "Pruned per-key metrics");
        }
        if expired.is_empty() {
            return 0;
        }
        let events: Vec<CacheEvent> = expired
            .iter()
            .map(|k| CacheEvent::invalidated(k.as_str(), RemovalReason::Expired))
            .collect();
        self.subscribers.dispatch(&events);
        self.metrics.record_evictions(expired.len() as u64);
        debug!(evicted = expired.len(), "Expiry sweep complete");
        expired.len()
    }

    /// Run the cooperative sweep every `interval` until `shutdown` fires.
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // First tick completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        debug!("Sweeper stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        store.sweep_cooperative().await;
                    }
                }
            }
        })
    }
}

impl std::fmt::Debug for CacheStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheStore")
            .field("entries", &self.len())
            .field("defaults", &self.defaults)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
