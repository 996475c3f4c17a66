//! Realtime Sync Bridge
//!
//! Subscribes to a push transport and folds incoming messages into bound
//! cache keys.
//!
//! ```text
//!  PushTransport ──(topic, msg)──► on_message
//!                                     │ for each binding whose topics match
//!                                     ├─ duplicate (key, msg.id)?   ─► skip
//!                                     ├─ older than last applied?   ─► skip
//!                                     └─ StrategyMap[msg.type] ─► PushUpdate
//!                                                                   │
//!                                       CacheStore::update_with ◄───┘
//!                                       (subscribers notified)
//! ```
//!
//! Transport subscriptions are reference counted per topic: the first
//! binding on a topic subscribes, the last unbind unsubscribes.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use super::update::{PushUpdate, StrategyMap};
use crate::cache::entry::CacheEntry;
use crate::cache::pattern::PatternMatcher;
use crate::cache::store::CacheStore;
use crate::config::PolicyResolver;
use crate::domain::events::WriteSource;
use crate::domain::ports::{PushHandler, PushMessage, PushTransport, TransportSubscriptionId};
use crate::error::{Error, Result};

/// Push handling configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Field identifying items inside payloads and cached collections
    pub id_field: String,
    /// Remembered (key, message id) pairs for redelivery dedup
    pub dedup_capacity: usize,
    /// Skip messages older than the last one applied to the same key
    pub reject_out_of_order: bool,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            id_field: "id".to_string(),
            dedup_capacity: 1024,
            reject_out_of_order: true,
        }
    }
}

impl BridgeConfig {
    pub fn validate(&self) -> Result<()> {
        if self.id_field.is_empty() {
            return Err(Error::Config("bridge.id_field must not be empty".into()));
        }
        if self.dedup_capacity == 0 {
            return Err(Error::Config("bridge.dedup_capacity must be > 0".into()));
        }
        Ok(())
    }
}

/// Bounded FIFO window of recently applied (key, message id) pairs.
#[derive(Debug)]
struct RecentIds {
    capacity: usize,
    order: VecDeque<(String, String)>,
    seen: HashSet<(String, String)>,
}

impl RecentIds {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            order: VecDeque::with_capacity(capacity),
            seen: HashSet::with_capacity(capacity),
        }
    }

    /// Record the pair; false if it was already present.
    fn insert(&mut self, key: &str, id: &str) -> bool {
        let pair = (key.to_string(), id.to_string());
        if self.seen.contains(&pair) {
            return false;
        }
        if self.order.len() == self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        self.seen.insert(pair.clone());
        self.order.push_back(pair);
        true
    }

    fn remove(&mut self, key: &str, id: &str) {
        let pair = (key.to_string(), id.to_string());
        if self.seen.remove(&pair) {
            self.order.retain(|p| *p != pair);
        }
    }

    fn forget_key(&mut self, key: &str) {
        self.order.retain(|(k, _)| k != key);
        self.seen.retain(|(k, _)| k != key);
    }
}

struct Binding {
    topics: BTreeMap<String, PatternMatcher>,
    strategies: StrategyMap,
}

impl Binding {
    fn matches(&self, topic: &str) -> bool {
        self.topics.values().any(|m| m.matches(topic))
    }
}

/// A push update admitted for one key, with what to undo if it fails.
struct PlannedUpdate {
    key: String,
    update: PushUpdate,
    dedup: bool,
    prior_watermark: Option<DateTime<Utc>>,
}

struct TopicSubscription {
    id: TransportSubscriptionId,
    bindings: usize,
}

struct BridgeState {
    bindings: HashMap<String, Binding>,
    subscriptions: HashMap<String, TopicSubscription>,
    recent: RecentIds,
    last_applied: HashMap<String, DateTime<Utc>>,
}

/// Bridge from a push transport into the cache store
pub struct RealtimeSyncBridge {
    store: Arc<CacheStore>,
    transport: Arc<dyn PushTransport>,
    policies: PolicyResolver,
    config: BridgeConfig,
    state: Mutex<BridgeState>,
    /// Serializes bind/unbind so transport calls never race
    control: tokio::sync::Mutex<()>,
}

impl RealtimeSyncBridge {
    pub fn new(
        store: Arc<CacheStore>,
        transport: Arc<dyn PushTransport>,
        policies: PolicyResolver,
        config: BridgeConfig,
    ) -> Self {
        let recent = RecentIds::new(config.dedup_capacity.max(1));
        Self {
            store,
            transport,
            policies,
            config,
            state: Mutex::new(BridgeState {
                bindings: HashMap::new(),
                subscriptions: HashMap::new(),
                recent,
                last_applied: HashMap::new(),
            }),
            control: tokio::sync::Mutex::new(()),
        }
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    fn handler(self: &Arc<Self>) -> PushHandler {
        let bridge: Weak<Self> = Arc::downgrade(self);
        Arc::new(move |topic: &str, message: &PushMessage| {
            if let Some(bridge) = bridge.upgrade() {
                bridge.on_message(topic, message);
            }
        })
    }

    /// Bind `key` to `topics`. Re-binding adds topics and replaces the
    /// strategy map.
    #[instrument(skip(self, topics, strategies), fields(key = %key))]
    pub async fn bind<I, S>(
        self: &Arc<Self>,
        key: &str,
        topics: I,
        strategies: impl Into<StrategyMap>,
    ) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let topics: Vec<String> = topics.into_iter().map(Into::into).collect();
        let matchers = topics
            .iter()
            .map(|t| PatternMatcher::compile(t))
            .collect::<Result<Vec<_>>>()?;
        let strategies = strategies.into();

        let _control = self.control.lock().await;

        for (topic, matcher) in topics.into_iter().zip(matchers) {
            let (bound, subscribed) = {
                let state = self.state.lock();
                (
                    state
                        .bindings
                        .get(key)
                        .is_some_and(|b| b.topics.contains_key(&topic)),
                    state.subscriptions.contains_key(&topic),
                )
            };
            if bound {
                continue;
            }

            if !subscribed {
                let id = self.transport.subscribe(&topic, self.handler()).await?;
                debug!(topic = %topic, subscription = %id, "Subscribed to topic");
                self.state
                    .lock()
                    .subscriptions
                    .insert(topic.clone(), TopicSubscription { id, bindings: 0 });
            }

            self.attach(key, topic, matcher, &strategies);
        }

        if let Some(binding) = self.state.lock().bindings.get_mut(key) {
            binding.strategies = strategies;
        }
        info!(key = %key, "Key bound to push topics");
        Ok(())
    }

    fn attach(&self, key: &str, topic: String, matcher: PatternMatcher, strategies: &StrategyMap) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if let Some(subscription) = state.subscriptions.get_mut(&topic) {
            subscription.bindings += 1;
        }
        state
            .bindings
            .entry(key.to_string())
            .or_insert_with(|| Binding {
                topics: BTreeMap::new(),
                strategies: strategies.clone(),
            })
            .topics
            .insert(topic, matcher);
    }

    /// Remove `topics` from `key`'s binding. Unknown keys and topics are
    /// ignored, so repeated calls are safe.
    #[instrument(skip(self, topics), fields(key = %key))]
    pub async fn unbind<I, S>(&self, key: &str, topics: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let _control = self.control.lock().await;

        let released: Vec<TransportSubscriptionId> = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let Some(binding) = state.bindings.get_mut(key) else {
                return Ok(());
            };

            let removed: Vec<String> = topics
                .into_iter()
                .filter_map(|t| binding.topics.remove_entry(t.as_ref()).map(|(t, _)| t))
                .collect();
            if binding.topics.is_empty() {
                state.bindings.remove(key);
                state.last_applied.remove(key);
                state.recent.forget_key(key);
            }

            let mut released = Vec::new();
            for topic in removed {
                let drop_topic = match state.subscriptions.get_mut(&topic) {
                    Some(subscription) => {
                        subscription.bindings = subscription.bindings.saturating_sub(1);
                        subscription.bindings == 0
                    }
                    None => false,
                };
                if drop_topic {
                    if let Some(subscription) = state.subscriptions.remove(&topic) {
                        released.push(subscription.id);
                    }
                }
            }
            released
        };

        for id in released {
            self.transport.unsubscribe(id).await?;
            debug!(subscription = %id, "Unsubscribed from topic");
        }
        Ok(())
    }

    /// Remove every topic bound to `key`.
    pub async fn unbind_all(&self, key: &str) -> Result<()> {
        let topics: Vec<String> = self
            .state
            .lock()
            .bindings
            .get(key)
            .map(|b| b.topics.keys().cloned().collect())
            .unwrap_or_default();
        self.unbind(key, topics).await
    }

    pub fn is_bound(&self, key: &str) -> bool {
        self.state.lock().bindings.contains_key(key)
    }

    /// Topics bound to `key`, sorted
    pub fn topics_for(&self, key: &str) -> Vec<String> {
        self.state
            .lock()
            .bindings
            .get(key)
            .map(|b| b.topics.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Topics with a live transport subscription
    pub fn subscribed_topics(&self) -> usize {
        self.state.lock().subscriptions.len()
    }

    /// Apply `message` to every key bound to a topic matching `topic`.
    /// Returns the number of keys that changed.
    pub fn on_message(&self, topic: &str, message: &PushMessage) -> usize {
        let metrics = self.store.metrics();

        let planned: Vec<PlannedUpdate> = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let mut planned = Vec::new();

            for (key, binding) in &state.bindings {
                if !binding.matches(topic) {
                    continue;
                }
                if self.config.reject_out_of_order
                    && state
                        .last_applied
                        .get(key)
                        .is_some_and(|last| message.timestamp < *last)
                {
                    metrics.record_push_out_of_order();
                    debug!(key = %key, id = %message.id, "Skipping out-of-order push");
                    continue;
                }
                if !message.id.is_empty() && !state.recent.insert(key, &message.id) {
                    metrics.record_push_duplicate();
                    debug!(key = %key, id = %message.id, "Skipping redelivered push");
                    continue;
                }

                let prior_watermark = state.last_applied.get(key).copied();
                if prior_watermark.map_or(true, |last| message.timestamp > last) {
                    state.last_applied.insert(key.clone(), message.timestamp);
                }

                let strategy = binding.strategies.strategy_for(&message.kind);
                planned.push(PlannedUpdate {
                    key: key.clone(),
                    update: PushUpdate::new(strategy, message.data.clone(), &self.config.id_field),
                    dedup: binding.strategies.dedup(),
                    prior_watermark,
                });
            }
            planned
        };

        let mut applied = 0;
        for PlannedUpdate {
            key,
            update,
            dedup,
            prior_watermark,
        } in planned
        {
            let strategy = update.strategy();
            let fallback = self.policies.resolve(&key).options;
            let outcome = self
                .store
                .update_with(&key, WriteSource::Push, fallback, |current| {
                    update.apply(&key, current.map(CacheEntry::data), &self.config.id_field, dedup)
                });

            match outcome {
                Ok(true) => {
                    applied += 1;
                    metrics.record_push_applied(&key);
                    debug!(key = %key, strategy = %strategy, "Push update applied");
                }
                Ok(false) => {
                    debug!(key = %key, strategy = %strategy, "Push update changed nothing");
                }
                Err(error) => {
                    self.release(&key, message, prior_watermark);
                    metrics.record_push_skipped();
                    warn!(key = %key, strategy = %strategy, error = %error, "Push update skipped");
                }
            }
        }
        applied
    }

    /// Undo the bookkeeping of a message that was admitted but not applied,
    /// so a redelivery or an older valid message still gets through.
    fn release(&self, key: &str, message: &PushMessage, prior_watermark: Option<DateTime<Utc>>) {
        let mut state = self.state.lock();
        if !message.id.is_empty() {
            state.recent.remove(key, &message.id);
        }
        // Only roll back a watermark this message set
        if state.last_applied.get(key) == Some(&message.timestamp)
            && prior_watermark.map_or(true, |prior| prior < message.timestamp)
        {
            match prior_watermark {
                Some(prior) => {
                    state.last_applied.insert(key.to_string(), prior);
                }
                None => {
                    state.last_applied.remove(key);
                }
            }
        }
    }
}

impl std::fmt::Debug for RealtimeSyncBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("RealtimeSyncBridge")
            .field("bindings", &state.bindings.len())
            .field("subscriptions", &state.subscriptions.len())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
