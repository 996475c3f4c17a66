//! Query Coordinator
//!
//! Public read entry point. Decides per read whether to serve from the
//! store, refresh in the background, or block on the network.
//!
//! # Read Path
//!
//! ```text
//! read(key, fetcher, options)
//!   │
//!   ├─ network-only ─────────────────────────────► fetch ─► result / error
//!   ├─ cache-only ───► store.get ─► data / CacheMiss
//!   ├─ network-first ─► fetch ─► result
//!   │                     └─ failure ─► cached value (soft) / error
//!   └─ cache-first | stale-while-revalidate
//!         store.get
//!           ├─ fresh ─────────────────────────────► data
//!           ├─ stale ─┬─ swr ─► data + background refresh
//!           │         └─ cache-first ─► fetch, stale on failure
//!           └─ absent ─► fetch ─► result / error
//! ```
//!
//! Every fetch goes through the [`InflightRegistry`]. The fetch, its retries
//! and the cache write run on the inflight task, so a cancelled reader does
//! not prevent the result from landing in the store.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use super::inflight::{InflightHandle, InflightRegistry};
use super::retry::RetryPolicy;
use crate::cache::entry::{CacheEntry, EntryOptions};
use crate::cache::metrics::{LatencyTracker, MetricsCollector};
use crate::cache::store::CacheStore;
use crate::config::PolicyResolver;
use crate::domain::events::{RemovalReason, WriteSource};
use crate::domain::ports::Fetcher;
use crate::error::{Error, Result};

/// How a read balances freshness against latency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReadStrategy {
    /// Fresh hit returns; stale or absent blocks on a fetch
    CacheFirst,
    /// Always fetch; fall back to any cached value on failure
    NetworkFirst,
    /// Never fetch
    CacheOnly,
    /// Never read the cache, but write the result back
    NetworkOnly,
    /// Serve cached data immediately, refresh stale data in the background
    #[default]
    StaleWhileRevalidate,
}

impl ReadStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CacheFirst => "cache-first",
            Self::NetworkFirst => "network-first",
            Self::CacheOnly => "cache-only",
            Self::NetworkOnly => "network-only",
            Self::StaleWhileRevalidate => "stale-while-revalidate",
        }
    }
}

impl std::fmt::Display for ReadStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReadStrategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "cache-first" => Ok(Self::CacheFirst),
            "network-first" => Ok(Self::NetworkFirst),
            "cache-only" => Ok(Self::CacheOnly),
            "network-only" => Ok(Self::NetworkOnly),
            "stale-while-revalidate" | "swr" => Ok(Self::StaleWhileRevalidate),
            other => Err(Error::Config(format!("unknown read strategy '{}'", other))),
        }
    }
}

/// Side channel for soft failures (stale data served, refresh failed).
pub type ErrorCallback = Arc<dyn Fn(&str, &Error) + Send + Sync>;

/// Per-call read options. Unset fields fall back to the key class policy.
#[derive(Clone)]
pub struct ReadOptions {
    pub strategy: Option<ReadStrategy>,
    pub stale_after: Option<Duration>,
    pub evict_after: Option<Duration>,
    pub retry: Option<RetryPolicy>,
    /// Serve a cached value when the fetch fails (default true)
    pub fallback_to_stale: bool,
    pub cancel: Option<CancellationToken>,
    pub on_error: Option<ErrorCallback>,
}

impl Default for ReadOptions {
    fn default() -> Self {
        Self {
            strategy: None,
            stale_after: None,
            evict_after: None,
            retry: None,
            fallback_to_stale: true,
            cancel: None,
            on_error: None,
        }
    }
}

impl ReadOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_strategy(mut self, strategy: ReadStrategy) -> Self {
        self.strategy = Some(strategy);
        self
    }

    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = Some(stale_after);
        self
    }

    pub fn with_evict_after(mut self, evict_after: Duration) -> Self {
        self.evict_after = Some(evict_after);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn without_stale_fallback(mut self) -> Self {
        self.fallback_to_stale = false;
        self
    }

    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn on_error<F>(mut self, callback: F) -> Self
    where
        F: Fn(&str, &Error) + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(callback));
        self
    }

    fn report(&self, key: &str, error: &Error) {
        if let Some(callback) = &self.on_error {
            callback(key, error);
        }
    }
}

impl std::fmt::Debug for ReadOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadOptions")
            .field("strategy", &self.strategy)
            .field("stale_after", &self.stale_after)
            .field("evict_after", &self.evict_after)
            .field("fallback_to_stale", &self.fallback_to_stale)
            .field("cancellable", &self.cancel.is_some())
            .finish()
    }
}

/// Where the returned data came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultSource {
    Cache,
    Network,
    /// Fetch failed; a cached value was served instead
    StaleFallback,
}

/// Detailed read outcome.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryResult {
    pub data: Value,
    pub source: ResultSource,
    /// Data is older than its staleness threshold
    pub stale: bool,
    /// A background refresh was scheduled or joined
    pub revalidating: bool,
}

impl QueryResult {
    fn network(data: Value) -> Self {
        Self {
            data,
            source: ResultSource::Network,
            stale: false,
            revalidating: false,
        }
    }

    fn cached(entry: CacheEntry, stale: bool, revalidating: bool) -> Self {
        Self {
            data: entry.into_data(),
            source: ResultSource::Cache,
            stale,
            revalidating,
        }
    }
}

/// Read coordinator over a shared store and inflight registry
pub struct QueryCoordinator {
    store: Arc<CacheStore>,
    inflight: InflightRegistry,
    policies: PolicyResolver,
    retry: RetryPolicy,
}

impl QueryCoordinator {
    pub fn new(
        store: Arc<CacheStore>,
        inflight: InflightRegistry,
        policies: PolicyResolver,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            store,
            inflight,
            policies,
            retry,
        }
    }

    pub fn store(&self) -> &Arc<CacheStore> {
        &self.store
    }

    pub fn inflight(&self) -> &InflightRegistry {
        &self.inflight
    }

    fn metrics(&self) -> &MetricsCollector {
        self.store.metrics()
    }

    /// Read `key`, returning only the data.
    pub async fn read<F: Fetcher>(&self, key: &str, fetcher: F, options: ReadOptions) -> Result<Value> {
        self.read_detailed(key, fetcher, options)
            .await
            .map(|result| result.data)
    }

    /// Read `key` and deserialize the data.
    pub async fn read_as<T, F>(&self, key: &str, fetcher: F, options: ReadOptions) -> Result<T>
    where
        T: DeserializeOwned,
        F: Fetcher,
    {
        let data = self.read(key, fetcher, options).await?;
        Ok(serde_json::from_value(data)?)
    }

    /// Warm the cache. A fresh entry is left alone.
    pub async fn prefetch<F: Fetcher>(&self, key: &str, fetcher: F, options: ReadOptions) -> Result<()> {
        if !self.store.is_stale(key, options.stale_after) {
            return Ok(());
        }
        let entry_options = self.entry_options(key, &options)?;
        let retry = options.retry.unwrap_or(self.retry);
        self.fetch(key, fetcher, entry_options, retry, &options)
            .await
            .map(|_| ())
    }

    /// Read `key` with full provenance.
    #[instrument(skip(self, fetcher, options), fields(key = %key))]
    pub async fn read_detailed<F: Fetcher>(
        &self,
        key: &str,
        fetcher: F,
        options: ReadOptions,
    ) -> Result<QueryResult> {
        let policy = self.policies.resolve(key);
        let strategy = options.strategy.unwrap_or(policy.strategy);
        let entry_options = self.entry_options(key, &options)?;
        let retry = options.retry.unwrap_or(self.retry);

        match strategy {
            ReadStrategy::NetworkOnly => {
                let data = self.fetch(key, fetcher, entry_options, retry, &options).await?;
                Ok(QueryResult::network(data))
            }

            ReadStrategy::CacheOnly => match self.store.get(key) {
                Some(entry) => {
                    let stale = entry.is_stale_at(Instant::now(), options.stale_after);
                    self.record_cache_hit(key, stale);
                    Ok(QueryResult::cached(entry, stale, false))
                }
                None => {
                    self.metrics().record_miss(key);
                    Err(Error::CacheMiss(key.to_string()))
                }
            },

            ReadStrategy::NetworkFirst => {
                let cached = self.store.get(key);
                match self.fetch(key, fetcher, entry_options, retry, &options).await {
                    Ok(data) => Ok(QueryResult::network(data)),
                    Err(error) => self.fall_back(key, cached, error, &options),
                }
            }

            ReadStrategy::CacheFirst | ReadStrategy::StaleWhileRevalidate => {
                let Some(entry) = self.store.get(key) else {
                    debug!(key = %key, "Cache miss");
                    self.metrics().record_miss(key);
                    let data = self.fetch(key, fetcher, entry_options, retry, &options).await?;
                    return Ok(QueryResult::network(data));
                };

                if !entry.is_stale_at(Instant::now(), options.stale_after) {
                    debug!(key = %key, "Cache hit");
                    self.record_cache_hit(key, false);
                    return Ok(QueryResult::cached(entry, false, false));
                }

                self.record_cache_hit(key, true);
                if strategy == ReadStrategy::StaleWhileRevalidate {
                    self.revalidate(key, fetcher, entry_options, retry, &options);
                    return Ok(QueryResult::cached(entry, true, true));
                }

                match self.fetch(key, fetcher, entry_options, retry, &options).await {
                    Ok(data) => Ok(QueryResult::network(data)),
                    Err(error) => self.fall_back(key, Some(entry), error, &options),
                }
            }
        }
    }

    /// An inherited eviction threshold is raised to cover a per-call
    /// `stale_after`; only an explicit pair can be rejected.
    fn entry_options(&self, key: &str, options: &ReadOptions) -> Result<EntryOptions> {
        let policy = self.policies.resolve(key).options;
        let stale_after = options.stale_after.unwrap_or(policy.stale_after);
        let evict_after = options
            .evict_after
            .unwrap_or_else(|| policy.evict_after.max(stale_after));
        EntryOptions::new(stale_after, evict_after)
    }

    fn record_cache_hit(&self, key: &str, stale: bool) {
        if stale {
            self.metrics().record_stale_hit(key);
        } else {
            self.metrics().record_hit(key);
        }
    }

    /// Start or join the fetch for `key`.
    ///
    /// The inflight task retries transient failures, writes the result into
    /// the store before waiters resolve, and drops the entry on `NotFound`.
    fn start_fetch<F: Fetcher>(
        &self,
        key: &str,
        fetcher: F,
        entry_options: EntryOptions,
        retry: RetryPolicy,
    ) -> InflightHandle {
        let store = Arc::clone(&self.store);
        let owned_key = key.to_string();

        let handle = self.inflight.get_or_create(key, move || async move {
            let metrics = Arc::clone(store.metrics());
            let tracker = LatencyTracker::start();
            let outcome = retry
                .run(|| fetcher.fetch(), |_, _| metrics.record_retry())
                .await;

            match outcome {
                Ok(data) => {
                    metrics.record_fetch(&owned_key, tracker.elapsed());
                    store.write(&owned_key, data.clone(), entry_options, WriteSource::Fetch)?;
                    Ok(data)
                }
                Err(error) => {
                    metrics.record_fetch_failure(&owned_key);
                    if error.is_not_found() {
                        store.remove_with_reason(&owned_key, RemovalReason::NotFound);
                    }
                    debug!(key = %owned_key, error = %error, "Fetch failed");
                    Err(error)
                }
            }
        });

        if handle.is_joined() {
            self.metrics().record_dedup_join();
        }
        handle
    }

    async fn fetch<F: Fetcher>(
        &self,
        key: &str,
        fetcher: F,
        entry_options: EntryOptions,
        retry: RetryPolicy,
        options: &ReadOptions,
    ) -> Result<Value> {
        let handle = self.start_fetch(key, fetcher, entry_options, retry);
        match &options.cancel {
            Some(token) => handle.wait_or_cancel(token).await,
            None => handle.wait().await,
        }
    }

    /// Schedule a background refresh without waiting for it.
    fn revalidate<F: Fetcher>(
        &self,
        key: &str,
        fetcher: F,
        entry_options: EntryOptions,
        retry: RetryPolicy,
        options: &ReadOptions,
    ) {
        let handle = self.start_fetch(key, fetcher, entry_options, retry);
        if handle.is_joined() {
            debug!(key = %key, "Background refresh already inflight");
            return;
        }
        self.metrics().record_background_refresh();
        debug!(key = %key, "Background refresh scheduled");

        let on_error = options.on_error.clone();
        let metrics = Arc::clone(self.store.metrics());
        let key = key.to_string();
        tokio::spawn(async move {
            if let Err(error) = handle.wait().await {
                metrics.record_soft_failure();
                warn!(key = %key, error = %error, "Background refresh failed");
                if let Some(callback) = on_error {
                    callback(&key, &error);
                }
            }
        });
    }

    /// Degrade a failed fetch to a soft failure when a cached value exists.
    fn fall_back(
        &self,
        key: &str,
        cached: Option<CacheEntry>,
        error: Error,
        options: &ReadOptions,
    ) -> Result<QueryResult> {
        if error.is_not_found() || matches!(error, Error::Cancelled(_)) {
            return Err(error);
        }
        match cached {
            Some(entry) if options.fallback_to_stale => {
                self.metrics().record_soft_failure();
                warn!(key = %key, error = %error, "Fetch failed, serving cached data");
                options.report(key, &error);
                Ok(QueryResult {
                    data: entry.into_data(),
                    source: ResultSource::StaleFallback,
                    stale: true,
                    revalidating: false,
                })
            }
            _ => Err(error),
        }
    }
}

impl std::fmt::Debug for QueryCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryCoordinator")
            .field("inflight", &self.inflight)
            .field("retry", &self.retry)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn coordinator() -> QueryCoordinator {
        QueryCoordinator::new(
            Arc::new(CacheStore::default()),
            InflightRegistry::new(),
            PolicyResolver::default(),
            RetryPolicy::default(),
        )
    }

    fn counting(calls: &Arc<AtomicUsize>, value: Value) -> impl Fetcher {
        let calls = Arc::clone(calls);
        move || {
            let calls = Arc::clone(&calls);
            let value = value.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(value)
            }
        }
    }

    fn failing(calls: &Arc<AtomicUsize>, error: Error) -> impl Fetcher {
        let calls = Arc::clone(calls);
        move || {
            let calls = Arc::clone(&calls);
            let error = error.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(error)
            }
        }
    }

    fn seed(coordinator: &QueryCoordinator, key: &str, data: Value) {
        coordinator
            .store()
            .set(key, data, EntryOptions::from_millis(5000, 60_000).unwrap())
            .unwrap();
    }

    async fn settle(coordinator: &QueryCoordinator, key: &str) {
        if let Some(handle) = coordinator.inflight().join(key) {
            let _ = handle.wait().await;
        }
    }

    #[test]
    fn test_strategy_parse_and_display() {
        for strategy in [
            ReadStrategy::CacheFirst,
            ReadStrategy::NetworkFirst,
            ReadStrategy::CacheOnly,
            ReadStrategy::NetworkOnly,
            ReadStrategy::StaleWhileRevalidate,
        ] {
            assert_eq!(strategy.as_str().parse::<ReadStrategy>().unwrap(), strategy);
        }
        assert_eq!(ReadStrategy::default(), ReadStrategy::StaleWhileRevalidate);
        assert!("eventually".parse::<ReadStrategy>().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cache_first_fresh_hit_skips_fetcher() {
        let coordinator = coordinator();
        let calls = Arc::new(AtomicUsize::new(0));
        seed(&coordinator, "post:1", json!({"id": 1}));

        tokio::time::advance(Duration::from_millis(2000)).await;
        let result = coordinator
            .read_detailed(
                "post:1",
                counting(&calls, json!({"id": 2})),
                ReadOptions::new().with_strategy(ReadStrategy::CacheFirst),
            )
            .await
            .unwrap();

        assert_eq!(result.data, json!({"id": 1}));
        assert_eq!(result.source, ResultSource::Cache);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_while_revalidate() {
        let coordinator = coordinator();
        let calls = Arc::new(AtomicUsize::new(0));
        seed(&coordinator, "post:1", json!({"id": 1}));

        tokio::time::advance(Duration::from_millis(6000)).await;
        let result = coordinator
            .read_detailed("post:1", counting(&calls, json!({"id": 2})), ReadOptions::new())
            .await
            .unwrap();

        assert_eq!(result.data, json!({"id": 1}));
        assert!(result.stale);
        assert!(result.revalidating);

        settle(&coordinator, "post:1").await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let next = coordinator
            .read("post:1", counting(&calls, json!({"id": 3})), ReadOptions::new())
            .await
            .unwrap();
        assert_eq!(next, json!({"id": 2}));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(coordinator.store().metrics().snapshot().background_refreshes, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_reads_fetch_once() {
        let coordinator = coordinator();
        let calls = Arc::new(AtomicUsize::new(0));
        let slow = {
            let calls = Arc::clone(&calls);
            move || {
                let calls = Arc::clone(&calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    Ok(json!("v"))
                }
            }
        };

        let (a, b, c) = tokio::join!(
            coordinator.read("k", slow.clone(), ReadOptions::new()),
            coordinator.read("k", slow.clone(), ReadOptions::new()),
            coordinator.read("k", slow, ReadOptions::new()),
        );

        assert_eq!(a.unwrap(), json!("v"));
        assert_eq!(b.unwrap(), json!("v"));
        assert_eq!(c.unwrap(), json!("v"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(coordinator.store().metrics().snapshot().dedup_joins, 2);
        assert!(coordinator.inflight().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_are_retried() {
        let coordinator = coordinator();
        let calls = Arc::new(AtomicUsize::new(0));
        let flaky = {
            let calls = Arc::clone(&calls);
            move || {
                let calls = Arc::clone(&calls);
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                        Err(Error::TransientNetwork("reset".into()))
                    } else {
                        Ok(json!("ok"))
                    }
                }
            }
        };

        let data = coordinator.read("k", flaky, ReadOptions::new()).await.unwrap();
        assert_eq!(data, json!("ok"));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(coordinator.store().metrics().snapshot().retries, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_validation_failure_is_not_retried() {
        let coordinator = coordinator();
        let calls = Arc::new(AtomicUsize::new(0));

        let result = coordinator
            .read("k", failing(&calls, Error::Validation("bad".into())), ReadOptions::new())
            .await;

        assert_matches!(result, Err(Error::Validation(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cache_first_stale_falls_back_on_failure() {
        let coordinator = coordinator();
        let calls = Arc::new(AtomicUsize::new(0));
        let reported = Arc::new(Mutex::new(Vec::new()));
        seed(&coordinator, "k", json!("old"));
        tokio::time::advance(Duration::from_millis(6000)).await;

        let sink = Arc::clone(&reported);
        let result = coordinator
            .read_detailed(
                "k",
                failing(&calls, Error::Validation("rejected".into())),
                ReadOptions::new()
                    .with_strategy(ReadStrategy::CacheFirst)
                    .on_error(move |key, err| sink.lock().push((key.to_string(), err.clone()))),
            )
            .await
            .unwrap();

        assert_eq!(result.data, json!("old"));
        assert_eq!(result.source, ResultSource::StaleFallback);
        assert_eq!(
            *reported.lock(),
            vec![("k".to_string(), Error::Validation("rejected".into()))]
        );
        assert_eq!(coordinator.store().metrics().snapshot().soft_failures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fallback_can_be_disabled() {
        let coordinator = coordinator();
        let calls = Arc::new(AtomicUsize::new(0));
        seed(&coordinator, "k", json!("old"));
        tokio::time::advance(Duration::from_millis(6000)).await;

        let result = coordinator
            .read(
                "k",
                failing(&calls, Error::Validation("rejected".into())),
                ReadOptions::new()
                    .with_strategy(ReadStrategy::CacheFirst)
                    .without_stale_fallback(),
            )
            .await;
        assert_matches!(result, Err(Error::Validation(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_miss_with_failure_is_hard() {
        let coordinator = coordinator();
        let calls = Arc::new(AtomicUsize::new(0));

        let result = coordinator
            .read(
                "k",
                failing(&calls, Error::TransientNetwork("down".into())),
                ReadOptions::new().with_retry(RetryPolicy::none()),
            )
            .await;

        assert_matches!(result, Err(Error::TransientNetwork(_)));
        assert!(!coordinator.store().contains("k"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_network_only_writes_back_and_fails_hard() {
        let coordinator = coordinator();
        let calls = Arc::new(AtomicUsize::new(0));
        seed(&coordinator, "k", json!("cached"));

        let data = coordinator
            .read(
                "k",
                counting(&calls, json!("fresh")),
                ReadOptions::new().with_strategy(ReadStrategy::NetworkOnly),
            )
            .await
            .unwrap();
        assert_eq!(data, json!("fresh"));
        assert_eq!(coordinator.store().peek("k").unwrap().data(), &json!("fresh"));

        let result = coordinator
            .read(
                "k",
                failing(&calls, Error::Validation("no".into())),
                ReadOptions::new().with_strategy(ReadStrategy::NetworkOnly),
            )
            .await;
        assert_matches!(result, Err(Error::Validation(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_network_first_falls_back_to_cache() {
        let coordinator = coordinator();
        let calls = Arc::new(AtomicUsize::new(0));
        seed(&coordinator, "k", json!("cached"));

        let result = coordinator
            .read_detailed(
                "k",
                failing(&calls, Error::Validation("no".into())),
                ReadOptions::new().with_strategy(ReadStrategy::NetworkFirst),
            )
            .await
            .unwrap();
        assert_eq!(result.data, json!("cached"));
        assert_eq!(result.source, ResultSource::StaleFallback);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cache_only_never_fetches() {
        let coordinator = coordinator();
        let calls = Arc::new(AtomicUsize::new(0));
        let options = ReadOptions::new().with_strategy(ReadStrategy::CacheOnly);

        let miss = coordinator
            .read("k", counting(&calls, json!(1)), options.clone())
            .await;
        assert_matches!(miss, Err(Error::CacheMiss(_)));

        seed(&coordinator, "k", json!("cached"));
        let hit = coordinator
            .read("k", counting(&calls, json!(1)), options)
            .await
            .unwrap();
        assert_eq!(hit, json!("cached"));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_not_found_removes_entry_and_is_not_served_stale() {
        let coordinator = coordinator();
        let calls = Arc::new(AtomicUsize::new(0));
        seed(&coordinator, "post:9", json!("gone soon"));
        tokio::time::advance(Duration::from_millis(6000)).await;

        let result = coordinator
            .read(
                "post:9",
                failing(&calls, Error::NotFound("post:9".into())),
                ReadOptions::new().with_strategy(ReadStrategy::CacheFirst),
            )
            .await;

        assert_matches!(result, Err(Error::NotFound(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!coordinator.store().contains("post:9"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_read_still_populates_cache() {
        let coordinator = coordinator();
        let slow = || async {
            tokio::time::sleep(Duration::from_millis(500)).await;
            Ok(json!("late"))
        };
        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            canceller.cancel();
        });

        let result = coordinator
            .read("k", slow, ReadOptions::new().with_cancel(cancel))
            .await;
        assert_matches!(result, Err(Error::Cancelled(_)));

        settle(&coordinator, "k").await;
        assert_eq!(coordinator.store().peek("k").unwrap().data(), &json!("late"));
    }

    #[tokio::test]
    async fn test_read_as_typed() {
        #[derive(Debug, PartialEq, serde::Deserialize)]
        struct Post {
            id: u64,
            title: String,
        }

        let coordinator = coordinator();
        let calls = Arc::new(AtomicUsize::new(0));
        let post: Post = coordinator
            .read_as(
                "post:1",
                counting(&calls, json!({"id": 1, "title": "hello"})),
                ReadOptions::new(),
            )
            .await
            .unwrap();
        assert_eq!(
            post,
            Post {
                id: 1,
                title: "hello".into()
            }
        );
    }

    #[tokio::test]
    async fn test_prefetch_skips_fresh_entries() {
        let coordinator = coordinator();
        let calls = Arc::new(AtomicUsize::new(0));

        coordinator
            .prefetch("k", counting(&calls, json!(1)), ReadOptions::new())
            .await
            .unwrap();
        coordinator
            .prefetch("k", counting(&calls, json!(2)), ReadOptions::new())
            .await
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(coordinator.store().peek("k").unwrap().data(), &json!(1));
    }

    #[tokio::test]
    async fn test_invalid_ttl_override_rejected() {
        let coordinator = coordinator();
        let calls = Arc::new(AtomicUsize::new(0));
        let result = coordinator
            .read(
                "k",
                counting(&calls, json!(1)),
                ReadOptions::new()
                    .with_stale_after(Duration::from_secs(10))
                    .with_evict_after(Duration::from_secs(1)),
            )
            .await;
        assert_matches!(result, Err(Error::InvalidOptions(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_long_stale_override_extends_inherited_eviction() {
        let coordinator = coordinator();
        let calls = Arc::new(AtomicUsize::new(0));
        let long = Duration::from_secs(600);
        seed(&coordinator, "cached", json!("v"));

        let hit = coordinator
            .read(
                "cached",
                counting(&calls, json!(1)),
                ReadOptions::new()
                    .with_strategy(ReadStrategy::CacheOnly)
                    .with_stale_after(long),
            )
            .await
            .unwrap();
        assert_eq!(hit, json!("v"));

        coordinator
            .read("fetched", counting(&calls, json!(2)), ReadOptions::new().with_stale_after(long))
            .await
            .unwrap();
        let options = coordinator.store().peek("fetched").unwrap().options();
        assert_eq!(options.stale_after, long);
        assert_eq!(options.evict_after, long.max(EntryOptions::default().evict_after));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
