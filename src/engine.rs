//! Sync Engine
//!
//! Composition root. Builds one shared store, metrics collector and inflight
//! registry, and hands them to every coordinator:
//!
//! ```text
//!                    ┌──────────────────────┐
//!   read ──────────► │   QueryCoordinator   │──┐
//!                    └──────────────────────┘  │
//!                    ┌──────────────────────┐  │    ┌────────────┐
//!   mutate ────────► │ MutationCoordinator  │──┼──► │ CacheStore │──► subscribers
//!                    └──────────┬───────────┘  │    └────────────┘
//!                    ┌──────────▼───────────┐  │          ▲
//!   invalidate ────► │ InvalidationEngine   │──┘          │
//!                    └──────────────────────┘             │
//!                    ┌──────────────────────┐             │
//!   PushTransport ─► │ RealtimeSyncBridge   │─────────────┘
//!                    └──────────────────────┘
//! ```

use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::adapters::local_transport::LocalPushTransport;
use crate::cache::{CacheStore, InvalidationEngine, MetricsCollector, MetricsSnapshot, Subscription};
use crate::config::{EngineConfig, PolicyResolver};
use crate::domain::events::CacheEvent;
use crate::domain::ports::{Fetcher, PushTransport};
use crate::error::Result;
use crate::mutation::{MutationCoordinator, MutationOptions};
use crate::query::{InflightRegistry, QueryCoordinator, ReadOptions};
use crate::realtime::{RealtimeSyncBridge, StrategyMap};

/// Every engine component wired over a single store.
pub struct SyncEngine {
    config: EngineConfig,
    policies: PolicyResolver,
    store: Arc<CacheStore>,
    invalidation: Arc<InvalidationEngine>,
    queries: QueryCoordinator,
    mutations: MutationCoordinator,
    bridge: Arc<RealtimeSyncBridge>,
    shutdown: CancellationToken,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl SyncEngine {
    /// Validate `config` and build the engine around `transport`.
    pub fn new(config: EngineConfig, transport: Arc<dyn PushTransport>) -> Result<Self> {
        config.validate()?;
        let policies = config.resolver()?;

        let metrics = Arc::new(MetricsCollector::new());
        let store = Arc::new(CacheStore::new(config.default_entry_options()?, metrics));
        let invalidation = Arc::new(InvalidationEngine::new(Arc::clone(&store)));

        let queries = QueryCoordinator::new(
            Arc::clone(&store),
            InflightRegistry::new(),
            policies.clone(),
            config.retry,
        );
        let mutations = MutationCoordinator::new(Arc::clone(&store), Arc::clone(&invalidation));
        let bridge = Arc::new(RealtimeSyncBridge::new(
            Arc::clone(&store),
            transport,
            policies.clone(),
            config.bridge.clone(),
        ));

        info!(
            key_classes = config.key_classes.len(),
            strategy = %config.default_strategy,
            "Sync engine initialized"
        );

        Ok(Self {
            config,
            policies,
            store,
            invalidation,
            queries,
            mutations,
            bridge,
            shutdown: CancellationToken::new(),
            sweeper: Mutex::new(None),
        })
    }

    /// Build with an in-process transport, returned for publishing.
    pub fn with_local_transport(config: EngineConfig) -> Result<(Self, Arc<LocalPushTransport>)> {
        let transport = Arc::new(LocalPushTransport::new());
        let engine = Self::new(config, transport.clone())?;
        Ok((engine, transport))
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn policies(&self) -> &PolicyResolver {
        &self.policies
    }

    pub fn store(&self) -> &Arc<CacheStore> {
        &self.store
    }

    pub fn metrics(&self) -> &Arc<MetricsCollector> {
        self.store.metrics()
    }

    pub fn invalidation(&self) -> &Arc<InvalidationEngine> {
        &self.invalidation
    }

    pub fn queries(&self) -> &QueryCoordinator {
        &self.queries
    }

    pub fn mutations(&self) -> &MutationCoordinator {
        &self.mutations
    }

    pub fn bridge(&self) -> &Arc<RealtimeSyncBridge> {
        &self.bridge
    }

    // -------------------------------------------------------------------------
    // Shortcuts
    // -------------------------------------------------------------------------

    pub async fn read<F: Fetcher>(&self, key: &str, fetcher: F, options: ReadOptions) -> Result<Value> {
        self.queries.read(key, fetcher, options).await
    }

    pub async fn mutate<A, F, Fut>(&self, operation: F, args: A, options: MutationOptions) -> Result<Value>
    where
        F: FnOnce(A) -> Fut,
        Fut: std::future::Future<Output = Result<Value>>,
    {
        self.mutations.mutate(operation, args, options).await
    }

    pub fn invalidate(&self, pattern: &str) -> Result<Vec<String>> {
        self.invalidation.invalidate(pattern)
    }

    pub fn subscribe<F>(&self, key: &str, callback: F) -> Subscription
    where
        F: Fn(&CacheEvent) + Send + Sync + 'static,
    {
        self.store.subscribe(key, callback)
    }

    pub async fn bind<I, S>(&self, key: &str, topics: I, strategies: impl Into<StrategyMap>) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.bridge.bind(key, topics, strategies).await
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        self.metrics().snapshot()
    }

    // -------------------------------------------------------------------------
    // Lifecycle
    // -------------------------------------------------------------------------

    /// Start the background expiry sweep. False if already running.
    pub fn start_sweeper(&self) -> bool {
        let mut sweeper = self.sweeper.lock();
        if sweeper.is_some() {
            return false;
        }
        let interval = self.config.sweep_interval();
        *sweeper = Some(self.store.spawn_sweeper(interval, self.shutdown.child_token()));
        debug!(interval_ms = interval.as_millis() as u64, "Expiry sweeper started");
        true
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Stop background work and wait for the sweeper to exit.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let handle = self.sweeper.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        info!("Sync engine stopped");
    }
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("store", &self.store)
            .field("bridge", &self.bridge)
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}
