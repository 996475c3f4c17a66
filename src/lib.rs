//! QuerySync - Client-Side Data Synchronization Engine
//!
//! Keeps a local cache of remote data consistent with an authoritative
//! source while serving reads with minimal latency.
//!
//! # Architecture
//!
//! Four coordinators share one cache store:
//!
//! ```text
//! QueryCoordinator (reads) ─┐
//! MutationCoordinator ──────┼──► CacheStore ──► subscribers
//! InvalidationEngine ───────┤
//! RealtimeSyncBridge (push)─┘
//! ```
//!
//! # Features
//!
//! - Cache-first, network-first and stale-while-revalidate reads
//! - Request deduplication across concurrent readers
//! - Optimistic mutations with snapshot rollback
//! - Pattern-based invalidation with `*` wildcards
//! - Push updates (replace, merge, append, prepend, remove, invalidate)
//! - Freshness policies per key class
//! - Prometheus exposition of engine metrics
//!
//! # Modules
//!
//! - [`adapters`] - In-process push transport, JSON-lines feed, Prometheus exporter
//! - [`cache`] - Store, entries, patterns, invalidation and metrics
//! - [`config`] - Engine configuration and key class policies
//! - [`domain`] - Ports and events
//! - [`engine`] - Composition root
//! - [`error`] - Error types
//! - [`mutation`] - Optimistic mutations and snapshots
//! - [`query`] - Reads, inflight dedup and retry
//! - [`realtime`] - Push update strategies and the sync bridge

pub mod adapters;
pub mod cache;
pub mod config;
pub mod domain;
pub mod engine;
pub mod error;
pub mod mutation;
pub mod query;
pub mod realtime;

// Re-export commonly used types
pub use cache::{CacheEntry, CacheStore, EntryOptions, InvalidationEngine, MetricsCollector};
pub use config::{EngineConfig, KeyClassPolicy};
pub use domain::{CacheEvent, PushMessage, PushTransport};
pub use engine::SyncEngine;
pub use error::{Error, Result};
pub use mutation::{MutationCoordinator, MutationOptions, OptimisticWrite};
pub use query::{QueryCoordinator, ReadOptions, ReadStrategy, RetryPolicy};
pub use realtime::{RealtimeSyncBridge, StrategyMap, UpdateStrategy};
