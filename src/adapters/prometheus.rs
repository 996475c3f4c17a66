//! Prometheus Exporter
//!
//! Publishes a [`MetricsSnapshot`] through a private Prometheus registry.
//! Values are refreshed from the collector on every render, so scrapes
//! always see current counters without the hot path touching Prometheus.

use std::sync::Arc;

use prometheus::{Encoder, Gauge, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder};

use crate::cache::metrics::MetricsSnapshot;
use crate::cache::store::CacheStore;
use crate::error::{Error, Result};

const NAMESPACE: &str = "querysync";

fn prom_err(e: prometheus::Error) -> Error {
    Error::Internal(format!("Prometheus error: {}", e))
}

/// Prometheus view over the engine's metrics.
pub struct PrometheusExporter {
    store: Arc<CacheStore>,
    registry: Registry,
    operations: IntGaugeVec,
    hit_ratio: Gauge,
    fetch_latency_us: IntGauge,
    entries: IntGauge,
    tracked_keys: IntGauge,
}

impl PrometheusExporter {
    pub fn new(store: Arc<CacheStore>) -> Result<Self> {
        let registry = Registry::new();

        let operations = IntGaugeVec::new(
            Opts::new("operations_total", "Engine operation counters by kind").namespace(NAMESPACE),
            &["kind"],
        )
        .map_err(prom_err)?;
        let hit_ratio = Gauge::with_opts(
            Opts::new("cache_hit_ratio", "Fraction of reads served from cache").namespace(NAMESPACE),
        )
        .map_err(prom_err)?;
        let fetch_latency_us = IntGauge::with_opts(
            Opts::new(
                "fetch_latency_microseconds",
                "Exponential moving average of fetch latency",
            )
            .namespace(NAMESPACE),
        )
        .map_err(prom_err)?;
        let entries = IntGauge::with_opts(
            Opts::new("cache_entries", "Entries currently held by the store").namespace(NAMESPACE),
        )
        .map_err(prom_err)?;
        let tracked_keys = IntGauge::with_opts(
            Opts::new("tracked_keys", "Keys with per-key metrics").namespace(NAMESPACE),
        )
        .map_err(prom_err)?;

        registry.register(Box::new(operations.clone())).map_err(prom_err)?;
        registry.register(Box::new(hit_ratio.clone())).map_err(prom_err)?;
        registry
            .register(Box::new(fetch_latency_us.clone()))
            .map_err(prom_err)?;
        registry.register(Box::new(entries.clone())).map_err(prom_err)?;
        registry
            .register(Box::new(tracked_keys.clone()))
            .map_err(prom_err)?;

        Ok(Self {
            store,
            registry,
            operations,
            hit_ratio,
            fetch_latency_us,
            entries,
            tracked_keys,
        })
    }

    /// Copy the current snapshot into the registry.
    pub fn refresh(&self) {
        let snapshot = self.store.metrics().snapshot();
        for (kind, value) in counters(&snapshot) {
            self.operations
                .with_label_values(&[kind])
                .set(value.min(i64::MAX as u64) as i64);
        }
        self.hit_ratio.set(snapshot.hit_ratio);
        self.fetch_latency_us
            .set(snapshot.fetch_latency_us.min(i64::MAX as u64) as i64);
        self.entries.set(self.store.len() as i64);
        self.tracked_keys.set(snapshot.tracked_keys as i64);
    }

    /// Refresh and encode in the Prometheus text format.
    pub fn render(&self) -> Result<String> {
        self.refresh();
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(prom_err)?;
        String::from_utf8(buffer).map_err(|e| Error::Internal(e.to_string()))
    }

    pub fn content_type(&self) -> String {
        TextEncoder::new().format_type().to_string()
    }
}

impl std::fmt::Debug for PrometheusExporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrometheusExporter").finish_non_exhaustive()
    }
}

fn counters(s: &MetricsSnapshot) -> [(&'static str, u64); 20] {
    [
        ("hit", s.hits),
        ("miss", s.misses),
        ("stale_hit", s.stale_hits),
        ("fetch", s.fetches),
        ("fetch_failure", s.fetch_failures),
        ("retry", s.retries),
        ("dedup_join", s.dedup_joins),
        ("background_refresh", s.background_refreshes),
        ("soft_failure", s.soft_failures),
        ("mutation", s.mutations),
        ("commit", s.commits),
        ("rollback", s.rollbacks),
        ("invalidated_key", s.invalidated_keys),
        ("eviction", s.evictions),
        ("push_applied", s.push_applied),
        ("push_skipped", s.push_skipped),
        ("push_duplicate", s.push_duplicates),
        ("push_out_of_order", s.push_out_of_order),
        ("read", s.hits + s.misses),
        ("push_received", s.push_applied + s.push_skipped + s.push_duplicates + s.push_out_of_order),
    ]
}
