//! Invalidation Engine
//!
//! Translates invalidation patterns into the set of affected keys and
//! removes (or flags) them in the store.
//!
//! ```text
//! invalidate("post:*")
//!        │
//!        ▼
//! ┌──────────────────┐  miss   ┌──────────────────┐
//! │  compiled cache  │ ──────► │ PatternMatcher:: │
//! │  (DashMap)       │ ◄────── │ compile          │
//! └──────────────────┘         └──────────────────┘
//!        │ matcher
//!        ▼
//! ┌──────────────────┐
//! │ CacheStore::keys │ ──► filter ──► remove_many / mark_many_stale
//! └──────────────────┘
//! ```

use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, instrument};

use super::pattern::PatternMatcher;
use super::store::CacheStore;
use crate::domain::events::RemovalReason;
use crate::error::Result;

/// Upper bound on distinct compiled patterns kept around
pub const MAX_COMPILED_PATTERNS: usize = 1024;

/// What happens to matching keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InvalidationMode {
    /// Delete the entry; subscribers see `Invalidated`
    #[default]
    Remove,
    /// Keep serving the entry but force the next read to refresh
    MarkStale,
}

/// Pattern-based invalidation over a shared store
pub struct InvalidationEngine {
    store: Arc<CacheStore>,
    compiled: DashMap<String, Arc<PatternMatcher>>,
}

impl InvalidationEngine {
    pub fn new(store: Arc<CacheStore>) -> Self {
        Self {
            store,
            compiled: DashMap::new(),
        }
    }

    /// Remove every key matching `pattern`. Returns the removed keys.
    #[instrument(skip(self), fields(pattern = %pattern))]
    pub fn invalidate(&self, pattern: &str) -> Result<Vec<String>> {
        self.invalidate_with(pattern, InvalidationMode::Remove)
    }

    /// Apply `mode` to every key matching `pattern`. Returns the affected keys.
    pub fn invalidate_with(&self, pattern: &str, mode: InvalidationMode) -> Result<Vec<String>> {
        let affected = match self.matcher(pattern)?.as_ref() {
            // Exact keys skip the scan
            PatternMatcher::Exact(key) => match mode {
                InvalidationMode::Remove => {
                    if self.store.remove_with_reason(key, RemovalReason::Invalidated) {
                        vec![key.clone()]
                    } else {
                        Vec::new()
                    }
                }
                InvalidationMode::MarkStale => {
                    if self.store.mark_stale(key) {
                        vec![key.clone()]
                    } else {
                        Vec::new()
                    }
                }
            },
            matcher => {
                let matched = matcher.filter(&self.store.keys());
                match mode {
                    InvalidationMode::Remove => {
                        self.store.remove_many(&matched, RemovalReason::Invalidated)
                    }
                    InvalidationMode::MarkStale => self.store.mark_many_stale(&matched),
                }
            }
        };

        if mode == InvalidationMode::Remove {
            self.store.metrics().record_invalidated(affected.len() as u64);
        }
        debug!(
            pattern = %pattern,
            mode = ?mode,
            affected = affected.len(),
            "Invalidation applied"
        );
        Ok(affected)
    }

    /// Invalidate several patterns in order; stops at the first bad pattern.
    pub fn invalidate_all<I, S>(&self, patterns: I) -> Result<Vec<String>>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut affected = Vec::new();
        for pattern in patterns {
            affected.extend(self.invalidate(pattern.as_ref())?);
        }
        Ok(affected)
    }

    /// Keys currently matching `pattern`, without touching them.
    pub fn matching_keys(&self, pattern: &str) -> Result<Vec<String>> {
        Ok(self.matcher(pattern)?.filter(&self.store.keys()))
    }

    /// Number of cached compiled patterns
    pub fn compiled_patterns(&self) -> usize {
        self.compiled.len()
    }

    fn matcher(&self, pattern: &str) -> Result<Arc<PatternMatcher>> {
        if let Some(matcher) = self.compiled.get(pattern) {
            return Ok(Arc::clone(matcher.value()));
        }

        let matcher = Arc::new(PatternMatcher::compile(pattern)?);
        if self.compiled.len() >= MAX_COMPILED_PATTERNS {
            self.compiled.clear();
        }
        self.compiled
            .insert(pattern.to_string(), Arc::clone(&matcher));
        Ok(matcher)
    }
}

impl std::fmt::Debug for InvalidationEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InvalidationEngine")
            .field("compiled_patterns", &self.compiled.len())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::events::CacheEvent;
    use parking_lot::Mutex;
    use serde_json::json;

    fn seeded() -> (Arc<CacheStore>, InvalidationEngine) {
        let store = Arc::new(CacheStore::default());
        for key in ["post:1", "post:2", "post:1:comments", "user:1", "feed"] {
            store.set_with_defaults(key, json!(key)).unwrap();
        }
        let engine = InvalidationEngine::new(Arc::clone(&store));
        (store, engine)
    }

    #[test]
    fn test_exact_invalidation() {
        let (store, engine) = seeded();

        assert_eq!(engine.invalidate("post:1").unwrap(), vec!["post:1".to_string()]);
        assert!(!store.contains("post:1"));
        assert!(store.contains("post:1:comments"));
    }

    #[test]
    fn test_wildcard_invalidation_single_segment() {
        let (store, engine) = seeded();

        let mut removed = engine.invalidate("post:*").unwrap();
        removed.sort();
        assert_eq!(removed, vec!["post:1".to_string(), "post:2".to_string()]);
        assert!(store.contains("post:1:comments"));
        assert!(store.contains("user:1"));
    }

    #[test]
    fn test_invalidate_twice_is_noop() {
        let (store, engine) = seeded();

        engine.invalidate("post:*").unwrap();
        let keys_after_first = store.keys();

        assert!(engine.invalidate("post:*").unwrap().is_empty());
        assert_eq!(store.keys(), keys_after_first);
    }

    #[test]
    fn test_compilation_is_cached() {
        let (_store, engine) = seeded();

        engine.invalidate("post:*").unwrap();
        engine.invalidate("post:*").unwrap();
        engine.invalidate("user:*").unwrap();

        assert_eq!(engine.compiled_patterns(), 2);
    }

    #[test]
    fn test_mark_stale_mode_keeps_entries() {
        let (store, engine) = seeded();

        let marked = engine
            .invalidate_with("post:*", InvalidationMode::MarkStale)
            .unwrap();

        assert_eq!(marked.len(), 2);
        assert!(store.contains("post:1"));
        assert!(store.is_stale("post:1", None));
        assert!(!store.is_stale("user:1", None));
    }

    #[test]
    fn test_invalidate_all_and_matching_keys() {
        let (store, engine) = seeded();

        assert_eq!(
            engine.matching_keys("user:*").unwrap(),
            vec!["user:1".to_string()]
        );
        assert!(store.contains("user:1"));

        let removed = engine.invalidate_all(["user:*", "feed"]).unwrap();
        assert_eq!(removed.len(), 2);
        assert_eq!(store.len(), 3);
    }

    #[test]
    fn test_subscribers_see_invalidated() {
        let (store, engine) = seeded();
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let _sub = store.subscribe("post:2", move |e| sink.lock().push(e.clone()));

        engine.invalidate("post:*").unwrap();

        assert_eq!(
            *events.lock(),
            vec![CacheEvent::invalidated("post:2", RemovalReason::Invalidated)]
        );
        assert_eq!(store.metrics().snapshot().invalidated_keys, 2);
    }
}
