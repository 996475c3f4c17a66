//! Property-Based Tests for the Cache Layer
//!
//! # Test Properties
//!
//! 1. **Pattern Determinism**: same pattern + same key set = same result
//! 2. **Segment Confinement**: `*` never matches across a `:`
//! 3. **Invalidation Idempotence**: a second `invalidate` is a no-op
//! 4. **Restore Exactness**: restoring a snapshot yields identical entries

#![cfg(test)]

use std::sync::Arc;

use proptest::prelude::*;
use serde_json::json;

use super::entry::CacheEntry;
use super::invalidation::InvalidationEngine;
use super::pattern::PatternMatcher;
use super::store::CacheStore;

// =============================================================================
// Property Strategies
// =============================================================================

/// A single key segment: short lowercase/digit runs.
fn segment_strategy() -> impl Strategy<Value = String> {
    "[a-z0-9]{1,4}"
}

/// Keys with one to three segments.
fn key_strategy() -> impl Strategy<Value = String> {
    prop::collection::vec(segment_strategy(), 1..=3).prop_map(|s| s.join(":"))
}

fn key_set_strategy() -> impl Strategy<Value = Vec<String>> {
    prop::collection::vec(key_strategy(), 0..40).prop_map(|mut keys| {
        keys.sort();
        keys.dedup();
        keys
    })
}

/// Patterns where each segment is literal, `*`, or a prefix followed by `*`.
fn pattern_strategy() -> impl Strategy<Value = String> {
    let segment = prop_oneof![
        segment_strategy(),
        Just("*".to_string()),
        segment_strategy().prop_map(|s| format!("{}*", s)),
    ];
    prop::collection::vec(segment, 1..=3).prop_map(|s| s.join(":"))
}

fn seeded_store(keys: &[String]) -> Arc<CacheStore> {
    let store = Arc::new(CacheStore::default());
    for (i, key) in keys.iter().enumerate() {
        store.set_with_defaults(key, json!({ "n": i })).unwrap();
    }
    store
}

fn entries(store: &CacheStore) -> Vec<CacheEntry> {
    store.keys().iter().filter_map(|k| store.peek(k)).collect()
}

// =============================================================================
// Pattern Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    #[test]
    fn prop_pattern_matching_is_deterministic(
        pattern in pattern_strategy(),
        keys in key_set_strategy(),
    ) {
        let first = PatternMatcher::compile(&pattern).unwrap().filter(&keys);
        let second = PatternMatcher::compile(&pattern).unwrap().filter(&keys);
        prop_assert_eq!(first, second);
    }

    #[test]
    fn prop_wildcard_matches_preserve_segment_count(
        pattern in pattern_strategy(),
        keys in key_set_strategy(),
    ) {
        let matcher = PatternMatcher::compile(&pattern).unwrap();
        let segments = pattern.split(':').count();
        for key in matcher.filter(&keys) {
            prop_assert_eq!(key.split(':').count(), segments);
        }
    }

    #[test]
    fn prop_exact_pattern_matches_only_itself(
        key in key_strategy(),
        keys in key_set_strategy(),
    ) {
        let matcher = PatternMatcher::compile(&key).unwrap();
        for other in matcher.filter(&keys) {
            prop_assert_eq!(&other, &key);
        }
    }
}

// =============================================================================
// Store Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(50))]

    #[test]
    fn prop_invalidate_is_idempotent(
        pattern in pattern_strategy(),
        keys in key_set_strategy(),
    ) {
        let store = seeded_store(&keys);
        let engine = InvalidationEngine::new(Arc::clone(&store));

        engine.invalidate(&pattern).unwrap();
        let after_first = entries(&store);

        let second = engine.invalidate(&pattern).unwrap();
        prop_assert!(second.is_empty());
        prop_assert_eq!(entries(&store), after_first);
    }

    #[test]
    fn prop_restore_is_exact(
        keys in key_set_strategy(),
        touched in key_set_strategy(),
    ) {
        let store = seeded_store(&keys);
        let before = entries(&store);

        let prior: Vec<_> = touched
            .iter()
            .map(|k| (k.clone(), store.peek(k)))
            .collect();
        for key in &touched {
            store.set_with_defaults(key, json!("optimistic")).unwrap();
        }
        store.restore(&prior);

        prop_assert_eq!(entries(&store), before);
    }
}
