//! Mutation Coordinator
//!
//! Two-phase writes with guaranteed rollback.
//!
//! ```text
//! mutate(operation, args, options)
//!   1. lock affected keys (sorted order)
//!   2. snapshot ──► apply optimistic writes
//!   3. operation(args).await
//!        ├─ Ok  ──► commit rules ──► result key ──► invalidates ──► Ok(result)
//!        └─ Err ──► restore snapshot (one batch) ──► Err(original)
//!   4. unlock
//! ```
//!
//! Mutations touching overlapping keys serialize on per-key async locks, so
//! the second one snapshots only after the first has committed or rolled
//! back. Dropping the mutation future mid-flight also restores the snapshot.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, instrument, warn};

use super::snapshot::MutationSnapshot;
use crate::cache::entry::{CacheEntry, EntryOptions};
use crate::cache::invalidation::InvalidationEngine;
use crate::cache::pattern::PatternMatcher;
use crate::cache::store::{CacheStore, EntryUpdate};
use crate::domain::events::{RemovalReason, WriteSource};
use crate::error::Result;

/// Pure function of the current value
pub type UpdateFn = Arc<dyn Fn(Option<&Value>) -> Value + Send + Sync>;

/// Combine the current value with the authoritative result
pub type ReconcileFn = Arc<dyn Fn(Option<&Value>, &Value) -> Value + Send + Sync>;

/// Derive a cache key from the authoritative result
pub type ResultKeyFn = Arc<dyn Fn(&Value) -> Option<String> + Send + Sync>;

/// Speculative change applied before the operation runs.
#[derive(Clone)]
pub enum OptimisticChange {
    Set(Value),
    /// Computed under the store lock; must not call back into the store
    Update(UpdateFn),
    Remove,
}

/// What happens to an optimistically written key once the operation succeeds.
#[derive(Clone)]
pub enum CommitRule {
    /// Overwrite with the authoritative result
    ReplaceWithResult,
    /// Leave the optimistic value in place
    Keep,
    /// Drop the key (temporary placeholder)
    Remove,
    /// Merge the result into the current value
    Reconcile(ReconcileFn),
}

impl std::fmt::Debug for CommitRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ReplaceWithResult => f.write_str("ReplaceWithResult"),
            Self::Keep => f.write_str("Keep"),
            Self::Remove => f.write_str("Remove"),
            Self::Reconcile(_) => f.write_str("Reconcile(..)"),
        }
    }
}

/// One optimistic write.
#[derive(Clone)]
pub struct OptimisticWrite {
    pub key: String,
    pub change: OptimisticChange,
    pub on_commit: CommitRule,
    /// Entry options for the write; store defaults when unset
    pub options: Option<EntryOptions>,
}

impl OptimisticWrite {
    /// Set `key` to `value`; replaced by the result on commit.
    pub fn set(key: impl Into<String>, value: Value) -> Self {
        Self {
            key: key.into(),
            change: OptimisticChange::Set(value),
            on_commit: CommitRule::ReplaceWithResult,
            options: None,
        }
    }

    /// Transform the current value; kept on commit.
    pub fn update<F>(key: impl Into<String>, f: F) -> Self
    where
        F: Fn(Option<&Value>) -> Value + Send + Sync + 'static,
    {
        Self {
            key: key.into(),
            change: OptimisticChange::Update(Arc::new(f)),
            on_commit: CommitRule::Keep,
            options: None,
        }
    }

    /// Remove `key` optimistically.
    pub fn remove(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            change: OptimisticChange::Remove,
            on_commit: CommitRule::Keep,
            options: None,
        }
    }

    /// Placeholder entry removed once the operation succeeds.
    pub fn temporary(key: impl Into<String>, value: Value) -> Self {
        Self::set(key, value).on_commit(CommitRule::Remove)
    }

    pub fn on_commit(mut self, rule: CommitRule) -> Self {
        self.on_commit = rule;
        self
    }

    pub fn reconcile<F>(self, f: F) -> Self
    where
        F: Fn(Option<&Value>, &Value) -> Value + Send + Sync + 'static,
    {
        self.on_commit(CommitRule::Reconcile(Arc::new(f)))
    }

    pub fn with_options(mut self, options: EntryOptions) -> Self {
        self.options = Some(options);
        self
    }
}

impl std::fmt::Debug for OptimisticWrite {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let change = match self.change {
            OptimisticChange::Set(_) => "set",
            OptimisticChange::Update(_) => "update",
            OptimisticChange::Remove => "remove",
        };
        f.debug_struct("OptimisticWrite")
            .field("key", &self.key)
            .field("change", &change)
            .field("on_commit", &self.on_commit)
            .finish()
    }
}

/// Options for one mutation.
#[derive(Clone, Default)]
pub struct MutationOptions {
    pub optimistic: Vec<OptimisticWrite>,
    /// Patterns invalidated after a successful commit
    pub invalidates: Vec<String>,
    pub result_key: Option<ResultKeyFn>,
    pub result_options: Option<EntryOptions>,
}

impl MutationOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_optimistic(mut self, write: OptimisticWrite) -> Self {
        self.optimistic.push(write);
        self
    }

    pub fn invalidates(mut self, pattern: impl Into<String>) -> Self {
        self.invalidates.push(pattern.into());
        self
    }

    /// Write the result under the key `f` derives from it (e.g. `post:42`).
    pub fn with_result_key<F>(mut self, f: F) -> Self
    where
        F: Fn(&Value) -> Option<String> + Send + Sync + 'static,
    {
        self.result_key = Some(Arc::new(f));
        self
    }

    pub fn with_result_options(mut self, options: EntryOptions) -> Self {
        self.result_options = Some(options);
        self
    }

    /// Keys touched by optimistic writes, sorted and deduplicated.
    pub fn affected_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.optimistic.iter().map(|w| w.key.clone()).collect();
        keys.sort();
        keys.dedup();
        keys
    }

    /// Checked before any lock or write, so nothing after the operation
    /// succeeds can fail on bad input.
    fn validate(&self) -> Result<()> {
        self.optimistic
            .iter()
            .filter_map(|w| w.options.as_ref())
            .chain(self.result_options.as_ref())
            .try_for_each(EntryOptions::validate)?;
        self.invalidates
            .iter()
            .try_for_each(|pattern| PatternMatcher::compile(pattern).map(|_| ()))
    }
}

impl std::fmt::Debug for MutationOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MutationOptions")
            .field("optimistic", &self.optimistic)
            .field("invalidates", &self.invalidates)
            .field("result_key", &self.result_key.is_some())
            .finish()
    }
}

/// Successful mutation with the snapshot it discarded.
#[derive(Debug, Clone)]
pub struct MutationOutcome {
    pub result: Value,
    pub snapshot: MutationSnapshot,
}

// =============================================================================
// Key Locks
// =============================================================================

#[derive(Default)]
struct KeyLocks {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl KeyLocks {
    /// Acquire every key in order. `keys` must be sorted.
    ///
    /// The held set exists before the first await, so a caller dropped
    /// while queued still prunes the entries it created.
    async fn acquire(&self, keys: Vec<String>) -> HeldLocks<'_> {
        let mut held = HeldLocks {
            owner: self,
            guards: Vec::with_capacity(keys.len()),
            keys,
        };
        for i in 0..held.keys.len() {
            let lock = Arc::clone(self.locks.lock().entry(held.keys[i].clone()).or_default());
            held.guards.push(lock.lock_owned().await);
        }
        held
    }

    fn len(&self) -> usize {
        self.locks.lock().len()
    }
}

struct HeldLocks<'a> {
    owner: &'a KeyLocks,
    keys: Vec<String>,
    guards: Vec<OwnedMutexGuard<()>>,
}

impl Drop for HeldLocks<'_> {
    fn drop(&mut self) {
        self.guards.clear();
        // Prune locks nobody holds or waits on
        let mut locks = self.owner.locks.lock();
        for key in &self.keys {
            if locks.get(key).is_some_and(|l| Arc::strong_count(l) == 1) {
                locks.remove(key);
            }
        }
    }
}

// =============================================================================
// Rollback Guard
// =============================================================================

struct RollbackGuard<'a> {
    store: &'a CacheStore,
    snapshot: &'a MutationSnapshot,
    armed: bool,
}

impl<'a> RollbackGuard<'a> {
    fn new(store: &'a CacheStore, snapshot: &'a MutationSnapshot) -> Self {
        Self {
            store,
            snapshot,
            armed: true,
        }
    }

    /// Keep the optimistic state.
    fn disarm(mut self) {
        self.armed = false;
    }

    fn rollback(&mut self) {
        if self.armed {
            self.armed = false;
            self.snapshot.restore(self.store);
            self.store.metrics().record_rollback();
        }
    }
}

impl Drop for RollbackGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            warn!(
                snapshot = %self.snapshot.id(),
                "Mutation abandoned, rolling back optimistic writes"
            );
            self.rollback();
        }
    }
}

// =============================================================================
// Coordinator
// =============================================================================

/// Write coordinator over a shared store
pub struct MutationCoordinator {
    store: Arc<CacheStore>,
    invalidation: Arc<InvalidationEngine>,
    locks: KeyLocks,
}

impl MutationCoordinator {
    pub fn new(store: Arc<CacheStore>, invalidation: Arc<InvalidationEngine>) -> Self {
        Self {
            store,
            invalidation,
            locks: KeyLocks::default(),
        }
    }

    pub fn store(&self) -> &Arc<CacheStore> {
        &self.store
    }

    /// Number of keys with a live lock
    pub fn locked_keys(&self) -> usize {
        self.locks.len()
    }

    /// Run `operation(args)` with optimistic writes and rollback on failure.
    pub async fn mutate<A, F, Fut>(&self, operation: F, args: A, options: MutationOptions) -> Result<Value>
    where
        F: FnOnce(A) -> Fut,
        Fut: Future<Output = Result<Value>>,
    {
        self.mutate_detailed(operation, args, options)
            .await
            .map(|outcome| outcome.result)
    }

    /// `mutate`, also returning the discarded snapshot.
    #[instrument(skip_all, fields(keys = ?options.affected_keys()))]
    pub async fn mutate_detailed<A, F, Fut>(
        &self,
        operation: F,
        args: A,
        options: MutationOptions,
    ) -> Result<MutationOutcome>
    where
        F: FnOnce(A) -> Fut,
        Fut: Future<Output = Result<Value>>,
    {
        options.validate()?;
        self.store.metrics().record_mutation();

        let keys = options.affected_keys();
        let _held = self.locks.acquire(keys.clone()).await;

        let snapshot = MutationSnapshot::capture(&self.store, &keys);
        let snapshot_id = snapshot.id();
        let mut guard = RollbackGuard::new(&self.store, &snapshot);

        for write in &options.optimistic {
            self.apply_optimistic(write)?;
        }
        debug!(snapshot = %snapshot_id, writes = options.optimistic.len(), "Optimistic writes applied");

        match operation(args).await {
            Ok(result) => {
                guard.disarm();
                self.commit(&options, &result)?;
                if !options.invalidates.is_empty() {
                    self.invalidation.invalidate_all(&options.invalidates)?;
                }
                self.store.metrics().record_commit();
                debug!(snapshot = %snapshot_id, "Mutation committed");
                Ok(MutationOutcome { result, snapshot })
            }
            Err(error) => {
                guard.rollback();
                warn!(snapshot = %snapshot_id, error = %error, "Mutation failed, rolled back");
                Err(error)
            }
        }
    }

    fn apply_optimistic(&self, write: &OptimisticWrite) -> Result<()> {
        let options = write.options.unwrap_or(self.store.defaults());
        match &write.change {
            OptimisticChange::Set(value) => {
                self.store
                    .write(&write.key, value.clone(), options, WriteSource::Optimistic)
            }
            OptimisticChange::Update(f) => self
                .store
                .update_with(&write.key, WriteSource::Optimistic, options, |current| {
                    Ok(EntryUpdate::Write(f(current.map(CacheEntry::data))))
                })
                .map(|_| ()),
            OptimisticChange::Remove => {
                self.store
                    .remove_with_reason(&write.key, RemovalReason::Removed);
                Ok(())
            }
        }
    }

    fn commit(&self, options: &MutationOptions, result: &Value) -> Result<()> {
        for write in &options.optimistic {
            let entry_options = write.options.unwrap_or(self.store.defaults());
            match &write.on_commit {
                CommitRule::ReplaceWithResult => self.store.write(
                    &write.key,
                    result.clone(),
                    entry_options,
                    WriteSource::Commit,
                )?,
                CommitRule::Keep => {}
                CommitRule::Remove => {
                    self.store
                        .remove_with_reason(&write.key, RemovalReason::Removed);
                }
                CommitRule::Reconcile(f) => {
                    self.store.update_with(
                        &write.key,
                        WriteSource::Commit,
                        entry_options,
                        |current| Ok(EntryUpdate::Write(f(current.map(CacheEntry::data), result))),
                    )?;
                }
            }
        }

        if let Some(key) = options.result_key.as_ref().and_then(|f| f(result)) {
            let entry_options = options.result_options.unwrap_or(self.store.defaults());
            self.store
                .write(&key, result.clone(), entry_options, WriteSource::Commit)?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for MutationCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MutationCoordinator")
            .field("locked_keys", &self.locked_keys())
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
    use crate::error::Error;
    use assert_matches::assert_matches;
    use serde_json::json;
    use std::time::Duration;
    use tokio::sync::oneshot;

    fn coordinator() -> MutationCoordinator {
        let store = Arc::new(CacheStore::default());
        let invalidation = Arc::new(InvalidationEngine::new(Arc::clone(&store)));
        MutationCoordinator::new(store, invalidation)
    }

    fn options(stale_ms: u64, evict_ms: u64) -> EntryOptions {
        EntryOptions::from_millis(stale_ms, evict_ms).unwrap()
    }

    #[tokio::test]
    async fn test_commit_replaces_optimistic_value() {
        let coordinator = coordinator();
        let store = Arc::clone(coordinator.store());

        let result = coordinator
            .mutate(
                |title: String| async move { Ok(json!({"id": 1, "title": title, "saved": true})) },
                "hello".to_string(),
                MutationOptions::new()
                    .with_optimistic(OptimisticWrite::set("post:1", json!({"id": 1, "title": "hello"}))),
            )
            .await
            .unwrap();

        assert_eq!(result["saved"], json!(true));
        assert_eq!(store.peek("post:1").unwrap().data(), &result);
        assert_eq!(store.metrics().snapshot().commits, 1);
    }

    #[tokio::test]
    async fn test_optimistic_value_visible_while_pending() {
        let coordinator = Arc::new(coordinator());
        let store = Arc::clone(coordinator.store());
        let (tx, rx) = oneshot::channel::<()>();

        let task = {
            let coordinator = Arc::clone(&coordinator);
            tokio::spawn(async move {
                coordinator
                    .mutate(
                        |_: ()| async move {
                            rx.await.ok();
                            Ok(json!("server"))
                        },
                        (),
                        MutationOptions::new()
                            .with_optimistic(OptimisticWrite::set("k", json!("draft"))),
                    )
                    .await
            })
        };

        while !store.contains("k") {
            tokio::task::yield_now().await;
        }
        assert_eq!(store.peek("k").unwrap().data(), &json!("draft"));

        tx.send(()).unwrap();
        assert_eq!(task.await.unwrap().unwrap(), json!("server"));
        assert_eq!(store.peek("k").unwrap().data(), &json!("server"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_restores_exact_prior_state() {
        let coordinator = coordinator();
        let store = Arc::clone(coordinator.store());
        store.set("a", json!("a0"), options(5000, 10_000)).unwrap();
        store.set("b", json!("b0"), options(1000, 10_000)).unwrap();
        tokio::time::advance(Duration::from_millis(2000)).await;
        let before = (store.peek("a"), store.peek("b"));

        let result = coordinator
            .mutate(
                |_: ()| async { Err(Error::MutationConflict("version mismatch".into())) },
                (),
                MutationOptions::new()
                    .with_optimistic(OptimisticWrite::set("a", json!("a1")))
                    .with_optimistic(OptimisticWrite::update("b", |_| json!("b1"))),
            )
            .await;

        assert_matches!(result, Err(Error::MutationConflict(_)));
        assert_eq!((store.peek("a"), store.peek("b")), before);
        assert!(!store.is_stale("a", None));
        assert!(store.is_stale("b", None));
        assert_eq!(store.metrics().snapshot().rollbacks, 1);
    }

    #[tokio::test]
    async fn test_rollback_removes_temporary_key() {
        let coordinator = coordinator();
        let store = Arc::clone(coordinator.store());

        let result = coordinator
            .mutate(
                |_: ()| async { Err(Error::Validation("title required".into())) },
                (),
                MutationOptions::new()
                    .with_optimistic(OptimisticWrite::temporary("post:temp", json!({"title": ""}))),
            )
            .await;

        assert_matches!(result, Err(Error::Validation(_)));
        assert!(store.get("post:temp").is_none());
    }

    #[tokio::test]
    async fn test_rollback_is_one_notification_batch() {
        let coordinator = coordinator();
        let store = Arc::clone(coordinator.store());
        store.set_with_defaults("a", json!(0)).unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let observed = {
            let seen = Arc::clone(&seen);
            let reader = Arc::clone(&store);
            // On the rollback signal for "a", "b" must already be gone
            store.subscribe("a", move |event| {
                if let CacheEvent::Updated { source: WriteSource::Rollback, .. } = event {
                    seen.lock().push(reader.contains("b"));
                }
            })
        };

        let _ = coordinator
            .mutate(
                |_: ()| async { Err(Error::MutationConflict("no".into())) },
                (),
                MutationOptions::new()
                    .with_optimistic(OptimisticWrite::set("a", json!(1)))
                    .with_optimistic(OptimisticWrite::set("b", json!(1))),
            )
            .await;

        assert_eq!(*seen.lock(), vec![false]);
        drop(observed);
    }

    #[tokio::test]
    async fn test_temporary_key_replaced_by_result_key() {
        let coordinator = coordinator();
        let store = Arc::clone(coordinator.store());

        coordinator
            .mutate(
                |_: ()| async { Ok(json!({"id": 42, "title": "hi"})) },
                (),
                MutationOptions::new()
                    .with_optimistic(OptimisticWrite::temporary("post:temp", json!({"title": "hi"})))
                    .with_result_key(|r| r["id"].as_u64().map(|id| format!("post:{}", id))),
            )
            .await
            .unwrap();

        assert!(!store.contains("post:temp"));
        assert_eq!(store.peek("post:42").unwrap().data()["id"], json!(42));
    }

    #[tokio::test]
    async fn test_reconcile_and_invalidates() {
        let coordinator = coordinator();
        let store = Arc::clone(coordinator.store());
        store.set_with_defaults("posts", json!([{"id": 1}])).unwrap();
        store.set_with_defaults("feed:home", json!([])).unwrap();
        store.set_with_defaults("feed:user", json!([])).unwrap();

        coordinator
            .mutate(
                |_: ()| async { Ok(json!({"id": 2})) },
                (),
                MutationOptions::new()
                    .with_optimistic(
                        OptimisticWrite::update("posts", |current| {
                            let mut items = current.and_then(Value::as_array).cloned().unwrap_or_default();
                            items.push(json!({"id": "pending"}));
                            Value::Array(items)
                        })
                        .reconcile(|current, result| {
                            let mut items = current.and_then(Value::as_array).cloned().unwrap_or_default();
                            items.retain(|i| i["id"] != json!("pending"));
                            items.push(result.clone());
                            Value::Array(items)
                        }),
                    )
                    .invalidates("feed:*"),
            )
            .await
            .unwrap();

        assert_eq!(store.peek("posts").unwrap().data(), &json!([{"id": 1}, {"id": 2}]));
        assert!(!store.contains("feed:home"));
        assert!(!store.contains("feed:user"));
    }

    #[tokio::test]
    async fn test_failed_mutation_does_not_invalidate() {
        let coordinator = coordinator();
        let store = Arc::clone(coordinator.store());
        store.set_with_defaults("feed:home", json!([])).unwrap();

        let _ = coordinator
            .mutate(
                |_: ()| async { Err(Error::TransientNetwork("down".into())) },
                (),
                MutationOptions::new().invalidates("feed:*"),
            )
            .await;

        assert!(store.contains("feed:home"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_overlapping_mutations_serialize() {
        let coordinator = Arc::new(coordinator());
        let store = Arc::clone(coordinator.store());
        store.set_with_defaults("counter", json!(0)).unwrap();

        let increment = || {
            MutationOptions::new().with_optimistic(OptimisticWrite::update("counter", |current| {
                json!(current.and_then(Value::as_i64).unwrap_or(0) + 1)
            }))
        };

        let first = {
            let coordinator = Arc::clone(&coordinator);
            let options = increment();
            tokio::spawn(async move {
                coordinator
                    .mutate(
                        |_: ()| async {
                            tokio::time::sleep(Duration::from_millis(100)).await;
                            Err(Error::MutationConflict("stale".into()))
                        },
                        (),
                        options,
                    )
                    .await
            })
        };
        tokio::task::yield_now().await;

        // Snapshots only after the first rolled back, so it sees 0 -> 1
        let second = coordinator
            .mutate(|_: ()| async { Ok(json!("ok")) }, (), increment())
            .await;

        assert!(first.await.unwrap().is_err());
        assert!(second.is_ok());
        assert_eq!(store.peek("counter").unwrap().data(), &json!(1));
        assert_eq!(coordinator.locked_keys(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_mutation_rolls_back() {
        let coordinator = coordinator();
        let store = Arc::clone(coordinator.store());

        let pending = coordinator.mutate(
            |_: ()| async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(json!("never"))
            },
            (),
            MutationOptions::new().with_optimistic(OptimisticWrite::set("k", json!("draft"))),
        );
        let outcome = tokio::time::timeout(Duration::from_millis(10), pending).await;

        assert!(outcome.is_err());
        assert!(!store.contains("k"));
        assert_eq!(store.metrics().snapshot().rollbacks, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_while_queued_releases_lock_entries() {
        let coordinator = Arc::new(coordinator());
        let (tx, rx) = oneshot::channel::<()>();

        // Holds "b" until signalled
        let holder = {
            let coordinator = Arc::clone(&coordinator);
            tokio::spawn(async move {
                coordinator
                    .mutate(
                        |_: ()| async move {
                            rx.await.ok();
                            Ok(json!("done"))
                        },
                        (),
                        MutationOptions::new().with_optimistic(OptimisticWrite::set("b", json!(1))),
                    )
                    .await
            })
        };
        tokio::task::yield_now().await;
        assert_eq!(coordinator.locked_keys(), 1);

        // Takes "a", then queues on "b" until the timeout drops it
        let queued = coordinator.mutate(
            |_: ()| async { Ok(json!("never")) },
            (),
            MutationOptions::new()
                .with_optimistic(OptimisticWrite::set("a", json!(1)))
                .with_optimistic(OptimisticWrite::set("b", json!(2))),
        );
        assert!(tokio::time::timeout(Duration::from_millis(10), queued).await.is_err());

        tx.send(()).unwrap();
        assert_eq!(holder.await.unwrap().unwrap(), json!("done"));
        assert_eq!(coordinator.locked_keys(), 0);
    }

    #[tokio::test]
    async fn test_invalid_options_rejected_before_any_write() {
        let coordinator = coordinator();
        let bad = EntryOptions {
            stale_after: Duration::from_secs(10),
            evict_after: Duration::from_secs(1),
        };

        let result = coordinator
            .mutate(
                |_: ()| async { Ok(json!(1)) },
                (),
                MutationOptions::new()
                    .with_optimistic(OptimisticWrite::set("k", json!(0)).with_options(bad)),
            )
            .await;

        assert_matches!(result, Err(Error::InvalidOptions(_)));
        assert!(!coordinator.store().contains("k"));
    }

    #[tokio::test]
    async fn test_bad_invalidation_pattern_rejected_before_operation_runs() {
        let coordinator = coordinator();
        let store = Arc::clone(coordinator.store());
        let calls = Arc::new(std::sync::atomic::AtomicUsize::new(0));

        let result = {
            let calls = Arc::clone(&calls);
            coordinator
                .mutate(
                    move |_: ()| async move {
                        calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                        Ok(json!({"id": 1, "saved": true}))
                    },
                    (),
                    MutationOptions::new()
                        .with_optimistic(OptimisticWrite::set("post:1", json!({"id": 1})))
                        .invalidates("posts:*")
                        .invalidates(""),
                )
                .await
        };

        assert_matches!(result, Err(Error::InvalidPattern { .. }));
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 0);
        assert!(!store.contains("post:1"));
        let snapshot = store.metrics().snapshot();
        assert_eq!((snapshot.mutations, snapshot.commits, snapshot.rollbacks), (0, 0, 0));
    }

    #[tokio::test]
    async fn test_outcome_carries_snapshot() {
        let coordinator = coordinator();
        coordinator.store().set_with_defaults("a", json!(1)).unwrap();

        let outcome = coordinator
            .mutate_detailed(
                |_: ()| async { Ok(json!(2)) },
                (),
                MutationOptions::new().with_optimistic(OptimisticWrite::set("a", json!(9))),
            )
            .await
            .unwrap();

        assert_eq!(outcome.result, json!(2));
        assert!(outcome.snapshot.existed("a"));
        assert_eq!(
            outcome.snapshot.prior_entry("a").flatten().map(CacheEntry::data),
            Some(&json!(1))
        );
    }
}
