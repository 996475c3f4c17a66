//! Inflight Request Registry
//!
//! At most one outstanding fetch per key. The first caller starts the
//! operation on a spawned task; later callers get a clone of the same shared
//! handle and observe the same outcome.
//!
//! # Settlement order
//!
//! The spawned task removes its registry entry *before* its output becomes
//! visible to waiters, so a request issued at the instant of settlement
//! starts a fresh operation instead of joining one that is about to vanish.
//!
//! # Cancellation
//!
//! Dropping or cancelling a handle only stops that caller from waiting. The
//! task keeps running and its side effects (cache writes) still land.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{Error, Result};

/// Outcome shared between every waiter of one inflight operation.
pub type SharedResult = Shared<BoxFuture<'static, Result<Value>>>;

struct InflightRequest {
    id: u64,
    handle: SharedResult,
    started_at: Instant,
}

/// Per-key registry of outstanding operations.
#[derive(Clone, Default)]
pub struct InflightRegistry {
    requests: Arc<Mutex<HashMap<String, InflightRequest>>>,
    next_id: Arc<AtomicU64>,
}

impl InflightRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Join the outstanding operation for `key`, or start one with `start`.
    ///
    /// `start` is not invoked when an operation is already registered. It
    /// runs with the registry locked and must not call back into it.
    /// Must be called from within a tokio runtime.
    pub fn get_or_create<F, Fut>(&self, key: &str, start: F) -> InflightHandle
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        let mut requests = self.requests.lock();

        if let Some(existing) = requests.get(key) {
            debug!(key = %key, "Joining inflight request");
            return InflightHandle {
                key: key.to_string(),
                shared: existing.handle.clone(),
                started_at: existing.started_at,
                joined: true,
            };
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let operation = start();
        let registry = Arc::clone(&self.requests);
        let owned_key = key.to_string();

        // The entry is inserted before the lock is released, so the task's
        // removal below always observes it.
        let task = tokio::spawn(async move {
            let outcome = operation.await;
            let mut requests = registry.lock();
            if requests.get(&owned_key).is_some_and(|r| r.id == id) {
                requests.remove(&owned_key);
            }
            outcome
        });

        let shared = async move {
            match task.await {
                Ok(outcome) => outcome,
                Err(e) => Err(Error::Internal(format!("inflight task failed: {}", e))),
            }
        }
        .boxed()
        .shared();

        let started_at = Instant::now();
        requests.insert(
            key.to_string(),
            InflightRequest {
                id,
                handle: shared.clone(),
                started_at,
            },
        );

        InflightHandle {
            key: key.to_string(),
            shared,
            started_at,
            joined: false,
        }
    }

    /// Handle to the outstanding operation for `key`, if any.
    pub fn join(&self, key: &str) -> Option<InflightHandle> {
        self.requests.lock().get(key).map(|r| InflightHandle {
            key: key.to_string(),
            shared: r.handle.clone(),
            started_at: r.started_at,
            joined: true,
        })
    }

    pub fn is_inflight(&self, key: &str) -> bool {
        self.requests.lock().contains_key(key)
    }

    /// Number of outstanding operations
    pub fn len(&self) -> usize {
        self.requests.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.lock().is_empty()
    }

    /// Keys with an outstanding operation, sorted
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.requests.lock().keys().cloned().collect();
        keys.sort();
        keys
    }
}

impl std::fmt::Debug for InflightRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InflightRegistry")
            .field("inflight", &self.len())
            .finish()
    }
}

/// A caller's view of a shared inflight operation.
#[derive(Clone)]
pub struct InflightHandle {
    key: String,
    shared: SharedResult,
    started_at: Instant,
    joined: bool,
}

impl InflightHandle {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Whether this handle joined an operation started by someone else
    pub fn is_joined(&self) -> bool {
        self.joined
    }

    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    /// Wait for the shared outcome.
    pub async fn wait(self) -> Result<Value> {
        self.shared.await
    }

    /// Wait for the shared outcome unless `cancel` fires first.
    pub async fn wait_or_cancel(self, cancel: &CancellationToken) -> Result<Value> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!(key = %self.key, "Stopped waiting on inflight request");
                Err(Error::Cancelled(self.key))
            }
            outcome = self.shared => outcome,
        }
    }
}

impl std::fmt::Debug for InflightHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InflightHandle")
            .field("key", &self.key)
            .field("joined", &self.joined)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::sync::oneshot;

    #[tokio::test]
    async fn test_second_caller_joins() {
        let registry = InflightRegistry::new();
        let starts = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = oneshot::channel::<Value>();

        let first = {
            let starts = Arc::clone(&starts);
            registry.get_or_create("k", move || {
                starts.fetch_add(1, Ordering::SeqCst);
                async move { Ok(rx.await.unwrap()) }
            })
        };
        let second = {
            let starts = Arc::clone(&starts);
            registry.get_or_create("k", move || {
                starts.fetch_add(1, Ordering::SeqCst);
                async { Ok(json!("never")) }
            })
        };

        assert!(!first.is_joined());
        assert!(second.is_joined());
        assert_eq!(starts.load(Ordering::SeqCst), 1);
        assert!(registry.is_inflight("k"));

        tx.send(json!("v")).unwrap();
        assert_eq!(first.wait().await.unwrap(), json!("v"));
        assert_eq!(second.wait().await.unwrap(), json!("v"));
    }

    #[tokio::test]
    async fn test_entry_removed_before_waiters_resolve() {
        let registry = InflightRegistry::new();
        let handle = registry.get_or_create("k", || async { Ok(json!(1)) });

        handle.wait().await.unwrap();
        assert!(!registry.is_inflight("k"));

        // A new request starts fresh
        let again = registry.get_or_create("k", || async { Ok(json!(2)) });
        assert!(!again.is_joined());
        assert_eq!(again.wait().await.unwrap(), json!(2));
    }

    #[tokio::test]
    async fn test_failure_shared_by_all_waiters() {
        let registry = InflightRegistry::new();
        let (tx, rx) = oneshot::channel::<()>();

        let a = registry.get_or_create("k", move || async move {
            rx.await.ok();
            Err(Error::TransientNetwork("boom".into()))
        });
        let b = registry.join("k").unwrap();
        tx.send(()).unwrap();

        assert_eq!(a.wait().await, Err(Error::TransientNetwork("boom".into())));
        assert_eq!(b.wait().await, Err(Error::TransientNetwork("boom".into())));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_cancel_stops_waiting_but_not_the_operation() {
        let registry = InflightRegistry::new();
        let completed = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = oneshot::channel::<()>();

        let handle = {
            let completed = Arc::clone(&completed);
            registry.get_or_create("k", move || async move {
                rx.await.ok();
                completed.fetch_add(1, Ordering::SeqCst);
                Ok(json!("done"))
            })
        };

        let cancel = CancellationToken::new();
        cancel.cancel();
        assert_eq!(
            handle.wait_or_cancel(&cancel).await,
            Err(Error::Cancelled("k".into()))
        );

        // Still registered and still completes
        let other = registry.join("k").unwrap();
        tx.send(()).unwrap();
        assert_eq!(other.wait().await.unwrap(), json!("done"));
        assert_eq!(completed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_distinct_keys_run_independently() {
        let registry = InflightRegistry::new();
        let a = registry.get_or_create("a", || async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            Ok(json!("a"))
        });
        let b = registry.get_or_create("b", || async { Ok(json!("b")) });

        assert!(!b.is_joined());
        assert_eq!(registry.keys(), vec!["a".to_string(), "b".to_string()]);
        assert_eq!(b.wait().await.unwrap(), json!("b"));
        assert_eq!(a.wait().await.unwrap(), json!("a"));
    }
}
