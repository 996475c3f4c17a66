//! Mutation Snapshot
//!
//! Pre-mutation state of every key an optimistic write touches. Restoring
//! it puts back the exact entries (data, write time, options), or removes
//! keys that did not exist.

use tokio::time::Instant;
use uuid::Uuid;

use crate::cache::entry::CacheEntry;
use crate::cache::store::CacheStore;

#[derive(Debug, Clone, PartialEq)]
pub struct MutationSnapshot {
    id: Uuid,
    prior: Vec<(String, Option<CacheEntry>)>,
    taken_at: Instant,
}

impl MutationSnapshot {
    /// Capture `keys` from the store under one lock. Keys are sorted and
    /// deduplicated.
    pub fn capture(store: &CacheStore, keys: &[String]) -> Self {
        let mut keys = keys.to_vec();
        keys.sort();
        keys.dedup();
        Self {
            id: Uuid::new_v4(),
            prior: store.peek_many(&keys),
            taken_at: Instant::now(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn taken_at(&self) -> Instant {
        self.taken_at
    }

    pub fn affected_keys(&self) -> impl Iterator<Item = &str> {
        self.prior.iter().map(|(k, _)| k.as_str())
    }

    /// Prior entry for `key`: `None` if the key is not part of the
    /// snapshot, `Some(None)` if it did not exist.
    pub fn prior_entry(&self, key: &str) -> Option<Option<&CacheEntry>> {
        self.prior
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, entry)| entry.as_ref())
    }

    /// Whether `key` existed when the snapshot was taken
    pub fn existed(&self, key: &str) -> bool {
        matches!(self.prior_entry(key), Some(Some(_)))
    }

    pub fn len(&self) -> usize {
        self.prior.len()
    }

    pub fn is_empty(&self) -> bool {
        self.prior.is_empty()
    }

    /// Put every key back. One lock acquisition, one notification batch.
    pub(crate) fn restore(&self, store: &CacheStore) {
        store.restore(&self.prior);
    }
}
