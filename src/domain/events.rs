//! Cache Events
//!
//! Notifications delivered to per-key subscribers. An update and a removal
//! are distinct signals so consumers can tell a refresh from an invalidation.
//!
//! # Example
//!
//! ```ignore
//! let sub = store.subscribe("post:1", |event| match event {
//!     CacheEvent::Updated { data, .. } => render(data),
//!     CacheEvent::Invalidated { .. } => show_placeholder(),
//!     CacheEvent::MarkedStale { .. } => {}
//! });
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// What caused a write into the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteSource {
    /// Result of a query fetch
    Fetch,
    /// Push update from the realtime bridge
    Push,
    /// Speculative write from an optimistic mutation
    Optimistic,
    /// Authoritative result of a committed mutation
    Commit,
    /// Restored from a mutation snapshot
    Rollback,
    /// Direct write through the store API
    Manual,
}

impl std::fmt::Display for WriteSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WriteSource::Fetch => write!(f, "fetch"),
            WriteSource::Push => write!(f, "push"),
            WriteSource::Optimistic => write!(f, "optimistic"),
            WriteSource::Commit => write!(f, "commit"),
            WriteSource::Rollback => write!(f, "rollback"),
            WriteSource::Manual => write!(f, "manual"),
        }
    }
}

/// Why an entry left the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemovalReason {
    /// Explicit `remove` call
    Removed,
    /// Matched an invalidation pattern
    Invalidated,
    /// Evicted by the background sweep
    Expired,
    /// Key did not exist before a failed mutation
    RolledBack,
    /// Source reported the resource gone
    NotFound,
}

/// Event delivered to subscribers of a key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum CacheEvent {
    /// Entry was created or overwritten.
    Updated {
        key: String,
        data: Value,
        source: WriteSource,
    },

    /// Entry was removed.
    Invalidated { key: String, reason: RemovalReason },

    /// Entry is still cached but must be refreshed on next read.
    MarkedStale { key: String },
}

impl CacheEvent {
    /// Create an update event.
    pub fn updated(key: impl Into<String>, data: Value, source: WriteSource) -> Self {
        Self::Updated {
            key: key.into(),
            data,
            source,
        }
    }

    /// Create a removal event.
    pub fn invalidated(key: impl Into<String>, reason: RemovalReason) -> Self {
        Self::Invalidated {
            key: key.into(),
            reason,
        }
    }

    /// Key this event concerns.
    pub fn key(&self) -> &str {
        match self {
            CacheEvent::Updated { key, .. }
            | CacheEvent::Invalidated { key, .. }
            | CacheEvent::MarkedStale { key } => key,
        }
    }

    /// Event type name, matching the serialized tag.
    pub fn event_type(&self) -> &'static str {
        match self {
            CacheEvent::Updated { .. } => "Updated",
            CacheEvent::Invalidated { .. } => "Invalidated",
            CacheEvent::MarkedStale { .. } => "MarkedStale",
        }
    }

    /// Whether the event removed the entry.
    pub fn is_removal(&self) -> bool {
        matches!(self, CacheEvent::Invalidated { .. })
    }
}
