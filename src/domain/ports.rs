//! Domain Ports (Port/Adapter Pattern)
//!
//! Abstractions over the external collaborators the engine depends on. The
//! engine never establishes connections itself; a transport adapter does that
//! and hands decoded push messages to the registered handlers.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       Engine Core                            │
//! │  ┌─────────────────────────────────────────────────────┐    │
//! │  │          Ports: PushTransport │ fetch closures       │    │
//! │  └─────────────────────────────────────────────────────┘    │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    Adapters (Impls)                          │
//! │   LocalPushTransport │ WebSocket client │ HTTP fetchers      │
//! └─────────────────────────────────────────────────────────────┘
//! ```

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;

// =============================================================================
// Push Messages
// =============================================================================

/// Wire shape of a push update.
///
/// `kind` (serialized as `type`) selects the update strategy, `data` is the
/// payload, `timestamp` orders updates and `id` deduplicates redelivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushMessage {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: Value,
    pub timestamp: DateTime<Utc>,
    pub id: String,
}

impl PushMessage {
    /// Create a message stamped with the current time.
    pub fn new(kind: impl Into<String>, id: impl Into<String>, data: Value) -> Self {
        Self {
            kind: kind.into(),
            data,
            timestamp: Utc::now(),
            id: id.into(),
        }
    }

    /// Override the timestamp.
    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }
}

/// Callback invoked by a transport for each message on a subscribed topic.
/// The first argument is the concrete topic the message was published on.
pub type PushHandler = Arc<dyn Fn(&str, &PushMessage) + Send + Sync>;

/// Identifier returned by a transport subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransportSubscriptionId(pub u64);

impl std::fmt::Display for TransportSubscriptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

// =============================================================================
// Push Transport Port
// =============================================================================

/// Port for the push-update channel (WebSocket, SSE, in-process bus).
#[async_trait]
pub trait PushTransport: Send + Sync {
    /// Register a handler for a topic. Topics may contain `*` wildcards.
    async fn subscribe(&self, topic: &str, handler: PushHandler)
        -> Result<TransportSubscriptionId>;

    /// Remove a subscription. Unknown ids are ignored.
    async fn unsubscribe(&self, id: TransportSubscriptionId) -> Result<()>;
}

// =============================================================================
// Fetch Collaborator
// =============================================================================

/// Boxed future produced by a fetcher.
pub type FetchFuture = BoxFuture<'static, Result<Value>>;

/// Zero-argument data source supplied per read.
///
/// Implemented for any `Fn() -> impl Future<Output = Result<Value>>`, so
/// callers normally pass a closure.
pub trait Fetcher: Send + Sync + 'static {
    fn fetch(&self) -> FetchFuture;
}

impl<F, Fut> Fetcher for F
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value>> + Send + 'static,
{
    fn fetch(&self) -> FetchFuture {
        Box::pin(self())
    }
}
