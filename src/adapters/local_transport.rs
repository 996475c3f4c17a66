//! Local Push Transport Adapter
//!
//! In-process implementation of the `PushTransport` port. Publishers call
//! [`LocalPushTransport::publish`]; every subscription whose topic pattern
//! matches receives the message synchronously, in subscription order.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::{debug, trace};

use crate::cache::pattern::PatternMatcher;
use crate::domain::ports::{PushHandler, PushMessage, PushTransport, TransportSubscriptionId};
use crate::error::Result;

struct LocalSubscription {
    matcher: PatternMatcher,
    handler: PushHandler,
}

/// In-memory push bus.
#[derive(Default)]
pub struct LocalPushTransport {
    subscriptions: RwLock<BTreeMap<u64, LocalSubscription>>,
    next_id: AtomicU64,
    published: AtomicU64,
}

impl LocalPushTransport {
    /// Create a new local transport.
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver `message` to every matching subscription. Handlers run with
    /// no transport lock held. Returns the number of deliveries.
    pub fn publish(&self, topic: &str, message: &PushMessage) -> usize {
        let handlers: Vec<PushHandler> = self
            .subscriptions
            .read()
            .values()
            .filter(|s| s.matcher.matches(topic))
            .map(|s| s.handler.clone())
            .collect();

        self.published.fetch_add(1, Ordering::Relaxed);
        trace!(topic = %topic, id = %message.id, receivers = handlers.len(), "Publishing push message");

        for handler in &handlers {
            handler(topic, message);
        }
        handlers.len()
    }

    /// Number of live subscriptions.
    pub fn subscription_count(&self) -> usize {
        self.subscriptions.read().len()
    }

    /// Messages published so far.
    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for LocalPushTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalPushTransport")
            .field("subscriptions", &self.subscription_count())
            .field("published", &self.published())
            .finish()
    }
}

#[async_trait]
impl PushTransport for LocalPushTransport {
    async fn subscribe(&self, topic: &str, handler: PushHandler) -> Result<TransportSubscriptionId> {
        let matcher = PatternMatcher::compile(topic)?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscriptions
            .write()
            .insert(id, LocalSubscription { matcher, handler });
        debug!(topic = %topic, subscription = id, "Local subscription added");
        Ok(TransportSubscriptionId(id))
    }

    async fn unsubscribe(&self, id: TransportSubscriptionId) -> Result<()> {
        if self.subscriptions.write().remove(&id.0).is_some() {
            debug!(subscription = id.0, "Local subscription removed");
        }
        Ok(())
    }
}
