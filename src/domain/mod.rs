//! Domain Layer
//!
//! Types shared by every engine component and the ports through which the
//! engine talks to its external collaborators.
//!
//! - **Ports** (`ports.rs`) - push transport and fetch abstractions
//! - **Events** (`events.rs`) - subscriber notifications
//!
//! # Usage
//!
//! ```ignore
//! use querysync::domain::ports::{PushMessage, PushTransport};
//! use querysync::domain::events::CacheEvent;
//!
//! transport.subscribe("posts", handler).await?;
//! ```

pub mod events;
pub mod ports;

pub use events::{CacheEvent, RemovalReason, WriteSource};
pub use ports::{
    FetchFuture, Fetcher, PushHandler, PushMessage, PushTransport, TransportSubscriptionId,
};
