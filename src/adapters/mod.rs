//! Infrastructure Adapters
//!
//! Implementations of the domain ports and outward-facing surfaces.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        Domain Layer                             │
//! │  ┌────────────────────────────────────────────────────────────┐ │
//! │  │                    Ports (Traits)                          │ │
//! │  │           PushTransport   │   Fetcher                      │ │
//! │  └────────────────────────────────────────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────┘
//!                               │
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     Adapters (This Module)                      │
//! │  ┌────────────────────────────────────────────────────────────┐ │
//! │  │ LocalPushTransport │ feed::replay │ PrometheusExporter     │ │
//! │  └────────────────────────────────────────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use querysync::adapters::{feed, LocalPushTransport};
//!
//! let transport = Arc::new(LocalPushTransport::new());
//! let stats = feed::replay(stdin, &transport, &cancel).await?;
//! ```

pub mod feed;
pub mod local_transport;
pub mod prometheus;

pub use self::feed::{FeedRecord, FeedStats};
pub use self::local_transport::LocalPushTransport;
pub use self::prometheus::PrometheusExporter;
