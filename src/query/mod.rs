//! Query Layer
//!
//! - **Inflight** (`inflight.rs`) - one outstanding fetch per key
//! - **Retry** (`retry.rs`) - exponential backoff for transient failures
//! - **Coordinator** (`coordinator.rs`) - strategy-driven reads

pub mod coordinator;
pub mod inflight;
pub mod retry;

pub use coordinator::{
    ErrorCallback, QueryCoordinator, QueryResult, ReadOptions, ReadStrategy, ResultSource,
};
pub use inflight::{InflightHandle, InflightRegistry};
pub use retry::RetryPolicy;
