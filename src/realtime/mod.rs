//! Realtime Layer
//!
//! - **Update** (`update.rs`) - strategies and the tagged push payload
//! - **Bridge** (`bridge.rs`) - transport subscriptions and dispatch into the store

pub mod bridge;
pub mod update;

pub use bridge::{BridgeConfig, RealtimeSyncBridge};
pub use update::{PushUpdate, StrategyMap, UpdateStrategy};
