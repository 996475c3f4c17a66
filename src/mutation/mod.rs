//! Mutation Layer
//!
//! Optimistic writes, the snapshot they roll back to, and the coordinator
//! that commits or restores them.

pub mod coordinator;
pub mod snapshot;

pub use coordinator::{
    CommitRule, MutationCoordinator, MutationOptions, MutationOutcome, OptimisticChange,
    OptimisticWrite, ReconcileFn, ResultKeyFn, UpdateFn,
};
pub use snapshot::MutationSnapshot;
