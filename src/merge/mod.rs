//! Asynchronous merge and rebase jobs.
//!
//! A request becomes a [`Merge`] record in `SCHEDULED` state; a worker of the
//! [`MergeService`] locks both branches, runs the rebase or merge and leaves
//! the outcome, including any conflicts, in the record.

mod job;
mod service;
mod types;

pub use job::MergeJob;
pub use service::{MergeService, MergeServiceConfig};
pub use types::{
    ApiError, ConflictType, ConflictingAttribute, Merge, MergeCollection, MergeConflict,
    MergeFilter, MergeStatus,
};
