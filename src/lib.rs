//! # Revision Branching
//!
//! Branch-based versioning core: a tree of branches rooted at `MAIN`, ordered
//! by timestamps from a single authority, with rebase and merge executed
//! either synchronously or as background jobs.
//!
//! ## Core Concepts
//!
//! - **Branches**: Identified by path and base timestamp; state relative to
//!   another branch is one of UP_TO_DATE, FORWARD, BEHIND, DIVERGED, STALE
//! - **Timestamps**: Strictly increasing values from a [`TimestampAuthority`]
//! - **Merges**: Scheduled jobs that lock both branches and report
//!   conflicts as data
//!
//! ## Example
//!
//! ```ignore
//! use revision_branching::{ChangeSet, ComponentKey, Repository, RepositoryConfig, MAIN_PATH};
//!
//! let repo = Repository::open_or_create(RepositoryConfig {
//!     path: "./my-repo".into(),
//!     ..Default::default()
//! })?;
//!
//! // Work on a task branch
//! repo.branches().create_branch(MAIN_PATH, "task-1")?;
//! repo.commit(
//!     "MAIN/task-1",
//!     &ChangeSet::new().upsert(ComponentKey::new("concept", "138875005"), json!({"active": true})),
//! )?;
//!
//! // Promote it in the background
//! let merge = repo.merges().enqueue("MAIN/task-1", MAIN_PATH, Some("Promote".into()), None)?;
//! let merge = repo.merges().wait_for(merge.id, Duration::from_secs(60))?;
//! ```

pub mod branches;
pub mod error;
pub mod events;
pub mod locks;
pub mod merge;
pub mod repository;
pub mod storage;
pub mod timestamp;
pub mod types;

// Re-exports
pub use branches::{Branch, BranchKind, BranchManager, Metadata, MAIN_PATH, SEPARATOR};
pub use error::{BranchError, Result};
pub use events::{BranchEvent, EventBus, EventFilter, SubscriptionConfig, SubscriptionHandle};
pub use locks::{LockContext, LockManager, LockTarget, Locks};
pub use merge::{
    ApiError, ConflictType, ConflictingAttribute, Merge, MergeCollection, MergeConflict,
    MergeFilter, MergeService, MergeServiceConfig, MergeStatus,
};
pub use repository::{Repository, RepositoryConfig};
pub use storage::{ContentStore, MemoryContentStore, ReplayOutcome, ReplayRequest};
pub use timestamp::{AtomicTimestampAuthority, DurableTimestampAuthority, TimestampAuthority};
pub use types::*;
