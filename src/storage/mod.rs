//! Content storage seam.
//!
//! The branching core only manages branch shells and timestamps. Content
//! commits and the replay of commits during rebase and merge are delegated
//! to a [`ContentStore`].
//!
//! Replaying never writes. The squashed changes it returns are committed by
//! the branch manager only once the registry accepts the new identity.

mod memory;

pub use memory::MemoryContentStore;

use crate::branches::Branch;
use crate::error::Result;
use crate::merge::MergeConflict;
use crate::types::{CancellationToken, ChangeSet, Timestamp};

/// Describes one replay of the commits of `source`.
#[derive(Clone, Copy, Debug)]
pub struct ReplayRequest<'a> {
    /// Branch whose commits are replayed.
    pub source: &'a Branch,
    /// Only commits of `source` after this point are replayed.
    pub from: Timestamp,
    /// Branch whose commits after `from` the replayed changes are checked against.
    pub against: &'a Branch,
}

#[derive(Clone, Debug, PartialEq)]
pub enum ReplayOutcome {
    /// The squashed changes of `commits` source commits, ready to be committed.
    Replayed { commits: usize, changes: ChangeSet },
    Conflicts(Vec<MergeConflict>),
}

/// Storage layer for versioned content.
pub trait ContentStore: Send + Sync {
    /// Persist `changes` on `branch` at `timestamp`.
    fn commit(&self, branch: &Branch, timestamp: Timestamp, changes: &ChangeSet) -> Result<()>;

    /// Squash the commits described by `request` and check them for conflicts,
    /// checking `cancel` between commits. Nothing is written.
    fn replay_commits(
        &self,
        request: ReplayRequest<'_>,
        cancel: &CancellationToken,
    ) -> Result<ReplayOutcome>;
}

/// Store without content; every replay trivially succeeds with no changes.
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct NoContent;

impl ContentStore for NoContent {
    fn commit(&self, _: &Branch, _: Timestamp, _: &ChangeSet) -> Result<()> {
        Ok(())
    }

    fn replay_commits(
        &self,
        _: ReplayRequest<'_>,
        cancel: &CancellationToken,
    ) -> Result<ReplayOutcome> {
        cancel.checkpoint()?;
        Ok(ReplayOutcome::Replayed {
            commits: 0,
            changes: ChangeSet::new(),
        })
    }
}
