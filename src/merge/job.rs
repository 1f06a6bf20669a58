//! Background execution of a single merge or rebase.

use super::types::{Merge, MergeStatus};
use crate::branches::{Branch, BranchManager};
use crate::error::{BranchError, Result};
use crate::events::BranchEvent;
use crate::locks::{LockContext, LockManager, LockTarget, SYSTEM_USER};
use crate::storage::ContentStore;
use crate::types::CancellationToken;
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Shared state of one merge record.
#[derive(Debug)]
pub(crate) struct MergeEntry {
    merge: Mutex<Merge>,
    finished: Condvar,
    cancel: CancellationToken,
}

impl MergeEntry {
    pub(crate) fn new(merge: Merge) -> Self {
        Self {
            merge: Mutex::new(merge),
            finished: Condvar::new(),
            cancel: CancellationToken::new(),
        }
    }

    pub(crate) fn snapshot(&self) -> Merge {
        self.merge.lock().clone()
    }

    fn update(&self, f: impl FnOnce(&mut Merge)) -> Merge {
        let mut merge = self.merge.lock();
        f(&mut merge);
        merge.clone()
    }

    /// Flag the job for cancellation. Returns false if it already finished.
    pub(crate) fn request_cancel(&self) -> bool {
        let mut merge = self.merge.lock();
        if merge.status.is_terminal() {
            return false;
        }
        merge.status = MergeStatus::CancelRequested;
        self.cancel.cancel();
        true
    }

    /// Block until the merge is terminal or `timeout` elapses.
    pub(crate) fn wait(&self, timeout: Duration) -> Merge {
        let deadline = Instant::now() + timeout;
        let mut merge = self.merge.lock();
        while !merge.status.is_terminal() {
            if self.finished.wait_until(&mut merge, deadline).timed_out() {
                break;
            }
        }
        merge.clone()
    }
}

/// A scheduled merge or rebase, run once by a worker.
pub struct MergeJob {
    entry: Arc<MergeEntry>,
    branches: Arc<BranchManager>,
    store: Arc<dyn ContentStore>,
    locks: Arc<LockManager>,
    repository_id: String,
    lock_timeout: Duration,
}

impl MergeJob {
    pub(crate) fn new(
        entry: Arc<MergeEntry>,
        branches: Arc<BranchManager>,
        store: Arc<dyn ContentStore>,
        locks: Arc<LockManager>,
        repository_id: String,
        lock_timeout: Duration,
    ) -> Self {
        Self {
            entry,
            branches,
            store,
            locks,
            repository_id,
            lock_timeout,
        }
    }

    /// Id of the merge record this job reports into.
    pub fn id(&self) -> uuid::Uuid {
        self.entry.merge.lock().id
    }

    /// Run to a terminal state. Never fails; the outcome lands in the record.
    pub fn run(self) {
        if self.entry.cancel.is_cancelled() {
            let merge = self.entry.update(Merge::cancel);
            debug!(merge_id = %merge.id, "merge cancelled before start");
            self.finish(&merge);
            return;
        }

        let merge = self.entry.update(Merge::start);
        self.publish(&merge);
        info!(
            merge_id = %merge.id,
            source = %merge.source,
            target = %merge.target,
            "merge started"
        );

        let result = self.execute(&merge);

        let merge = self.entry.update(|m| match &result {
            Ok(_) => m.complete(),
            Err(BranchError::Cancelled) => m.cancel(),
            Err(err) => m.fail(err),
        });

        match &result {
            Ok(branch) => info!(
                merge_id = %merge.id,
                head = %branch.head_timestamp(),
                "merge completed"
            ),
            Err(err) => warn!(
                merge_id = %merge.id,
                status = %merge.status,
                conflicts = merge.conflicts.len(),
                error = %err,
                "merge did not complete"
            ),
        }

        self.finish(&merge);
    }

    /// Locks are held for the duration of this call only.
    fn execute(&self, merge: &Merge) -> Result<Branch> {
        let target = self.branches.get_branch(&merge.target)?;
        let rebase = !target.is_root() && target.parent_path() == merge.source;

        let description = if rebase {
            format!("Rebasing '{}' onto '{}'", merge.target, merge.source)
        } else {
            format!("Merging '{}' into '{}'", merge.source, merge.target)
        };

        let _locks = self.locks.acquire_cancellable(
            LockContext::new(SYSTEM_USER, description),
            [
                LockTarget::new(&self.repository_id, &merge.source),
                LockTarget::new(&self.repository_id, &merge.target),
            ],
            self.lock_timeout,
            &self.entry.cancel,
        )?;

        self.entry.cancel.checkpoint()?;

        if rebase {
            self.branches
                .rebase_with(&merge.target, self.store.as_ref(), &self.entry.cancel)
        } else {
            self.branches.merge_with(
                &merge.source,
                &merge.target,
                self.store.as_ref(),
                &self.entry.cancel,
            )
        }
    }

    fn finish(&self, merge: &Merge) {
        self.entry.finished.notify_all();
        self.publish(merge);
    }

    fn publish(&self, merge: &Merge) {
        self.branches.events().publish(BranchEvent::MergeStatusChanged {
            id: merge.id,
            source: merge.source.clone(),
            target: merge.target.clone(),
            status: merge.status,
        });
    }
}
