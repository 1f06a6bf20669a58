//! Exclusive branch locks scoped to repository id and branch path.
//!
//! Locks are acquired all-or-nothing and released when the returned
//! [`Locks`] guard is dropped, so every exit path of a holder releases them.

use crate::error::{BranchError, Result};
use crate::types::CancellationToken;
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// How often a cancellable acquisition re-checks its token while waiting.
const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// User recorded on locks taken by the repository itself.
pub const SYSTEM_USER: &str = "System";

/// Who holds a lock and why.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockContext {
    pub user_id: String,
    pub description: String,
}

impl LockContext {
    pub fn new(user_id: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            description: description.into(),
        }
    }
}

impl fmt::Display for LockContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.description, self.user_id)
    }
}

/// A lockable branch of a repository.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockTarget {
    pub repository_id: String,
    pub branch_path: String,
}

impl LockTarget {
    pub fn new(repository_id: impl Into<String>, branch_path: impl Into<String>) -> Self {
        Self {
            repository_id: repository_id.into(),
            branch_path: branch_path.into(),
        }
    }
}

impl fmt::Display for LockTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.repository_id, self.branch_path)
    }
}

/// Grants exclusive locks on [`LockTarget`]s.
#[derive(Debug, Default)]
pub struct LockManager {
    held: Mutex<HashMap<LockTarget, LockContext>>,
    released: Condvar,
}

impl LockManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lock every target in `targets` for `context`, waiting up to `timeout`.
    ///
    /// Either all targets are locked or none are. When the timeout elapses
    /// the error names the current holder of a contended target.
    pub fn acquire(
        self: &Arc<Self>,
        context: LockContext,
        targets: impl IntoIterator<Item = LockTarget>,
        timeout: Duration,
    ) -> Result<Locks> {
        self.acquire_until(context, targets, timeout, None)
    }

    /// Like [`acquire`](Self::acquire), giving up with
    /// [`BranchError::Cancelled`] once `cancel` is set.
    pub fn acquire_cancellable(
        self: &Arc<Self>,
        context: LockContext,
        targets: impl IntoIterator<Item = LockTarget>,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Locks> {
        self.acquire_until(context, targets, timeout, Some(cancel))
    }

    fn acquire_until(
        self: &Arc<Self>,
        context: LockContext,
        targets: impl IntoIterator<Item = LockTarget>,
        timeout: Duration,
        cancel: Option<&CancellationToken>,
    ) -> Result<Locks> {
        let targets: Vec<LockTarget> = targets.into_iter().collect::<BTreeSet<_>>().into_iter().collect();
        let deadline = Instant::now() + timeout;

        let mut held = self.held.lock();
        loop {
            if let Some(cancel) = cancel {
                cancel.checkpoint()?;
            }

            let contended = targets
                .iter()
                .find_map(|t| held.get(t).map(|holder| (t, holder)));

            let Some((target, holder)) = contended else {
                for target in &targets {
                    held.insert(target.clone(), context.clone());
                }
                debug!(context = %context, targets = targets.len(), "acquired locks");
                return Ok(Locks {
                    manager: Arc::clone(self),
                    targets,
                });
            };

            let now = Instant::now();
            if now >= deadline {
                let message = format!("Branch '{target}' is locked by {holder}.");
                warn!(context = %context, %target, holder = %holder, "lock acquisition timed out");
                return Err(BranchError::Conflict(message));
            }

            // Cancellation does not signal the condvar; wake up to poll it.
            let wake = match cancel {
                Some(_) => deadline.min(now + CANCEL_POLL_INTERVAL),
                None => deadline,
            };
            self.released.wait_until(&mut held, wake);
        }
    }

    /// Current holder of `target`, if any.
    pub fn holder(&self, target: &LockTarget) -> Option<LockContext> {
        self.held.lock().get(target).cloned()
    }

    pub fn is_locked(&self, target: &LockTarget) -> bool {
        self.held.lock().contains_key(target)
    }

    /// Number of locked targets.
    pub fn lock_count(&self) -> usize {
        self.held.lock().len()
    }

    fn release(&self, targets: &[LockTarget]) {
        {
            let mut held = self.held.lock();
            for target in targets {
                held.remove(target);
            }
        }
        debug!(targets = targets.len(), "released locks");
        self.released.notify_all();
    }
}

/// Locks held on a set of targets. Released on drop.
#[must_use = "locks are released as soon as the guard is dropped"]
pub struct Locks {
    manager: Arc<LockManager>,
    targets: Vec<LockTarget>,
}

impl Locks {
    pub fn targets(&self) -> &[LockTarget] {
        &self.targets
    }

    /// Release the locks now.
    pub fn release(self) {}
}

impl Drop for Locks {
    fn drop(&mut self) {
        self.manager.release(&self.targets);
    }
}

impl fmt::Debug for Locks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Locks").field("targets", &self.targets).finish()
    }
}
