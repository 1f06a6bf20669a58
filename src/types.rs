//! Core value types shared across the crate.

use crate::error::{BranchError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// A point on the logical time line issued by a
/// [`TimestampAuthority`](crate::timestamp::TimestampAuthority).
///
/// The same representation is used for wall-clock display dates on merge
/// records (microseconds since the Unix epoch), but only authority-issued
/// values take part in ordering decisions.
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Timestamp(pub i64);

impl Timestamp {
    pub const ZERO: Timestamp = Timestamp(0);

    /// Current wall-clock time.
    pub fn now() -> Self {
        let micros = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as i64)
            .unwrap_or_default();
        Timestamp(micros)
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({})", self.0)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// State of a branch relative to a reference branch (usually its parent).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BranchState {
    /// Neither side has moved since the branch base.
    UpToDate,
    /// Only the branch has new commits.
    Forward,
    /// Only the reference has new commits.
    Behind,
    /// Both sides have new commits.
    Diverged,
    /// The reference was re-based past this branch's origin.
    Stale,
}

impl fmt::Display for BranchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BranchState::UpToDate => "UP_TO_DATE",
            BranchState::Forward => "FORWARD",
            BranchState::Behind => "BEHIND",
            BranchState::Diverged => "DIVERGED",
            BranchState::Stale => "STALE",
        };
        f.write_str(name)
    }
}

/// Identifies a versioned component (concept, description, member, ...).
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ComponentKey {
    pub component_type: String,
    pub id: String,
}

impl ComponentKey {
    pub fn new(component_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            component_type: component_type.into(),
            id: id.into(),
        }
    }
}

impl fmt::Display for ComponentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.component_type, self.id)
    }
}

/// A single component change.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", content = "value", rename_all = "snake_case")]
pub enum Change {
    Upsert(serde_json::Value),
    Delete,
}

impl Change {
    pub fn value(&self) -> Option<&serde_json::Value> {
        match self {
            Change::Upsert(value) => Some(value),
            Change::Delete => None,
        }
    }
}

/// Changes applied atomically by one commit.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ChangeSet {
    pub changes: BTreeMap<ComponentKey, Change>,
}

impl ChangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a component value.
    pub fn upsert(mut self, key: ComponentKey, value: serde_json::Value) -> Self {
        self.changes.insert(key, Change::Upsert(value));
        self
    }

    /// Mark a component as deleted.
    pub fn delete(mut self, key: ComponentKey) -> Self {
        self.changes.insert(key, Change::Delete);
        self
    }

    /// Fold `other` on top of this change set; later changes win.
    pub fn squash(&mut self, other: &ChangeSet) {
        for (key, change) in &other.changes {
            self.changes.insert(key.clone(), change.clone());
        }
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }
}

/// Shared flag for cooperative cancellation.
///
/// Long-running work calls [`checkpoint`](Self::checkpoint) at safe points
/// and unwinds with [`BranchError::Cancelled`] once cancellation was requested.
#[derive(Clone, Debug, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn checkpoint(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(BranchError::Cancelled)
        } else {
            Ok(())
        }
    }
}
