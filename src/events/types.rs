//! Event and subscription types.

use crate::branches::Branch;
use crate::merge::MergeStatus;
use crate::types::Timestamp;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Configuration for a subscription.
#[derive(Clone, Debug)]
pub struct SubscriptionConfig {
    /// Max buffered events before dropping subscriber.
    /// Default: 1000
    pub buffer_size: usize,

    /// Filter criteria.
    pub filter: EventFilter,
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            buffer_size: 1000,
            filter: EventFilter::all(),
        }
    }
}

/// Filter criteria for subscriptions.
#[derive(Clone, Debug, Default)]
pub struct EventFilter {
    /// Only events about this path or its descendants (None = every path).
    pub path_prefix: Option<String>,

    /// Include branch structure and head events.
    pub include_branch_events: bool,

    /// Include merge status events.
    pub include_merge_events: bool,
}

impl EventFilter {
    /// Subscribe to branch events.
    pub fn branches() -> Self {
        Self {
            include_branch_events: true,
            ..Default::default()
        }
    }

    /// Subscribe to merge status events.
    pub fn merges() -> Self {
        Self {
            include_merge_events: true,
            ..Default::default()
        }
    }

    /// Subscribe to everything.
    pub fn all() -> Self {
        Self {
            path_prefix: None,
            include_branch_events: true,
            include_merge_events: true,
        }
    }

    /// Restrict to `prefix` and the branches below it.
    pub fn under(mut self, prefix: impl Into<String>) -> Self {
        self.path_prefix = Some(prefix.into());
        self
    }

    pub(crate) fn matches(&self, event: &BranchEvent) -> bool {
        let class_matches = if event.is_merge_event() {
            self.include_merge_events
        } else {
            self.include_branch_events
        };
        if !class_matches {
            return false;
        }

        match (&self.path_prefix, event.path()) {
            (Some(prefix), Some(path)) => {
                path == prefix.as_str()
                    || (path.starts_with(prefix.as_str())
                        && path[prefix.len()..].starts_with(crate::branches::SEPARATOR))
            }
            _ => true,
        }
    }
}

/// Events emitted by the branch manager and the merge service.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BranchEvent {
    /// A branch was created or reopened.
    Created { branch: BranchSummary },

    /// A branch head advanced.
    Committed { path: String, head: Timestamp },

    /// A branch was replaced by a new identity.
    Rebased {
        path: String,
        base: Timestamp,
        head: Timestamp,
    },

    /// `source` was merged into `target`.
    Merged {
        source: String,
        target: String,
        head: Timestamp,
    },

    /// A branch was soft-deleted.
    Deleted { path: String },

    /// A merge record changed status.
    MergeStatusChanged {
        id: Uuid,
        source: String,
        target: String,
        status: MergeStatus,
    },

    /// Subscription was dropped.
    Dropped { reason: DropReason },
}

impl BranchEvent {
    /// Branch path this event is about.
    pub fn path(&self) -> Option<&str> {
        match self {
            BranchEvent::Created { branch } => Some(branch.path.as_str()),
            BranchEvent::Committed { path, .. }
            | BranchEvent::Rebased { path, .. }
            | BranchEvent::Deleted { path } => Some(path.as_str()),
            BranchEvent::Merged { target, .. }
            | BranchEvent::MergeStatusChanged { target, .. } => Some(target.as_str()),
            BranchEvent::Dropped { .. } => None,
        }
    }

    fn is_merge_event(&self) -> bool {
        matches!(self, BranchEvent::MergeStatusChanged { .. })
    }
}

/// Why a subscription was dropped.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    /// Send buffer overflowed (slow consumer).
    BufferOverflow,
    /// Explicitly unsubscribed.
    Unsubscribed,
}

/// Summary of a branch (for events).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BranchSummary {
    pub path: String,
    pub parent_path: String,
    pub base_timestamp: Timestamp,
    pub head_timestamp: Timestamp,
}

impl BranchSummary {
    pub fn from_branch(branch: &Branch) -> Self {
        Self {
            path: branch.path().to_string(),
            parent_path: branch.parent_path().to_string(),
            base_timestamp: branch.base_timestamp(),
            head_timestamp: branch.head_timestamp(),
        }
    }
}

/// Unique identifier for a subscription.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u64);

/// Handle to manage a subscription.
pub struct SubscriptionHandle {
    pub id: SubscriptionId,
    /// Channel to receive events.
    pub receiver: crossbeam_channel::Receiver<BranchEvent>,
}

impl SubscriptionHandle {
    /// Receive the next event (blocking).
    pub fn recv(&self) -> Result<BranchEvent, crossbeam_channel::RecvError> {
        self.receiver.recv()
    }

    /// Try to receive an event (non-blocking).
    pub fn try_recv(&self) -> Result<BranchEvent, crossbeam_channel::TryRecvError> {
        self.receiver.try_recv()
    }

    /// Receive with timeout.
    pub fn recv_timeout(
        &self,
        timeout: std::time::Duration,
    ) -> Result<BranchEvent, crossbeam_channel::RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }
}
