//! Merge records, conflicts and error descriptors.

use crate::error::BranchError;
use crate::types::{ComponentKey, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Lifecycle of a merge or rebase request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MergeStatus {
    Scheduled,
    InProgress,
    Completed,
    Failed,
    CancelRequested,
    Cancelled,
}

impl MergeStatus {
    /// Whether no further transition can happen.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            MergeStatus::Completed | MergeStatus::Failed | MergeStatus::Cancelled
        )
    }
}

impl fmt::Display for MergeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MergeStatus::Scheduled => "SCHEDULED",
            MergeStatus::InProgress => "IN_PROGRESS",
            MergeStatus::Completed => "COMPLETED",
            MergeStatus::Failed => "FAILED",
            MergeStatus::CancelRequested => "CANCEL_REQUESTED",
            MergeStatus::Cancelled => "CANCELLED",
        };
        f.write_str(name)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConflictType {
    /// Both sides changed the component to different values.
    ConflictingChange,
    /// The source deleted a component the target changed.
    DeletedWhileChanged,
    /// The source changed a component the target deleted.
    ChangedWhileDeleted,
}

/// One attribute that differs between the two sides of a conflict.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictingAttribute {
    pub property: String,
    /// Value on the target side.
    pub old_value: Option<serde_json::Value>,
    /// Value on the source side.
    pub value: Option<serde_json::Value>,
}

/// A content-level clash detected while replaying commits.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeConflict {
    pub component_id: String,
    pub component_type: String,
    #[serde(rename = "type")]
    pub conflict_type: ConflictType,
    pub conflicting_attributes: Vec<ConflictingAttribute>,
    pub message: String,
}

impl MergeConflict {
    pub fn new(
        key: &ComponentKey,
        conflict_type: ConflictType,
        conflicting_attributes: Vec<ConflictingAttribute>,
    ) -> Self {
        let message = match conflict_type {
            ConflictType::ConflictingChange => {
                format!("{key} has changed on both sides")
            }
            ConflictType::DeletedWhileChanged => {
                format!("{key} was deleted on the source while it changed on the target")
            }
            ConflictType::ChangedWhileDeleted => {
                format!("{key} changed on the source while it was deleted on the target")
            }
        };

        Self {
            component_id: key.id.clone(),
            component_type: key.component_type.clone(),
            conflict_type,
            conflicting_attributes,
            message,
        }
    }
}

/// Serializable error descriptor attached to failed merges.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiError {
    pub message: String,
    pub developer_message: Option<String>,
    pub code: u16,
    #[serde(default)]
    pub additional_info: BTreeMap<String, serde_json::Value>,
}

impl From<&BranchError> for ApiError {
    fn from(err: &BranchError) -> Self {
        let mut additional_info = BTreeMap::new();
        let developer_message = match err {
            BranchError::MergeConflicts { conflicts, .. } => {
                additional_info.insert("conflictCount".to_string(), conflicts.len().into());
                None
            }
            BranchError::NotFound { kind, key } => {
                additional_info.insert("kind".to_string(), (*kind).into());
                additional_info.insert("key".to_string(), key.clone().into());
                None
            }
            other if other.status_code() == 500 => Some(format!("{other:?}")),
            _ => None,
        };

        Self {
            message: err.to_string(),
            developer_message,
            code: err.status_code(),
            additional_info,
        }
    }
}

/// A merge or rebase request and its outcome.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Merge {
    pub id: Uuid,
    pub source: String,
    pub target: String,
    pub status: MergeStatus,
    pub commit_message: Option<String>,
    pub review_id: Option<String>,
    pub scheduled_date: Option<Timestamp>,
    pub start_date: Option<Timestamp>,
    pub end_date: Option<Timestamp>,
    pub api_error: Option<ApiError>,
    #[serde(default)]
    pub conflicts: Vec<MergeConflict>,
}

impl Merge {
    pub(crate) fn scheduled(
        source: &str,
        target: &str,
        commit_message: Option<String>,
        review_id: Option<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            source: source.to_string(),
            target: target.to_string(),
            status: MergeStatus::Scheduled,
            commit_message,
            review_id,
            scheduled_date: Some(Timestamp::now()),
            start_date: None,
            end_date: None,
            api_error: None,
            conflicts: Vec::new(),
        }
    }

    /// A pending cancellation request is kept.
    pub(crate) fn start(&mut self) {
        if self.status == MergeStatus::Scheduled {
            self.status = MergeStatus::InProgress;
        }
        self.start_date = Some(Timestamp::now());
    }

    pub(crate) fn complete(&mut self) {
        self.finish(MergeStatus::Completed);
    }

    pub(crate) fn cancel(&mut self) {
        self.finish(MergeStatus::Cancelled);
    }

    /// Record a failure; conflicts are kept as structured data.
    pub(crate) fn fail(&mut self, err: &BranchError) {
        self.api_error = Some(ApiError::from(err));
        if let BranchError::MergeConflicts { conflicts, .. } = err {
            self.conflicts = conflicts.clone();
        }
        self.finish(MergeStatus::Failed);
    }

    fn finish(&mut self, status: MergeStatus) {
        self.status = status;
        self.end_date = Some(Timestamp::now());
    }
}

/// Criteria for [`MergeService::search`](super::MergeService::search).
#[derive(Clone, Debug, Default)]
pub struct MergeFilter {
    pub source: Option<String>,
    pub target: Option<String>,
    pub status: Option<MergeStatus>,
}

impl MergeFilter {
    pub fn matches(&self, merge: &Merge) -> bool {
        self.source.as_deref().map_or(true, |s| s == merge.source)
            && self.target.as_deref().map_or(true, |t| t == merge.target)
            && self.status.map_or(true, |s| s == merge.status)
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct MergeCollection {
    pub items: Vec<Merge>,
    pub total: usize,
}
