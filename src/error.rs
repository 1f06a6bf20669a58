//! Error types for branching, merging and persistence.

use crate::merge::MergeConflict;
use thiserror::Error;

/// Main error type for branch and merge operations.
#[derive(Debug, Error)]
pub enum BranchError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid input: bad branch name, self-merge, non-increasing commit timestamp.
    #[error("{0}")]
    BadRequest(String),

    /// The operation is not defined for this branch (e.g. rebasing MAIN).
    #[error("{0}")]
    Unsupported(String),

    #[error("{kind} with identifier '{key}' could not be found")]
    NotFound { kind: &'static str, key: String },

    #[error("{kind} with identifier '{key}' already exists")]
    AlreadyExists { kind: &'static str, key: String },

    /// Lock contention or a concurrent structural change.
    #[error("{0}")]
    Conflict(String),

    /// The source branch is not in a mergeable state.
    #[error("{0}")]
    Merge(String),

    /// Content-level conflicts reported by the storage layer.
    #[error("{message}")]
    MergeConflicts {
        message: String,
        conflicts: Vec<MergeConflict>,
    },

    #[error("Operation was cancelled")]
    Cancelled,

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Invalid format: {0}")]
    InvalidFormat(String),

    #[error("Corruption detected: {0}")]
    Corruption(String),

    #[error("Checksum mismatch: expected {expected}, got {got}")]
    ChecksumMismatch { expected: u32, got: u32 },

    #[error("Repository is locked by another process")]
    Locked,

    #[error("Repository not initialized")]
    NotInitialized,

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),
}

impl BranchError {
    pub(crate) fn branch_not_found(path: &str) -> Self {
        BranchError::NotFound {
            kind: "Branch",
            key: path.to_string(),
        }
    }

    pub(crate) fn merge_not_found(id: impl ToString) -> Self {
        BranchError::NotFound {
            kind: "Merge",
            key: id.to_string(),
        }
    }

    /// Whether a caller may retry after inspecting the current state.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            BranchError::AlreadyExists { .. }
                | BranchError::Conflict(_)
                | BranchError::Merge(_)
                | BranchError::MergeConflicts { .. }
        )
    }

    /// HTTP-style status code of this error class.
    pub fn status_code(&self) -> u16 {
        match self {
            BranchError::BadRequest(_) | BranchError::Unsupported(_) => 400,
            BranchError::NotFound { .. } => 404,
            BranchError::AlreadyExists { .. }
            | BranchError::Conflict(_)
            | BranchError::Merge(_)
            | BranchError::MergeConflicts { .. }
            | BranchError::Locked => 409,
            _ => 500,
        }
    }
}

impl From<serde_json::Error> for BranchError {
    fn from(e: serde_json::Error) -> Self {
        BranchError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::encode::Error> for BranchError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        BranchError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for BranchError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        BranchError::Deserialization(e.to_string())
    }
}

/// Result type for branch operations.
pub type Result<T> = std::result::Result<T, BranchError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(BranchError::BadRequest("x".into()).status_code(), 400);
        assert_eq!(BranchError::branch_not_found("MAIN/a").status_code(), 404);
        assert_eq!(BranchError::Merge("x".into()).status_code(), 409);
        assert_eq!(BranchError::Cancelled.status_code(), 500);
    }

    #[test]
    fn test_not_found_message() {
        let err = BranchError::branch_not_found("MAIN/a");
        assert_eq!(
            err.to_string(),
            "Branch with identifier 'MAIN/a' could not be found"
        );
        assert!(!err.is_conflict());
    }
}
