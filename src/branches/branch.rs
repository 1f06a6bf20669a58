//! The branch value type and its state machine.

use crate::error::{BranchError, Result};
use crate::types::{BranchState, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};

/// Path (and name) of the root branch.
pub const MAIN_PATH: &str = "MAIN";

/// Separator between path segments.
pub const SEPARATOR: char = '/';

/// Maximum length of a single branch name.
pub const MAX_NAME_LENGTH: usize = 50;

/// Arbitrary key/value metadata attached to a branch.
pub type Metadata = BTreeMap<String, serde_json::Value>;

/// Whether a branch is the root of the namespace.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BranchKind {
    Root,
    Child,
}

/// A named line of development forked from its parent at `base_timestamp`.
///
/// Identity is `(path, base_timestamp)`: a rebase produces a new identity at
/// the same path, while the head moves in place as commits arrive.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Branch {
    path: String,
    name: String,
    parent_path: String,
    base_timestamp: Timestamp,
    head_timestamp: Timestamp,
    deleted: bool,
    #[serde(default)]
    metadata: Metadata,
}

impl Branch {
    pub(crate) fn root(base: Timestamp) -> Self {
        Self {
            path: MAIN_PATH.to_string(),
            name: MAIN_PATH.to_string(),
            parent_path: MAIN_PATH.to_string(),
            base_timestamp: base,
            head_timestamp: base,
            deleted: false,
            metadata: Metadata::new(),
        }
    }

    /// Fork a new branch off `parent` at `base`.
    pub(crate) fn child(
        parent: &Branch,
        name: &str,
        base: Timestamp,
        metadata: Metadata,
    ) -> Result<Self> {
        validate_name(name)?;
        if base.0 < 0 {
            return Err(BranchError::BadRequest(format!(
                "Base timestamp must not be negative, got {base}"
            )));
        }
        if base <= parent.head_timestamp {
            return Err(BranchError::BadRequest(format!(
                "Base timestamp {base} of '{name}' must be after head {} of parent '{}'",
                parent.head_timestamp, parent.path
            )));
        }

        Ok(Self {
            path: child_path(&parent.path, name),
            name: name.to_string(),
            parent_path: parent.path.clone(),
            base_timestamp: base,
            head_timestamp: base,
            deleted: false,
            metadata,
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn parent_path(&self) -> &str {
        &self.parent_path
    }

    pub fn base_timestamp(&self) -> Timestamp {
        self.base_timestamp
    }

    pub fn head_timestamp(&self) -> Timestamp {
        self.head_timestamp
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn kind(&self) -> BranchKind {
        if self.path == MAIN_PATH {
            BranchKind::Root
        } else {
            BranchKind::Child
        }
    }

    pub fn is_root(&self) -> bool {
        self.kind() == BranchKind::Root
    }

    /// Whether this branch has commits of its own since its base.
    pub fn has_commits(&self) -> bool {
        self.head_timestamp > self.base_timestamp
    }

    /// State of this branch compared to `other`.
    ///
    /// The root is always [`BranchState::UpToDate`].
    pub fn state(&self, other: &Branch) -> BranchState {
        if self.is_root() {
            return BranchState::UpToDate;
        }

        let base = self.base_timestamp;
        if base < other.base_timestamp {
            BranchState::Stale
        } else if self.head_timestamp > base && other.head_timestamp < base {
            BranchState::Forward
        } else if self.head_timestamp == base && other.head_timestamp > base {
            BranchState::Behind
        } else if self.head_timestamp > base && other.head_timestamp > base {
            BranchState::Diverged
        } else {
            BranchState::UpToDate
        }
    }

    /// Advance the head to `timestamp`, which must be after the current head.
    pub fn handle_commit(&mut self, timestamp: Timestamp) -> Result<()> {
        if timestamp <= self.head_timestamp {
            return Err(BranchError::BadRequest(format!(
                "Commit timestamp {timestamp} on '{}' must be after head {}",
                self.path, self.head_timestamp
            )));
        }
        self.head_timestamp = timestamp;
        Ok(())
    }

    /// A fresh identity of this branch forked off `onto` at `base`.
    pub(crate) fn rebased(&self, onto: &Branch, base: Timestamp) -> Result<Branch> {
        if self.is_root() {
            return Err(BranchError::Unsupported(format!(
                "{MAIN_PATH} cannot be rebased"
            )));
        }
        Branch::child(onto, &self.name, base, self.metadata.clone())
    }

    pub(crate) fn mark_deleted(&mut self) {
        self.deleted = true;
    }

    pub(crate) fn set_metadata(&mut self, metadata: Metadata) {
        self.metadata = metadata;
    }
}

impl PartialEq for Branch {
    fn eq(&self, other: &Self) -> bool {
        self.path == other.path && self.base_timestamp == other.base_timestamp
    }
}

impl Eq for Branch {}

impl Hash for Branch {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.path.hash(state);
        self.base_timestamp.hash(state);
    }
}

/// Check a single path segment: 1-50 characters of `[a-zA-Z0-9_-]`.
pub fn validate_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name.len() <= MAX_NAME_LENGTH
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');

    if valid {
        Ok(())
    } else {
        Err(BranchError::BadRequest(format!(
            "'{name}' is either too long (max {MAX_NAME_LENGTH} characters) or it contains invalid characters (only 'a-z', 'A-Z', '0-9', '_' and '-' characters are allowed)"
        )))
    }
}

pub(crate) fn child_path(parent: &str, name: &str) -> String {
    format!("{parent}{SEPARATOR}{name}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn branch(base: i64, head: i64) -> Branch {
        let mut parent = Branch::root(Timestamp(0));
        parent.head_timestamp = Timestamp(base - 1);
        let mut branch = Branch::child(&parent, "a", Timestamp(base), Metadata::new()).unwrap();
        branch.head_timestamp = Timestamp(head);
        branch
    }

    fn reference(base: i64, head: i64) -> Branch {
        let mut main = Branch::root(Timestamp(base));
        main.head_timestamp = Timestamp(head);
        main
    }

    #[test]
    fn test_root_defaults() {
        let main = Branch::root(Timestamp(7));
        assert_eq!(main.path(), MAIN_PATH);
        assert_eq!(main.name(), MAIN_PATH);
        assert_eq!(main.parent_path(), MAIN_PATH);
        assert_eq!(main.head_timestamp(), main.base_timestamp());
        assert_eq!(main.kind(), BranchKind::Root);
    }

    #[test]
    fn test_child_path_and_kind() {
        let main = Branch::root(Timestamp(0));
        let child = Branch::child(&main, "a", Timestamp(1), Metadata::new()).unwrap();
        assert_eq!(child.path(), "MAIN/a");
        assert_eq!(child.parent_path(), MAIN_PATH);
        assert_eq!(child.kind(), BranchKind::Child);
        assert_eq!(child.state(&main), BranchState::UpToDate);
    }

    #[test]
    fn test_child_must_be_based_after_parent_head() {
        let mut main = Branch::root(Timestamp(0));
        main.handle_commit(Timestamp(5)).unwrap();
        let result = Branch::child(&main, "a", Timestamp(5), Metadata::new());
        assert!(matches!(result, Err(BranchError::BadRequest(_))));
    }

    #[test]
    fn test_states() {
        assert_eq!(branch(5, 5).state(&reference(0, 3)), BranchState::UpToDate);
        assert_eq!(branch(5, 8).state(&reference(0, 3)), BranchState::Forward);
        assert_eq!(branch(5, 5).state(&reference(0, 7)), BranchState::Behind);
        assert_eq!(branch(5, 8).state(&reference(0, 7)), BranchState::Diverged);
        assert_eq!(branch(5, 8).state(&reference(6, 7)), BranchState::Stale);
    }

    #[test]
    fn test_root_is_always_up_to_date() {
        let main = reference(0, 10);
        assert_eq!(main.state(&branch(5, 20)), BranchState::UpToDate);
    }

    #[test]
    fn test_handle_commit_requires_increasing_timestamp() {
        let mut main = Branch::root(Timestamp(3));
        assert!(main.handle_commit(Timestamp(3)).is_err());
        assert!(main.handle_commit(Timestamp(2)).is_err());
        main.handle_commit(Timestamp(4)).unwrap();
        assert_eq!(main.head_timestamp(), Timestamp(4));
    }

    #[test]
    fn test_equality_ignores_head() {
        let a = branch(5, 5);
        let b = branch(5, 9);
        assert_eq!(a, b);
        assert_ne!(a, branch(6, 6));
    }

    #[test]
    fn test_root_cannot_be_rebased() {
        let main = Branch::root(Timestamp(0));
        let result = main.rebased(&main, Timestamp(1));
        assert!(matches!(result, Err(BranchError::Unsupported(_))));
    }

    #[test]
    fn test_name_validation() {
        assert!(validate_name("task-1_A").is_ok());
        assert!(validate_name("").is_err());
        assert!(validate_name("a/b").is_err());
        assert!(validate_name("white space").is_err());
        assert!(validate_name(&"x".repeat(MAX_NAME_LENGTH)).is_ok());
        assert!(validate_name(&"x".repeat(MAX_NAME_LENGTH + 1)).is_err());
    }

    #[test]
    fn test_json_field_names() {
        let main = Branch::root(Timestamp(0));
        let json = serde_json::to_value(&main).unwrap();
        assert_eq!(json["parentPath"], "MAIN");
        assert_eq!(json["baseTimestamp"], 0);
        assert_eq!(json["headTimestamp"], 0);
        assert_eq!(json["deleted"], false);
    }
}
