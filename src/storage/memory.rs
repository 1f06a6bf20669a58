//! In-memory content store with conflict detection.

use super::{ContentStore, ReplayOutcome, ReplayRequest};
use crate::branches::Branch;
use crate::error::{BranchError, Result};
use crate::merge::{ConflictType, ConflictingAttribute, MergeConflict};
use crate::types::{CancellationToken, Change, ChangeSet, ComponentKey, Timestamp};
use parking_lot::RwLock;
use std::collections::HashMap;
use tracing::debug;

#[derive(Clone, Debug)]
struct StoredCommit {
    timestamp: Timestamp,
    changes: ChangeSet,
}

/// Keeps one ordered commit log per branch path.
///
/// A branch sees its own commits in `(base, head]` and, through its
/// ancestry, every parent commit made before the child's base.
#[derive(Debug, Default)]
pub struct MemoryContentStore {
    commits: RwLock<HashMap<String, Vec<StoredCommit>>>,
}

impl MemoryContentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve `key` as seen from `ancestry[0]`.
    ///
    /// `ancestry` lists the branch followed by its parents up to the root,
    /// as returned by [`BranchManager::get_ancestry`](crate::BranchManager::get_ancestry).
    pub fn read(&self, ancestry: &[Branch], key: &ComponentKey) -> Option<serde_json::Value> {
        let commits = self.commits.read();
        let mut upper = ancestry.first()?.head_timestamp();

        for branch in ancestry {
            let lower = if branch.is_root() {
                None
            } else {
                Some(branch.base_timestamp())
            };

            if let Some(log) = commits.get(branch.path()) {
                let found = log
                    .iter()
                    .rev()
                    .filter(|c| c.timestamp <= upper && lower.map_or(true, |l| c.timestamp > l))
                    .find_map(|c| c.changes.changes.get(key));
                if let Some(change) = found {
                    return change.value().cloned();
                }
            }

            upper = branch.base_timestamp();
        }

        None
    }

    /// Number of commits stored for `path`.
    pub fn commit_count(&self, path: &str) -> usize {
        self.commits.read().get(path).map_or(0, Vec::len)
    }

    fn squash_range(
        log: Option<&Vec<StoredCommit>>,
        from: Timestamp,
        to: Timestamp,
        cancel: Option<&CancellationToken>,
    ) -> Result<(ChangeSet, usize)> {
        let mut squashed = ChangeSet::new();
        let mut count = 0;
        for commit in log
            .into_iter()
            .flatten()
            .filter(|c| c.timestamp > from && c.timestamp <= to)
        {
            if let Some(cancel) = cancel {
                cancel.checkpoint()?;
            }
            squashed.squash(&commit.changes);
            count += 1;
        }
        Ok((squashed, count))
    }

    fn insert(&self, path: &str, timestamp: Timestamp, changes: ChangeSet) {
        let mut commits = self.commits.write();
        let log = commits.entry(path.to_string()).or_default();
        let at = log.partition_point(|c| c.timestamp < timestamp);
        log.insert(at, StoredCommit { timestamp, changes });
    }
}

impl ContentStore for MemoryContentStore {
    fn commit(&self, branch: &Branch, timestamp: Timestamp, changes: &ChangeSet) -> Result<()> {
        if changes.is_empty() {
            return Err(BranchError::BadRequest(format!(
                "Nothing to commit on '{}'",
                branch.path()
            )));
        }
        self.insert(branch.path(), timestamp, changes.clone());
        Ok(())
    }

    fn replay_commits(
        &self,
        request: ReplayRequest<'_>,
        cancel: &CancellationToken,
    ) -> Result<ReplayOutcome> {
        let (source_changes, replayed, target_changes) = {
            let commits = self.commits.read();
            let (source_changes, replayed) = Self::squash_range(
                commits.get(request.source.path()),
                request.from,
                request.source.head_timestamp(),
                Some(cancel),
            )?;
            let (target_changes, _) = Self::squash_range(
                commits.get(request.against.path()),
                request.from,
                request.against.head_timestamp(),
                None,
            )?;
            (source_changes, replayed, target_changes)
        };

        let conflicts = detect_conflicts(&source_changes, &target_changes);
        if !conflicts.is_empty() {
            debug!(
                source = %request.source.path(),
                against = %request.against.path(),
                conflicts = conflicts.len(),
                "replay produced conflicts"
            );
            return Ok(ReplayOutcome::Conflicts(conflicts));
        }

        cancel.checkpoint()?;
        Ok(ReplayOutcome::Replayed {
            commits: replayed,
            changes: source_changes,
        })
    }
}

fn detect_conflicts(source: &ChangeSet, target: &ChangeSet) -> Vec<MergeConflict> {
    let mut conflicts = Vec::new();

    for (key, source_change) in &source.changes {
        let Some(target_change) = target.changes.get(key) else {
            continue;
        };

        match (source_change, target_change) {
            (Change::Upsert(ours), Change::Upsert(theirs)) if ours != theirs => {
                conflicts.push(MergeConflict::new(
                    key,
                    ConflictType::ConflictingChange,
                    conflicting_attributes(ours, theirs),
                ));
            }
            (Change::Delete, Change::Upsert(theirs)) => {
                conflicts.push(MergeConflict::new(
                    key,
                    ConflictType::DeletedWhileChanged,
                    vec![ConflictingAttribute {
                        property: "value".to_string(),
                        old_value: Some(theirs.clone()),
                        value: None,
                    }],
                ));
            }
            (Change::Upsert(ours), Change::Delete) => {
                conflicts.push(MergeConflict::new(
                    key,
                    ConflictType::ChangedWhileDeleted,
                    vec![ConflictingAttribute {
                        property: "value".to_string(),
                        old_value: None,
                        value: Some(ours.clone()),
                    }],
                ));
            }
            _ => {}
        }
    }

    conflicts
}

fn conflicting_attributes(
    ours: &serde_json::Value,
    theirs: &serde_json::Value,
) -> Vec<ConflictingAttribute> {
    match (ours.as_object(), theirs.as_object()) {
        (Some(ours), Some(theirs)) => {
            let mut properties: Vec<&String> = ours.keys().chain(theirs.keys()).collect();
            properties.sort();
            properties.dedup();
            properties
                .into_iter()
                .filter(|p| ours.get(*p) != theirs.get(*p))
                .map(|p| ConflictingAttribute {
                    property: p.clone(),
                    old_value: theirs.get(p).cloned(),
                    value: ours.get(p).cloned(),
                })
                .collect()
        }
        _ => vec![ConflictingAttribute {
            property: "value".to_string(),
            old_value: Some(theirs.clone()),
            value: Some(ours.clone()),
        }],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::branches::Metadata;
    use serde_json::json;

    fn key(id: &str) -> ComponentKey {
        ComponentKey::new("description", id)
    }

    #[test]
    fn test_child_sees_parent_commits_before_base_only() {
        let store = MemoryContentStore::new();
        let mut main = Branch::root(Timestamp(0));

        store
            .commit(&main, Timestamp(1), &ChangeSet::new().upsert(key("1"), json!("v1")))
            .unwrap();
        main.handle_commit(Timestamp(1)).unwrap();

        let child = Branch::child(&main, "a", Timestamp(2), Metadata::new()).unwrap();

        store
            .commit(&main, Timestamp(3), &ChangeSet::new().upsert(key("1"), json!("v2")))
            .unwrap();
        main.handle_commit(Timestamp(3)).unwrap();

        let ancestry = vec![child, main.clone()];
        assert_eq!(store.read(&ancestry, &key("1")), Some(json!("v1")));
        assert_eq!(store.read(&[main], &key("1")), Some(json!("v2")));
    }

    #[test]
    fn test_delete_hides_component() {
        let store = MemoryContentStore::new();
        let mut main = Branch::root(Timestamp(0));
        store
            .commit(&main, Timestamp(1), &ChangeSet::new().upsert(key("1"), json!("v1")))
            .unwrap();
        store
            .commit(&main, Timestamp(2), &ChangeSet::new().delete(key("1")))
            .unwrap();
        main.handle_commit(Timestamp(2)).unwrap();

        assert_eq!(store.read(&[main], &key("1")), None);
    }

    #[test]
    fn test_empty_commit_is_rejected() {
        let store = MemoryContentStore::new();
        let main = Branch::root(Timestamp(0));
        let result = store.commit(&main, Timestamp(1), &ChangeSet::new());
        assert!(matches!(result, Err(BranchError::BadRequest(_))));
    }

    #[test]
    fn test_conflicting_object_changes_report_attributes() {
        let source = ChangeSet::new().upsert(key("1"), json!({"term": "a", "caseSignificance": "x"}));
        let target = ChangeSet::new().upsert(key("1"), json!({"term": "a", "caseSignificance": "y"}));

        let conflicts = detect_conflicts(&source, &target);
        assert_eq!(conflicts.len(), 1);
        let conflict = &conflicts[0];
        assert_eq!(conflict.component_id, "1");
        assert_eq!(conflict.component_type, "description");
        assert_eq!(conflict.conflict_type, ConflictType::ConflictingChange);
        assert_eq!(conflict.conflicting_attributes.len(), 1);
        let attribute = &conflict.conflicting_attributes[0];
        assert_eq!(attribute.property, "caseSignificance");
        assert_eq!(attribute.old_value, Some(json!("y")));
        assert_eq!(attribute.value, Some(json!("x")));
    }

    #[test]
    fn test_deletion_conflicts() {
        let source = ChangeSet::new()
            .delete(key("1"))
            .upsert(key("2"), json!("changed"))
            .delete(key("3"));
        let target = ChangeSet::new()
            .upsert(key("1"), json!("changed"))
            .delete(key("2"))
            .delete(key("3"));

        let conflicts = detect_conflicts(&source, &target);
        let types: Vec<_> = conflicts.iter().map(|c| c.conflict_type).collect();
        assert_eq!(
            types,
            vec![ConflictType::DeletedWhileChanged, ConflictType::ChangedWhileDeleted]
        );
    }

    #[test]
    fn test_identical_changes_do_not_conflict() {
        let source = ChangeSet::new().upsert(key("1"), json!("same"));
        let target = ChangeSet::new().upsert(key("1"), json!("same"));
        assert!(detect_conflicts(&source, &target).is_empty());
    }

    #[test]
    fn test_replay_checks_cancellation() {
        let store = MemoryContentStore::new();
        let main = Branch::root(Timestamp(0));
        let mut child = Branch::child(&main, "a", Timestamp(1), Metadata::new()).unwrap();
        store
            .commit(&child, Timestamp(2), &ChangeSet::new().upsert(key("1"), json!("v")))
            .unwrap();
        child.handle_commit(Timestamp(2)).unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = store.replay_commits(
            ReplayRequest {
                source: &child,
                from: child.base_timestamp(),
                against: &main,
            },
            &cancel,
        );
        assert!(matches!(result, Err(BranchError::Cancelled)));
        assert_eq!(store.commit_count("MAIN"), 0);
    }

    #[test]
    fn test_replay_does_not_write() {
        let store = MemoryContentStore::new();
        let main = Branch::root(Timestamp(0));
        let mut child = Branch::child(&main, "a", Timestamp(1), Metadata::new()).unwrap();
        for (ts, value) in [(2, "v1"), (3, "v2")] {
            store
                .commit(&child, Timestamp(ts), &ChangeSet::new().upsert(key("1"), json!(value)))
                .unwrap();
            child.handle_commit(Timestamp(ts)).unwrap();
        }

        let outcome = store
            .replay_commits(
                ReplayRequest {
                    source: &child,
                    from: child.base_timestamp(),
                    against: &main,
                },
                &CancellationToken::new(),
            )
            .unwrap();

        assert_eq!(
            outcome,
            ReplayOutcome::Replayed {
                commits: 2,
                changes: ChangeSet::new().upsert(key("1"), json!("v2")),
            }
        );
        assert_eq!(store.commit_count("MAIN"), 0);
        assert_eq!(store.commit_count("MAIN/a"), 2);
    }
}
