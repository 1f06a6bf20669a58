//! Branch manager implementation.

use super::branch::{child_path, validate_name, Branch, BranchKind, Metadata, MAIN_PATH, SEPARATOR};
use crate::error::{BranchError, Result};
use crate::events::{BranchEvent, BranchSummary, EventBus};
use crate::storage::{ContentStore, NoContent, ReplayOutcome, ReplayRequest};
use crate::timestamp::TimestampAuthority;
use crate::types::{BranchState, CancellationToken, ChangeSet, Timestamp};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// Magic bytes for branch index file.
const BRANCH_INDEX_MAGIC: &[u8; 4] = b"BRI\0";

/// Current branch index format version.
const BRANCH_INDEX_VERSION: u8 = 1;

/// Branch index stored on disk.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct BranchIndex {
    /// Current identity of every path.
    branches: HashMap<String, Branch>,

    /// Superseded identities per path, oldest first.
    history: HashMap<String, Vec<Branch>>,
}

impl BranchIndex {
    fn get(&self, path: &str) -> Result<&Branch> {
        self.branches
            .get(path)
            .ok_or_else(|| BranchError::branch_not_found(path))
    }

    fn get_mut(&mut self, path: &str) -> Result<&mut Branch> {
        self.branches
            .get_mut(path)
            .ok_or_else(|| BranchError::branch_not_found(path))
    }

    /// Make `branch` the current identity of its path.
    fn replace(&mut self, branch: Branch) {
        let path = branch.path().to_string();
        if let Some(previous) = self.branches.insert(path.clone(), branch) {
            self.history.entry(path).or_default().push(previous);
        }
    }

    fn latest_timestamp(&self) -> Timestamp {
        self.branches
            .values()
            .chain(self.history.values().flatten())
            .map(Branch::head_timestamp)
            .max()
            .unwrap_or_default()
    }
}

/// Owns the branch namespace.
///
/// Every structural change goes through the registry write lock. Rebase and
/// merge replay content without it, then compare-and-swap against the
/// identities read before the replay and commit the replayed changes only
/// when the swap succeeds.
pub struct BranchManager {
    /// Path to branch index file.
    path: Option<PathBuf>,

    authority: Arc<dyn TimestampAuthority>,

    /// In-memory index.
    index: RwLock<BranchIndex>,

    events: Arc<EventBus>,
}

impl BranchManager {
    /// Create an in-memory branch manager with a fresh `MAIN` branch.
    pub fn new(authority: Arc<dyn TimestampAuthority>) -> Result<Self> {
        Self::with_events(authority, Arc::new(EventBus::new()))
    }

    /// Like [`new`](Self::new), publishing to an existing event bus.
    pub fn with_events(authority: Arc<dyn TimestampAuthority>, events: Arc<EventBus>) -> Result<Self> {
        let main = Branch::root(authority.get_timestamp()?);

        let mut index = BranchIndex::default();
        index.replace(main);

        Ok(Self {
            path: None,
            authority,
            index: RwLock::new(index),
            events,
        })
    }

    /// Load the registry from `path`, or start a fresh one persisted there.
    pub fn open(
        path: impl AsRef<Path>,
        authority: Arc<dyn TimestampAuthority>,
        events: Arc<EventBus>,
    ) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        if !path.exists() {
            let mut manager = Self::with_events(authority, events)?;
            manager.path = Some(path);
            return Ok(manager);
        }

        let index = Self::load_from_file(&path)?;
        let latest = index.latest_timestamp();
        let probe = authority.get_timestamp()?;
        if probe <= latest {
            return Err(BranchError::Corruption(format!(
                "Timestamp authority issued {probe}, which is not after the latest registry timestamp {latest}"
            )));
        }

        debug!(path = %path.display(), branches = index.branches.len(), "loaded branch registry");

        Ok(Self {
            path: Some(path),
            authority,
            index: RwLock::new(index),
            events,
        })
    }

    pub fn authority(&self) -> &Arc<dyn TimestampAuthority> {
        &self.authority
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    /// Create a child branch `name` under `parent`.
    pub fn create_branch(&self, parent: &str, name: &str) -> Result<Branch> {
        self.create_branch_with_metadata(parent, name, Metadata::new())
    }

    /// Create a child branch carrying `metadata`.
    ///
    /// A deleted branch at the same path is reopened: a new identity based on
    /// the parent's current head replaces it.
    pub fn create_branch_with_metadata(
        &self,
        parent: &str,
        name: &str,
        metadata: Metadata,
    ) -> Result<Branch> {
        validate_name(name)?;

        let branch = {
            let mut index = self.index.write();

            let parent_branch = index.get(parent)?.clone();
            if parent_branch.is_deleted() {
                return Err(BranchError::BadRequest(format!(
                    "Cannot create '{name}' child branch under deleted '{parent}' parent."
                )));
            }

            let path = child_path(parent, name);
            if let Some(existing) = index.branches.get(&path) {
                if !existing.is_deleted() {
                    return Err(BranchError::AlreadyExists {
                        kind: "Branch",
                        key: path,
                    });
                }
            }

            let base = self.authority.get_timestamp()?;
            let branch = Branch::child(&parent_branch, name, base, metadata)?;
            index.replace(branch.clone());
            branch
        };

        info!(path = %branch.path(), base = %branch.base_timestamp(), "created branch");
        self.events.publish(BranchEvent::Created {
            branch: BranchSummary::from_branch(&branch),
        });

        Ok(branch)
    }

    /// Get the current identity of a branch.
    pub fn get_branch(&self, path: &str) -> Result<Branch> {
        self.index.read().get(path).cloned()
    }

    /// Snapshot of the current identity of every branch, ordered by path.
    pub fn get_branches(&self) -> Vec<Branch> {
        let mut branches: Vec<Branch> = self.index.read().branches.values().cloned().collect();
        branches.sort_by(|a, b| a.path().cmp(b.path()));
        branches
    }

    /// Superseded identities of `path`, oldest first.
    pub fn get_history(&self, path: &str) -> Result<Vec<Branch>> {
        let index = self.index.read();
        index.get(path)?;
        Ok(index.history.get(path).cloned().unwrap_or_default())
    }

    pub fn branch_count(&self) -> usize {
        self.index.read().branches.len()
    }

    /// Advance the head of `path` after a successful content commit.
    pub fn handle_commit(&self, path: &str, timestamp: Timestamp) -> Result<Branch> {
        let branch = {
            let mut index = self.index.write();
            let branch = index.get_mut(path)?;
            if branch.is_deleted() {
                return Err(BranchError::BadRequest(format!(
                    "Cannot commit to deleted branch '{path}'."
                )));
            }
            branch.handle_commit(timestamp)?;
            branch.clone()
        };

        debug!(path, head = %timestamp, "branch head advanced");
        self.events.publish(BranchEvent::Committed {
            path: path.to_string(),
            head: timestamp,
        });

        Ok(branch)
    }

    /// Commit `changes` to `path` through `store` and advance its head.
    ///
    /// The timestamp is taken and the content written while the registry is
    /// locked, so commits to one branch are applied in timestamp order and a
    /// concurrent rebase or merge of the branch sees either all of it or none.
    pub fn commit_with(
        &self,
        path: &str,
        store: &dyn ContentStore,
        changes: &ChangeSet,
    ) -> Result<Timestamp> {
        let timestamp = {
            let mut index = self.index.write();
            let branch = index.get_mut(path)?;
            if branch.is_deleted() {
                return Err(BranchError::BadRequest(format!(
                    "Cannot commit to deleted branch '{path}'."
                )));
            }
            let timestamp = self.authority.get_timestamp()?;
            store.commit(branch, timestamp, changes)?;
            branch.handle_commit(timestamp)?;
            timestamp
        };

        debug!(path, head = %timestamp, changes = changes.len(), "committed changes");
        self.events.publish(BranchEvent::Committed {
            path: path.to_string(),
            head: timestamp,
        });

        Ok(timestamp)
    }

    /// State of `path` compared to its parent.
    pub fn branch_state(&self, path: &str) -> Result<BranchState> {
        let index = self.index.read();
        let branch = index.get(path)?;
        match branch.kind() {
            BranchKind::Root => Ok(BranchState::UpToDate),
            BranchKind::Child => Ok(branch.state(index.get(branch.parent_path())?)),
        }
    }

    /// State of `path` compared to `other`.
    pub fn branch_state_between(&self, path: &str, other: &str) -> Result<BranchState> {
        let index = self.index.read();
        Ok(index.get(path)?.state(index.get(other)?))
    }

    /// Rebase `path` onto the current identity of its parent.
    ///
    /// Only the branch shell is rebuilt. Content the branch committed to a
    /// [`ContentStore`] is not replayed and stays behind the old base, so
    /// branches with content are rebased with [`rebase_with`](Self::rebase_with).
    pub fn rebase(&self, path: &str) -> Result<Branch> {
        self.rebase_with(path, &NoContent, &CancellationToken::new())
    }

    /// Rebase `path` onto its parent, replaying its own commits through `store`.
    ///
    /// `UP_TO_DATE` and `FORWARD` branches are returned unchanged. Otherwise a
    /// new identity based at a fresh timestamp replaces the branch; if it had
    /// commits of its own they are replayed and the head moves to another
    /// fresh timestamp.
    pub fn rebase_with(
        &self,
        path: &str,
        store: &dyn ContentStore,
        cancel: &CancellationToken,
    ) -> Result<Branch> {
        let (branch, parent) = {
            let index = self.index.read();
            let branch = index.get(path)?.clone();
            if branch.kind() == BranchKind::Root {
                return Err(BranchError::Unsupported(format!(
                    "{MAIN_PATH} cannot be rebased"
                )));
            }
            if branch.is_deleted() {
                return Err(BranchError::BadRequest(format!(
                    "Deleted branch '{path}' cannot be rebased."
                )));
            }
            let parent = index.get(branch.parent_path())?.clone();
            (branch, parent)
        };

        let state = branch.state(&parent);
        match state {
            BranchState::UpToDate | BranchState::Forward => {
                debug!(path, %state, "nothing to rebase");
                return Ok(branch);
            }
            BranchState::Behind | BranchState::Diverged | BranchState::Stale => {}
        }

        cancel.checkpoint()?;
        let base = self.authority.get_timestamp()?;
        let mut rebased = branch.rebased(&parent, base)?;

        let replayed = if branch.has_commits() {
            let changes = replay(
                store,
                ReplayRequest {
                    source: &branch,
                    from: branch.base_timestamp(),
                    against: &parent,
                },
                cancel,
                || format!("Rebase of '{path}' onto '{}'", parent.path()),
            )?;
            rebased.handle_commit(self.authority.get_timestamp()?)?;
            changes
        } else {
            ChangeSet::new()
        };

        {
            let mut index = self.index.write();
            let unchanged = is_unchanged(index.get(path)?, &branch)
                && is_unchanged(index.get(parent.path())?, &parent);
            if !unchanged {
                return Err(BranchError::Conflict(format!(
                    "Branch '{path}' or its parent changed while it was being rebased."
                )));
            }
            if !replayed.is_empty() {
                store.commit(&rebased, rebased.head_timestamp(), &replayed)?;
            }
            index.replace(rebased.clone());
        }

        info!(
            path,
            %state,
            base = %rebased.base_timestamp(),
            head = %rebased.head_timestamp(),
            "rebased branch"
        );
        self.events.publish(BranchEvent::Rebased {
            path: path.to_string(),
            base: rebased.base_timestamp(),
            head: rebased.head_timestamp(),
        });

        Ok(rebased)
    }

    /// Merge `source` into `target`, advancing only the target head.
    ///
    /// No content is replayed; see [`merge_with`](Self::merge_with).
    pub fn merge(&self, source: &str, target: &str) -> Result<Branch> {
        self.merge_with(source, target, &NoContent, &CancellationToken::new())
    }

    /// Merge `source` into `target`, replaying the source commits through `store`.
    ///
    /// The source must be `FORWARD` compared to the target.
    pub fn merge_with(
        &self,
        source: &str,
        target: &str,
        store: &dyn ContentStore,
        cancel: &CancellationToken,
    ) -> Result<Branch> {
        if source == target {
            return Err(BranchError::BadRequest(format!(
                "Can't merge branch '{target}' onto itself."
            )));
        }

        let (from, to) = {
            let index = self.index.read();
            (index.get(source)?.clone(), index.get(target)?.clone())
        };

        if from.is_deleted() || to.is_deleted() {
            return Err(BranchError::BadRequest(format!(
                "Cannot merge '{source}' into '{target}', one of them is deleted."
            )));
        }

        let state = from.state(&to);
        if state != BranchState::Forward {
            return Err(BranchError::Merge(format!(
                "Only source in the FORWARD state can be merged. '{source}' is {state} compared to '{target}'."
            )));
        }

        cancel.checkpoint()?;
        let timestamp = self.authority.get_timestamp()?;
        if timestamp <= from.head_timestamp() {
            return Err(BranchError::BadRequest(format!(
                "Merge timestamp {timestamp} must be after the head {} of '{source}'.",
                from.head_timestamp()
            )));
        }

        let replayed = replay(
            store,
            ReplayRequest {
                source: &from,
                from: from.base_timestamp(),
                against: &to,
            },
            cancel,
            || format!("Merge of '{source}' into '{target}'"),
        )?;

        let merged = {
            let mut index = self.index.write();
            let unchanged =
                is_unchanged(index.get(source)?, &from) && is_unchanged(index.get(target)?, &to);
            if !unchanged {
                return Err(BranchError::Conflict(format!(
                    "'{source}' or '{target}' changed while merging."
                )));
            }
            if !replayed.is_empty() {
                store.commit(&to, timestamp, &replayed)?;
            }
            let branch = index.get_mut(target)?;
            branch.handle_commit(timestamp)?;
            branch.clone()
        };

        info!(source, target, head = %timestamp, "merged branch");
        self.events.publish(BranchEvent::Merged {
            source: source.to_string(),
            target: target.to_string(),
            head: timestamp,
        });

        Ok(merged)
    }

    /// Soft-delete `path` and all of its descendants.
    ///
    /// Returns the paths that were newly marked deleted.
    pub fn delete(&self, path: &str) -> Result<Vec<String>> {
        if path == MAIN_PATH {
            return Err(BranchError::BadRequest(format!(
                "{MAIN_PATH} cannot be deleted"
            )));
        }

        let deleted = {
            let mut index = self.index.write();
            index.get(path)?;

            let prefix = format!("{path}{SEPARATOR}");
            let mut deleted: Vec<String> = index
                .branches
                .values_mut()
                .filter(|b| !b.is_deleted() && (b.path() == path || b.path().starts_with(&prefix)))
                .map(|b| {
                    b.mark_deleted();
                    b.path().to_string()
                })
                .collect();
            deleted.sort();
            deleted
        };

        for path in &deleted {
            info!(path = %path, "deleted branch");
            self.events.publish(BranchEvent::Deleted { path: path.clone() });
        }

        Ok(deleted)
    }

    /// Replace the metadata of `path`.
    pub fn update_metadata(&self, path: &str, metadata: Metadata) -> Result<Branch> {
        let mut index = self.index.write();
        let branch = index.get_mut(path)?;
        branch.set_metadata(metadata);
        Ok(branch.clone())
    }

    /// All branches below `path` (transitively), ordered by path.
    pub fn get_children(&self, path: &str) -> Result<Vec<Branch>> {
        let index = self.index.read();
        index.get(path)?;

        let prefix = format!("{path}{SEPARATOR}");
        let mut children: Vec<Branch> = index
            .branches
            .values()
            .filter(|b| b.path().starts_with(&prefix))
            .cloned()
            .collect();
        children.sort_by(|a, b| a.path().cmp(b.path()));
        Ok(children)
    }

    /// Get branch ancestry (from the branch up to `MAIN`).
    pub fn get_ancestry(&self, path: &str) -> Result<Vec<Branch>> {
        let index = self.index.read();
        let mut ancestry = Vec::new();

        let mut current = index.get(path)?;
        loop {
            ancestry.push(current.clone());
            if current.is_root() {
                break;
            }
            current = index.get(current.parent_path())?;
        }

        Ok(ancestry)
    }

    /// Save branch index to file.
    pub fn save(&self) -> Result<()> {
        let path = self.path.as_ref().ok_or_else(|| {
            BranchError::InvalidOperation("Branch manager has no backing file".into())
        })?;

        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;

        // Write magic
        file.write_all(BRANCH_INDEX_MAGIC)?;

        // Write version
        file.write_all(&[BRANCH_INDEX_VERSION])?;

        // Serialize index with MessagePack
        let encoded = rmp_serde::to_vec(&*self.index.read())?;

        file.write_all(&(encoded.len() as u64).to_le_bytes())?;
        file.write_all(&encoded)?;

        file.sync_all()?;
        Ok(())
    }

    /// Load branch index from file.
    fn load_from_file(path: &Path) -> Result<BranchIndex> {
        let mut file = File::open(path)?;

        // Read magic
        let mut magic = [0u8; 4];
        file.read_exact(&mut magic)?;
        if &magic != BRANCH_INDEX_MAGIC {
            return Err(BranchError::InvalidFormat(
                "Invalid branch index magic".into(),
            ));
        }

        // Read version
        let mut version = [0u8; 1];
        file.read_exact(&mut version)?;
        if version[0] != BRANCH_INDEX_VERSION {
            return Err(BranchError::InvalidFormat(format!(
                "Unsupported branch index version: {}",
                version[0]
            )));
        }

        // Read index
        let mut len_bytes = [0u8; 8];
        file.read_exact(&mut len_bytes)?;
        let len = u64::from_le_bytes(len_bytes) as usize;

        let mut encoded = vec![0u8; len];
        file.read_exact(&mut encoded)?;

        let index: BranchIndex = rmp_serde::from_slice(&encoded)?;
        if !index.branches.contains_key(MAIN_PATH) {
            return Err(BranchError::Corruption(format!(
                "Branch index has no {MAIN_PATH} branch"
            )));
        }

        Ok(index)
    }
}

/// Squashed source changes of a conflict-free replay.
fn replay(
    store: &dyn ContentStore,
    request: ReplayRequest<'_>,
    cancel: &CancellationToken,
    operation: impl FnOnce() -> String,
) -> Result<ChangeSet> {
    match store.replay_commits(request, cancel)? {
        ReplayOutcome::Replayed { changes, .. } => Ok(changes),
        ReplayOutcome::Conflicts(conflicts) => Err(BranchError::MergeConflicts {
            message: format!("{} failed with {} conflict(s).", operation(), conflicts.len()),
            conflicts,
        }),
    }
}

/// Same identity and head.
fn is_unchanged(current: &Branch, seen: &Branch) -> bool {
    current == seen && current.head_timestamp() == seen.head_timestamp()
}
