//! Repository tying the branching core together on disk.
//!
//! Layout of a repository directory:
//!
//! ```text
//! MANIFEST        magic + format version
//! LOCK            exclusive process lock
//! timestamps.bin  timestamp authority high-water mark
//! branches.bin    branch registry
//! ```
//!
//! Content committed through [`Repository::commit`] is kept in memory only.

use crate::branches::{Branch, BranchManager};
use crate::error::{BranchError, Result};
use crate::events::EventBus;
use crate::locks::{LockContext, LockManager, LockTarget, Locks, SYSTEM_USER};
use crate::merge::{MergeService, MergeServiceConfig};
use crate::storage::{ContentStore, MemoryContentStore};
use crate::timestamp::{DurableTimestampAuthority, TimestampAuthority, DEFAULT_RESERVE_BLOCK};
use crate::types::{CancellationToken, ChangeSet, ComponentKey, Timestamp};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

/// Repository configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RepositoryConfig {
    /// Base path for the repository.
    pub path: PathBuf,

    /// Scopes branch locks; also used by the merge service.
    pub repository_id: String,

    /// Whether to create the repository if it doesn't exist.
    pub create_if_missing: bool,

    /// Timestamps reserved per write of the authority file.
    pub timestamp_block: i64,

    pub merge: MergeServiceConfig,
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./repository"),
            repository_id: "default".to_string(),
            create_if_missing: true,
            timestamp_block: DEFAULT_RESERVE_BLOCK,
            merge: MergeServiceConfig::default(),
        }
    }
}

/// Magic bytes for repository manifest.
const REPOSITORY_MAGIC: &[u8; 4] = b"RBR\0";

/// Current repository format version.
const REPOSITORY_VERSION: u8 = 1;

/// A branching repository.
///
/// Provides:
/// - The branch registry backed by a durable timestamp authority
/// - Content commits and reads through branch ancestry
/// - Background merges and rebases
/// - Branch locks shared by commits and merge jobs
pub struct Repository {
    /// Dropped first: workers stop before the process lock is released.
    merges: MergeService,

    branches: Arc<BranchManager>,

    store: Arc<MemoryContentStore>,

    locks: Arc<LockManager>,

    config: RepositoryConfig,

    /// Lock file for exclusive access.
    _lock_file: File,
}

impl Repository {
    /// Open an existing repository or create a new one.
    pub fn open_or_create(config: RepositoryConfig) -> Result<Self> {
        if config.path.join("MANIFEST").exists() {
            Self::open(config)
        } else if config.create_if_missing {
            Self::create(config)
        } else {
            Err(BranchError::NotInitialized)
        }
    }

    /// Create a new repository.
    pub fn create(config: RepositoryConfig) -> Result<Self> {
        fs::create_dir_all(&config.path)?;

        Self::write_manifest(&config.path)?;
        let lock_file = Self::acquire_lock(&config.path)?;

        let repository = Self::assemble(config, lock_file)?;
        repository.sync()?;

        info!(path = %repository.path().display(), "created repository");
        Ok(repository)
    }

    /// Open an existing repository.
    pub fn open(config: RepositoryConfig) -> Result<Self> {
        Self::verify_manifest(&config.path)?;
        let lock_file = Self::acquire_lock(&config.path)?;

        let repository = Self::assemble(config, lock_file)?;

        info!(
            path = %repository.path().display(),
            branches = repository.branches.branch_count(),
            "opened repository"
        );
        Ok(repository)
    }

    fn assemble(config: RepositoryConfig, lock_file: File) -> Result<Self> {
        let authority: Arc<dyn TimestampAuthority> = Arc::new(
            DurableTimestampAuthority::open_with_block(
                config.path.join("timestamps.bin"),
                config.timestamp_block,
            )?,
        );
        let events = Arc::new(EventBus::new());
        let branches = Arc::new(BranchManager::open(
            config.path.join("branches.bin"),
            authority,
            events,
        )?);
        let store = Arc::new(MemoryContentStore::new());
        let locks = Arc::new(LockManager::new());

        let merge_config = MergeServiceConfig {
            repository_id: config.repository_id.clone(),
            ..config.merge.clone()
        };
        let merges = MergeService::new(
            merge_config,
            Arc::clone(&branches),
            Arc::clone(&store) as Arc<dyn ContentStore>,
            Arc::clone(&locks),
        )?;

        Ok(Self {
            merges,
            branches,
            store,
            locks,
            config,
            _lock_file: lock_file,
        })
    }

    /// Commit `changes` on `path` and advance its head.
    ///
    /// Waits for the branch lock like a merge job does, so a commit never
    /// interleaves with a rebase or merge of the same branch.
    pub fn commit(&self, path: &str, changes: &ChangeSet) -> Result<Timestamp> {
        let _locks = self.lock(format!("Committing to '{path}'"), [path])?;
        self.branches.commit_with(path, self.store.as_ref(), changes)
    }

    /// Rebase `path` onto its parent, replaying its commits.
    pub fn rebase(&self, path: &str) -> Result<Branch> {
        let branch = self.branches.get_branch(path)?;
        let _locks = self.lock(
            format!("Rebasing '{path}'"),
            [path, branch.parent_path()],
        )?;
        self.branches
            .rebase_with(path, self.store.as_ref(), &CancellationToken::new())
    }

    /// Merge `source` into `target`, replaying the source commits.
    pub fn merge(&self, source: &str, target: &str) -> Result<Branch> {
        let _locks = self.lock(
            format!("Merging '{source}' into '{target}'"),
            [source, target],
        )?;
        self.branches
            .merge_with(source, target, self.store.as_ref(), &CancellationToken::new())
    }

    /// Value of `key` as seen from the head of `path`.
    pub fn read(&self, path: &str, key: &ComponentKey) -> Result<Option<serde_json::Value>> {
        let ancestry = self.branches.get_ancestry(path)?;
        Ok(self.store.read(&ancestry, key))
    }

    /// The branch registry.
    ///
    /// Its [`rebase`](BranchManager::rebase) and [`merge`](BranchManager::merge)
    /// only move branch timestamps and do not replay content; on a repository
    /// use [`Repository::rebase`] and [`Repository::merge`] or a merge job.
    pub fn branches(&self) -> &Arc<BranchManager> {
        &self.branches
    }

    pub fn merges(&self) -> &MergeService {
        &self.merges
    }

    pub fn locks(&self) -> &Arc<LockManager> {
        &self.locks
    }

    pub fn events(&self) -> &Arc<EventBus> {
        self.branches.events()
    }

    pub fn store(&self) -> &Arc<MemoryContentStore> {
        &self.store
    }

    pub fn repository_id(&self) -> &str {
        &self.config.repository_id
    }

    /// Get the repository path.
    pub fn path(&self) -> &Path {
        &self.config.path
    }

    /// Persist the branch registry.
    pub fn sync(&self) -> Result<()> {
        self.branches.save()
    }

    // --- Private Helpers ---

    fn lock<'a>(
        &self,
        description: String,
        paths: impl IntoIterator<Item = &'a str>,
    ) -> Result<Locks> {
        let targets: Vec<LockTarget> = paths
            .into_iter()
            .map(|path| LockTarget::new(&self.config.repository_id, path))
            .collect();
        self.locks.acquire(
            LockContext::new(SYSTEM_USER, description),
            targets,
            self.config.merge.lock_timeout,
        )
    }

    fn write_manifest(path: &Path) -> Result<()> {
        use std::io::Write;

        let manifest_path = path.join("MANIFEST");
        let mut file = File::create(manifest_path)?;

        file.write_all(REPOSITORY_MAGIC)?;
        file.write_all(&[REPOSITORY_VERSION])?;
        file.sync_all()?;

        Ok(())
    }

    fn verify_manifest(path: &Path) -> Result<()> {
        use std::io::Read;

        let manifest_path = path.join("MANIFEST");
        if !manifest_path.exists() {
            return Err(BranchError::NotInitialized);
        }
        let mut file = File::open(manifest_path)?;

        let mut magic = [0u8; 4];
        file.read_exact(&mut magic)?;
        if &magic != REPOSITORY_MAGIC {
            return Err(BranchError::InvalidFormat("Invalid repository magic".into()));
        }

        let mut version = [0u8; 1];
        file.read_exact(&mut version)?;
        if version[0] != REPOSITORY_VERSION {
            return Err(BranchError::InvalidFormat(format!(
                "Unsupported repository version: {}",
                version[0]
            )));
        }

        Ok(())
    }

    fn acquire_lock(path: &Path) -> Result<File> {
        let lock_path = path.join("LOCK");
        let lock_file = File::create(lock_path)?;

        lock_file
            .try_lock_exclusive()
            .map_err(|_| BranchError::Locked)?;

        Ok(lock_file)
    }
}

impl Drop for Repository {
    fn drop(&mut self) {
        // Best-effort sync on drop
        let _ = self.sync();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::branches::MAIN_PATH;
    use crate::types::BranchState;
    use serde_json::json;
    use std::time::Duration;
    use tempfile::TempDir;

    fn test_config(dir: &TempDir) -> RepositoryConfig {
        RepositoryConfig {
            path: dir.path().join("repo"),
            repository_id: "snomedct".into(),
            merge: MergeServiceConfig {
                lock_timeout: Duration::from_millis(50),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn key(id: &str) -> ComponentKey {
        ComponentKey::new("concept", id)
    }

    #[test]
    fn test_create_repository() {
        let dir = TempDir::new().unwrap();
        let repo = Repository::create(test_config(&dir)).unwrap();

        assert!(repo.path().join("MANIFEST").exists());
        assert!(repo.path().join("branches.bin").exists());
        assert!(repo.path().join("timestamps.bin").exists());
        assert_eq!(repo.branches().branch_count(), 1);
        assert_eq!(repo.merges().config().repository_id, "snomedct");
    }

    #[test]
    fn test_commit_and_read() {
        let dir = TempDir::new().unwrap();
        let repo = Repository::create(test_config(&dir)).unwrap();

        repo.branches().create_branch(MAIN_PATH, "a").unwrap();
        let t1 = repo
            .commit("MAIN/a", &ChangeSet::new().upsert(key("1"), json!("child")))
            .unwrap();

        assert_eq!(repo.branches().get_branch("MAIN/a").unwrap().head_timestamp(), t1);
        assert_eq!(repo.read("MAIN/a", &key("1")).unwrap(), Some(json!("child")));
        assert_eq!(repo.read(MAIN_PATH, &key("1")).unwrap(), None);
        assert_eq!(
            repo.branches().branch_state("MAIN/a").unwrap(),
            BranchState::Forward
        );
    }

    #[test]
    fn test_commit_waits_for_branch_lock() {
        let dir = TempDir::new().unwrap();
        let repo = Repository::create(test_config(&dir)).unwrap();

        let held = repo
            .locks()
            .acquire(
                LockContext::new("user", "editing"),
                [LockTarget::new("snomedct", MAIN_PATH)],
                Duration::ZERO,
            )
            .unwrap();

        let result = repo.commit(MAIN_PATH, &ChangeSet::new().upsert(key("1"), json!(1)));
        assert!(matches!(result, Err(BranchError::Conflict(_))));

        drop(held);
        repo.commit(MAIN_PATH, &ChangeSet::new().upsert(key("1"), json!(1)))
            .unwrap();
    }

    #[test]
    fn test_rebase_and_merge_replay_content() {
        let dir = TempDir::new().unwrap();
        let repo = Repository::create(test_config(&dir)).unwrap();

        repo.branches().create_branch(MAIN_PATH, "a").unwrap();
        repo.commit("MAIN/a", &ChangeSet::new().upsert(key("1"), json!("child")))
            .unwrap();
        repo.commit(MAIN_PATH, &ChangeSet::new().upsert(key("2"), json!("parent")))
            .unwrap();

        repo.rebase("MAIN/a").unwrap();
        assert_eq!(repo.read("MAIN/a", &key("1")).unwrap(), Some(json!("child")));
        assert_eq!(repo.read("MAIN/a", &key("2")).unwrap(), Some(json!("parent")));

        repo.merge("MAIN/a", MAIN_PATH).unwrap();
        assert_eq!(repo.read(MAIN_PATH, &key("1")).unwrap(), Some(json!("child")));
        assert_eq!(repo.locks().lock_count(), 0);
    }

    #[test]
    fn test_rebase_waits_for_parent_lock() {
        let dir = TempDir::new().unwrap();
        let repo = Repository::create(test_config(&dir)).unwrap();
        repo.branches().create_branch(MAIN_PATH, "a").unwrap();
        repo.commit(MAIN_PATH, &ChangeSet::new().upsert(key("1"), json!(1)))
            .unwrap();

        let _held = repo
            .locks()
            .acquire(
                LockContext::new("user", "editing"),
                [LockTarget::new("snomedct", MAIN_PATH)],
                Duration::ZERO,
            )
            .unwrap();

        assert!(matches!(repo.rebase("MAIN/a"), Err(BranchError::Conflict(_))));
        assert_eq!(
            repo.branches().branch_state("MAIN/a").unwrap(),
            BranchState::Behind
        );
    }

    #[test]
    fn test_commit_to_deleted_branch() {
        let dir = TempDir::new().unwrap();
        let repo = Repository::create(test_config(&dir)).unwrap();

        repo.branches().create_branch(MAIN_PATH, "a").unwrap();
        repo.branches().delete("MAIN/a").unwrap();

        let result = repo.commit("MAIN/a", &ChangeSet::new().upsert(key("1"), json!(1)));
        assert!(matches!(result, Err(BranchError::BadRequest(_))));
        assert_eq!(repo.store().commit_count("MAIN/a"), 0);
    }

    #[test]
    fn test_reopen_keeps_branches_and_time() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);

        let head = {
            let repo = Repository::create(config.clone()).unwrap();
            repo.branches().create_branch(MAIN_PATH, "a").unwrap();
            repo.commit("MAIN/a", &ChangeSet::new().upsert(key("1"), json!(1)))
                .unwrap()
        };

        let repo = Repository::open(config).unwrap();
        let branch = repo.branches().get_branch("MAIN/a").unwrap();
        assert_eq!(branch.head_timestamp(), head);

        let next = repo.commit(MAIN_PATH, &ChangeSet::new().upsert(key("2"), json!(2)))
            .unwrap();
        assert!(next > head);
    }

    #[test]
    fn test_exclusive_lock() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);

        let _repo = Repository::create(config.clone()).unwrap();
        let result = Repository::open(config);
        assert!(matches!(result, Err(BranchError::Locked)));
    }

    #[test]
    fn test_open_missing() {
        let dir = TempDir::new().unwrap();
        let config = RepositoryConfig {
            create_if_missing: false,
            ..test_config(&dir)
        };

        let result = Repository::open_or_create(config);
        assert!(matches!(result, Err(BranchError::NotInitialized)));
    }

    #[test]
    fn test_invalid_manifest() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);
        fs::create_dir_all(&config.path).unwrap();
        fs::write(config.path.join("MANIFEST"), b"XXXX\x01").unwrap();

        let result = Repository::open(config);
        assert!(matches!(result, Err(BranchError::InvalidFormat(_))));
    }
}
