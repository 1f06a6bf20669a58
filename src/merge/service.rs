//! Merge service: schedules merge jobs and keeps their results.

use super::job::{MergeEntry, MergeJob};
use super::types::{Merge, MergeCollection, MergeFilter};
use crate::branches::BranchManager;
use crate::error::{BranchError, Result};
use crate::events::BranchEvent;
use crate::locks::LockManager;
use crate::storage::ContentStore;
use crossbeam_channel::{unbounded, Receiver, Sender};
use lru::LruCache;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

/// Merge service configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct MergeServiceConfig {
    /// Merge records kept before the least recently used one is evicted.
    /// Default: 100
    pub max_results: usize,

    /// Worker threads running jobs.
    /// Default: 2
    pub workers: usize,

    /// How long a job waits for its branch locks.
    /// Default: 60 seconds
    pub lock_timeout: Duration,

    /// Repository id used to scope branch locks.
    pub repository_id: String,
}

impl Default for MergeServiceConfig {
    fn default() -> Self {
        Self {
            max_results: 100,
            workers: 2,
            lock_timeout: Duration::from_secs(60),
            repository_id: "default".to_string(),
        }
    }
}

/// Runs merges and rebases in the background.
///
/// Results are kept in a bounded LRU cache keyed by merge id; a record that
/// has been evicted is reported as not found.
pub struct MergeService {
    config: MergeServiceConfig,
    branches: Arc<BranchManager>,
    store: Arc<dyn ContentStore>,
    locks: Arc<LockManager>,
    merges: Mutex<LruCache<Uuid, Arc<MergeEntry>>>,
    queue: Option<Sender<MergeJob>>,
    workers: Vec<JoinHandle<()>>,
}

impl MergeService {
    pub fn new(
        config: MergeServiceConfig,
        branches: Arc<BranchManager>,
        store: Arc<dyn ContentStore>,
        locks: Arc<LockManager>,
    ) -> Result<Self> {
        let capacity = NonZeroUsize::new(config.max_results).ok_or_else(|| {
            BranchError::BadRequest("Merge result capacity must be at least 1".into())
        })?;

        let (sender, receiver) = unbounded();
        let workers = (0..config.workers.max(1))
            .map(|n| {
                let receiver = receiver.clone();
                thread::Builder::new()
                    .name(format!("merge-worker-{n}"))
                    .spawn(move || run_worker(receiver))
            })
            .collect::<std::io::Result<Vec<_>>>()?;

        debug!(workers = workers.len(), capacity = capacity.get(), "merge service started");

        Ok(Self {
            config,
            branches,
            store,
            locks,
            merges: Mutex::new(LruCache::new(capacity)),
            queue: Some(sender),
            workers,
        })
    }

    pub fn config(&self) -> &MergeServiceConfig {
        &self.config
    }

    /// Schedule merging `source` into `target`.
    ///
    /// If `target` is a direct child of `source` the job rebases `target`
    /// instead. Returns the record in `SCHEDULED` state.
    pub fn enqueue(
        &self,
        source: &str,
        target: &str,
        commit_message: Option<String>,
        review_id: Option<String>,
    ) -> Result<Merge> {
        if source == target {
            return Err(BranchError::BadRequest(format!(
                "Can't merge branch '{target}' onto itself."
            )));
        }
        self.branches.get_branch(source)?;
        self.branches.get_branch(target)?;

        let merge = Merge::scheduled(source, target, commit_message, review_id);
        let entry = Arc::new(MergeEntry::new(merge.clone()));

        if let Some((evicted, _)) = self.merges.lock().push(merge.id, Arc::clone(&entry)) {
            debug!(merge_id = %evicted, "evicted merge record");
        }

        self.branches.events().publish(BranchEvent::MergeStatusChanged {
            id: merge.id,
            source: merge.source.clone(),
            target: merge.target.clone(),
            status: merge.status,
        });

        let job = MergeJob::new(
            entry,
            Arc::clone(&self.branches),
            Arc::clone(&self.store),
            Arc::clone(&self.locks),
            self.config.repository_id.clone(),
            self.config.lock_timeout,
        );
        self.queue
            .as_ref()
            .ok_or(BranchError::NotInitialized)?
            .send(job)
            .map_err(|_| BranchError::InvalidOperation("Merge service is shut down".into()))?;

        info!(merge_id = %merge.id, source, target, "merge scheduled");
        Ok(merge)
    }

    /// Current state of merge `id`.
    pub fn get_merge(&self, id: Uuid) -> Result<Merge> {
        Ok(self.entry(id)?.snapshot())
    }

    /// Merge records matching `filter`, most recently scheduled first.
    pub fn search(&self, filter: &MergeFilter) -> MergeCollection {
        let mut items: Vec<Merge> = self
            .merges
            .lock()
            .iter()
            .map(|(_, entry)| entry.snapshot())
            .filter(|merge| filter.matches(merge))
            .collect();
        items.sort_by(|a, b| b.scheduled_date.cmp(&a.scheduled_date));

        let total = items.len();
        MergeCollection { items, total }
    }

    /// Cancel merge `id` if it is still pending or running, otherwise forget it.
    ///
    /// Returns the record as it was after the request.
    pub fn delete_merge(&self, id: Uuid) -> Result<Merge> {
        let mut merges = self.merges.lock();
        let entry = merges
            .peek(&id)
            .cloned()
            .ok_or_else(|| BranchError::merge_not_found(id))?;

        if entry.request_cancel() {
            info!(merge_id = %id, "merge cancellation requested");
        } else {
            merges.pop(&id);
            debug!(merge_id = %id, "merge record removed");
        }

        Ok(entry.snapshot())
    }

    /// Block until merge `id` is terminal or `timeout` elapses.
    pub fn wait_for(&self, id: Uuid, timeout: Duration) -> Result<Merge> {
        let entry = self.entry(id)?;
        Ok(entry.wait(timeout))
    }

    /// Number of retained merge records.
    pub fn len(&self) -> usize {
        self.merges.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn entry(&self, id: Uuid) -> Result<Arc<MergeEntry>> {
        self.merges
            .lock()
            .get(&id)
            .cloned()
            .ok_or_else(|| BranchError::merge_not_found(id))
    }
}

fn run_worker(jobs: Receiver<MergeJob>) {
    while let Ok(job) = jobs.recv() {
        job.run();
    }
}

impl Drop for MergeService {
    fn drop(&mut self) {
        for (_, entry) in self.merges.lock().iter() {
            entry.request_cancel();
        }
        // Workers exit once the queue is drained and disconnected.
        self.queue.take();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}
