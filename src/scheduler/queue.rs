//! Durable, deduplicating job queue with retry bookkeeping.
//!
//! The queue keeps four pieces of state per instance:
//!
//! - `pending`: identifiers waiting to be dispatched, in insertion order
//! - `in_progress`: identifiers currently claimed by a worker
//! - `completed`: identifier -> completion timestamp
//! - `failed`: identifier -> [`FailureRecord`]
//!
//! A given identifier is in at most one of pending / in-progress / completed.
//! It may sit in the failure registry while pending (a retry waiting to be
//! re-dispatched) but never once completed.
//!
//! # Files
//!
//! Three JSON files are rewritten (temp + rename) after every mutation that
//! changes their content:
//!
//! - `job_queue.json`: array of identifiers not yet finished. Claimed
//!   identifiers are included, so a crash mid-job re-dispatches the job on
//!   the next start.
//! - `completed_urls.json`: object mapping identifier -> ISO-8601 timestamp
//! - `failed_urls.json`: object mapping identifier -> failure record
//!
//! Write errors are logged and swallowed: the in-memory state stays
//! authoritative for the lifetime of the process.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use super::job::{FailureRecord, JobId, DEFAULT_MAX_RETRIES};
use crate::error::StorageError;
use crate::storage::{read_json, write_json_atomic};

/// Errors that can occur while opening a queue.
#[derive(Debug, Error)]
pub enum QueueError {
    /// Failed to prepare the queue's storage location.
    #[error("Queue storage error: {0}")]
    Storage(#[from] StorageError),

    /// The queue configuration is unusable.
    #[error("Invalid queue configuration: {0}")]
    InvalidConfig(String),
}

/// Queue behaviour settings.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueConfig {
    /// Failed attempts after which a job is never dispatched again.
    pub max_retries: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

impl QueueConfig {
    /// Sets the retry budget.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }
}

/// Locations of the queue's state files.
#[derive(Debug, Clone, PartialEq)]
pub struct QueuePaths {
    /// Pending identifiers (JSON array).
    pub pending: PathBuf,
    /// Completed identifiers (JSON object id -> timestamp).
    pub completed: PathBuf,
    /// Failure registry (JSON object id -> failure record).
    pub failures: PathBuf,
}

impl QueuePaths {
    /// Standard file names inside `dir`.
    pub fn in_dir(dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref();
        Self {
            pending: dir.join("job_queue.json"),
            completed: dir.join("completed_urls.json"),
            failures: dir.join("failed_urls.json"),
        }
    }
}

/// Statistics about queue state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    /// Unfinished plus completed identifiers.
    pub total: usize,
    /// Identifiers not yet finished, including those currently claimed.
    pub queued: usize,
    /// Identifiers currently claimed by a worker.
    pub in_progress: usize,
    /// Identifiers completed successfully.
    pub completed: usize,
    /// Identifiers with a failure record (retrying or given up).
    pub failed: usize,
    /// Identifiers whose retry budget is exhausted.
    pub permanent_failures: usize,
}

impl QueueStats {
    /// Returns whether no work is waiting or running.
    pub fn is_drained(&self) -> bool {
        self.queued == 0 && self.in_progress == 0
    }
}

/// What `fail` decided for a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    /// Re-appended to the tail of the pending list.
    Retrying {
        /// Failed attempts so far.
        attempts: u32,
    },
    /// Dropped from pending; kept in the failure registry.
    Permanent {
        /// Failed attempts so far.
        attempts: u32,
    },
    /// The job had already completed; nothing was recorded.
    AlreadyCompleted,
}

/// Point-in-time copy of queue membership, for inspection.
#[derive(Debug, Clone, Default, Serialize)]
pub struct QueueSnapshot {
    /// Pending identifiers in dispatch order.
    pub pending: Vec<JobId>,
    /// Claimed identifiers.
    pub in_progress: Vec<JobId>,
    /// Completed identifiers.
    pub completed: Vec<JobId>,
}

#[derive(Debug, Default)]
struct QueueState {
    pending: VecDeque<JobId>,
    pending_index: HashSet<JobId>,
    in_progress: HashSet<JobId>,
    completed: BTreeMap<JobId, DateTime<Utc>>,
    failed: BTreeMap<JobId, FailureRecord>,
}

impl QueueState {
    fn contains(&self, id: &str) -> bool {
        self.pending_index.contains(id)
            || self.in_progress.contains(id)
            || self.completed.contains_key(id)
    }

    fn push_back(&mut self, id: JobId) {
        if self.pending_index.insert(id.clone()) {
            self.pending.push_back(id);
        }
    }

    fn remove_pending(&mut self, id: &str) -> bool {
        if !self.pending_index.remove(id) {
            return false;
        }
        if let Some(pos) = self.pending.iter().position(|p| p == id) {
            self.pending.remove(pos);
        }
        true
    }

    fn is_exhausted(&self, id: &str, max_retries: u32) -> bool {
        self.failed
            .get(id)
            .is_some_and(|record| record.is_exhausted(max_retries))
    }

    /// Pending file content: claimed identifiers first, then pending order.
    fn durable_pending(&self) -> Vec<&JobId> {
        let mut claimed: Vec<&JobId> = self.in_progress.iter().collect();
        claimed.sort();
        claimed.into_iter().chain(self.pending.iter()).collect()
    }

    fn stats(&self, max_retries: u32) -> QueueStats {
        let queued = self.pending.len() + self.in_progress.len();
        QueueStats {
            total: queued + self.completed.len(),
            queued,
            in_progress: self.in_progress.len(),
            completed: self.completed.len(),
            failed: self.failed.len(),
            permanent_failures: self
                .failed
                .values()
                .filter(|record| record.is_exhausted(max_retries))
                .count(),
        }
    }
}

/// Durable job queue.
///
/// All read-modify-write sequences (and the file writes that follow them)
/// run under one async mutex, so workers never observe an identifier in two
/// states at once.
pub struct DurableQueue {
    paths: QueuePaths,
    config: QueueConfig,
    state: Mutex<QueueState>,
}

impl DurableQueue {
    /// Opens a queue, loading any state files that already exist.
    ///
    /// Missing files start empty. Unreadable or corrupt files are logged and
    /// also start empty rather than failing the open.
    ///
    /// # Errors
    ///
    /// Returns `QueueError::InvalidConfig` if `max_retries` is zero, or
    /// `QueueError::Storage` if the state directory cannot be created.
    pub async fn open(paths: QueuePaths, config: QueueConfig) -> Result<Self, QueueError> {
        if config.max_retries == 0 {
            return Err(QueueError::InvalidConfig(
                "max_retries must be greater than 0".to_string(),
            ));
        }

        for path in [&paths.pending, &paths.completed, &paths.failures] {
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() {
                    tokio::fs::create_dir_all(parent)
                        .await
                        .map_err(|e| StorageError::io(parent, e))?;
                }
            }
        }

        let pending: Vec<JobId> = load_or_default(&paths.pending, "queue").await;
        let completed: BTreeMap<JobId, DateTime<Utc>> =
            load_or_default(&paths.completed, "completed URLs").await;
        let failed: BTreeMap<JobId, FailureRecord> =
            load_or_default(&paths.failures, "failure registry").await;

        let mut state = QueueState {
            completed,
            ..Default::default()
        };
        for id in pending {
            if !state.completed.contains_key(&id) {
                state.push_back(id);
            }
        }
        state.failed = failed
            .into_iter()
            .filter(|(id, _)| !state.completed.contains_key(id))
            .collect();

        info!(
            pending = state.pending.len(),
            completed = state.completed.len(),
            failed = state.failed.len(),
            "Opened durable queue"
        );

        Ok(Self {
            paths,
            config,
            state: Mutex::new(state),
        })
    }

    /// Opens a queue using the standard file names inside `dir`.
    pub async fn open_in_dir(
        dir: impl AsRef<Path>,
        config: QueueConfig,
    ) -> Result<Self, QueueError> {
        Self::open(QueuePaths::in_dir(dir), config).await
    }

    /// Adds identifiers to the tail of the pending list.
    ///
    /// Identifiers already pending, in progress or completed are ignored, as
    /// are repeats within `urls`.
    ///
    /// # Returns
    ///
    /// The number of identifiers actually added.
    pub async fn add<I, S>(&self, urls: I) -> usize
    where
        I: IntoIterator<Item = S>,
        S: Into<JobId>,
    {
        let mut state = self.state.lock().await;

        let mut added = 0;
        for url in urls {
            let url = url.into();
            if state.contains(&url) {
                continue;
            }
            state.push_back(url);
            added += 1;
        }

        if added > 0 {
            self.persist_pending(&state).await;
        }

        info!(added = added, queued = state.pending.len(), "Added URLs to queue");
        added
    }

    /// Claims the first dispatchable pending identifier.
    ///
    /// Identifiers whose retry budget is exhausted are skipped. The returned
    /// identifier is marked in progress until `complete`, `fail` or `release`.
    ///
    /// # Returns
    ///
    /// - `Some(id)` if an identifier was claimed
    /// - `None` if nothing is currently dispatchable
    pub async fn next(&self) -> Option<JobId> {
        let mut state = self.state.lock().await;
        let max_retries = self.config.max_retries;

        let pos = state
            .pending
            .iter()
            .position(|id| !state.is_exhausted(id, max_retries))?;
        let id = state.pending.remove(pos)?;
        state.pending_index.remove(&id);
        state.in_progress.insert(id.clone());

        debug!(job_id = %id, "Claimed job");
        Some(id)
    }

    /// Returns a claimed identifier to the head of the pending list.
    ///
    /// No failure is recorded. Returns `false` if `id` was not in progress.
    pub async fn release(&self, id: &str) -> bool {
        let mut state = self.state.lock().await;
        if !state.in_progress.remove(id) {
            return false;
        }
        state.pending_index.insert(id.to_string());
        state.pending.push_front(id.to_string());
        debug!(job_id = %id, "Released job back to queue");
        true
    }

    /// Marks an identifier as completed.
    ///
    /// Removes it from in-progress and pending, stamps the completion time
    /// and drops any failure record.
    pub async fn complete(&self, id: &str) {
        let mut state = self.state.lock().await;

        state.in_progress.remove(id);
        state.remove_pending(id);
        state.completed.insert(id.to_string(), Utc::now());
        let had_failures = state.failed.remove(id).is_some();

        self.persist_completed(&state).await;
        self.persist_pending(&state).await;
        if had_failures {
            self.persist_failures(&state).await;
        }

        info!(job_id = %id, "Marked URL as completed");
    }

    /// Records a failed attempt.
    ///
    /// When `retry` is true and the retry budget is not yet spent, the
    /// identifier moves to the tail of the pending list. Otherwise it leaves
    /// the pending list for good but stays in the failure registry.
    pub async fn fail(&self, id: &str, error: &str, retry: bool) -> FailOutcome {
        let mut state = self.state.lock().await;
        let max_retries = self.config.max_retries;

        state.in_progress.remove(id);

        if state.completed.contains_key(id) {
            warn!(job_id = %id, "Ignoring failure for completed job");
            return FailOutcome::AlreadyCompleted;
        }

        let attempts = match state.failed.get_mut(id) {
            Some(record) => {
                record.record_retry(error);
                record.retry_count
            }
            None => {
                state.failed.insert(id.to_string(), FailureRecord::first(error));
                1
            }
        };

        state.remove_pending(id);
        let outcome = if retry && attempts < max_retries {
            state.push_back(id.to_string());
            info!(
                job_id = %id,
                attempts = attempts,
                max_retries = max_retries,
                "URL failed, scheduled for retry"
            );
            FailOutcome::Retrying { attempts }
        } else {
            warn!(job_id = %id, attempts = attempts, "URL failed permanently");
            FailOutcome::Permanent { attempts }
        };

        self.persist_pending(&state).await;
        self.persist_failures(&state).await;

        outcome
    }

    /// Returns queue statistics.
    pub async fn stats(&self) -> QueueStats {
        self.state.lock().await.stats(self.config.max_retries)
    }

    /// Number of pending identifiers `next` would still hand out.
    ///
    /// Re-added identifiers whose retry budget is exhausted are excluded.
    pub async fn dispatchable(&self) -> usize {
        let state = self.state.lock().await;
        state
            .pending
            .iter()
            .filter(|id| !state.is_exhausted(id, self.config.max_retries))
            .count()
    }

    /// Returns a copy of the failure registry.
    pub async fn failures(&self) -> BTreeMap<JobId, FailureRecord> {
        self.state.lock().await.failed.clone()
    }

    /// Returns identifiers whose retry budget is exhausted.
    pub async fn permanent_failures(&self) -> Vec<JobId> {
        let state = self.state.lock().await;
        state
            .failed
            .iter()
            .filter(|(_, record)| record.is_exhausted(self.config.max_retries))
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Returns whether `id` has completed.
    pub async fn is_completed(&self, id: &str) -> bool {
        self.state.lock().await.completed.contains_key(id)
    }

    /// Returns a copy of current membership.
    pub async fn snapshot(&self) -> QueueSnapshot {
        let state = self.state.lock().await;
        let mut in_progress: Vec<JobId> = state.in_progress.iter().cloned().collect();
        in_progress.sort();
        QueueSnapshot {
            pending: state.pending.iter().cloned().collect(),
            in_progress,
            completed: state.completed.keys().cloned().collect(),
        }
    }

    /// Returns the configured retry budget.
    pub fn max_retries(&self) -> u32 {
        self.config.max_retries
    }

    /// Returns the state file locations.
    pub fn paths(&self) -> &QueuePaths {
        &self.paths
    }

    async fn persist_pending(&self, state: &QueueState) {
        let pending = state.durable_pending();
        match write_json_atomic(&self.paths.pending, &pending).await {
            Ok(()) => debug!(count = pending.len(), "Saved queue"),
            Err(e) => error!(error = %e, "Error saving queue"),
        }
    }

    async fn persist_completed(&self, state: &QueueState) {
        match write_json_atomic(&self.paths.completed, &state.completed).await {
            Ok(()) => debug!(count = state.completed.len(), "Saved completed URLs"),
            Err(e) => error!(error = %e, "Error saving completed URLs"),
        }
    }

    async fn persist_failures(&self, state: &QueueState) {
        match write_json_atomic(&self.paths.failures, &state.failed).await {
            Ok(()) => debug!(count = state.failed.len(), "Saved failure registry"),
            Err(e) => error!(error = %e, "Error saving failure registry"),
        }
    }
}

async fn load_or_default<T>(path: &Path, what: &str) -> T
where
    T: serde::de::DeserializeOwned + Default,
{
    match read_json(path).await {
        Ok(Some(value)) => value,
        Ok(None) => {
            debug!(path = %path.display(), "No existing {} file", what);
            T::default()
        }
        Err(e) => {
            error!(error = %e, "Error loading {}, starting empty", what);
            T::default()
        }
    }
}
