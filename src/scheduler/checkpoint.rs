//! Periodic checkpoint snapshots.
//!
//! A checkpoint is a write-only JSON document combining pool statistics,
//! queue statistics and the live concurrency setting. One file is written per
//! checkpoint (`checkpoint_<unix seconds>.json`) for external inspection; the
//! scheduler never reads them back.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use super::queue::QueueStats;
use super::worker_pool::PoolStats;
use crate::error::StorageError;
use crate::storage::write_json_atomic;

/// Errors that can occur while writing a checkpoint.
#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("Failed to write checkpoint: {0}")]
    Storage(#[from] StorageError),
}

/// Point-in-time snapshot of scheduler state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub timestamp: DateTime<Utc>,
    pub processor_stats: PoolStats,
    pub queue_stats: QueueStats,
    pub current_concurrency: usize,
}

impl Checkpoint {
    pub fn new(processor_stats: PoolStats, queue_stats: QueueStats) -> Self {
        Self {
            timestamp: Utc::now(),
            current_concurrency: processor_stats.current_concurrency,
            processor_stats,
            queue_stats,
        }
    }
}

/// Writes checkpoints into a directory.
#[derive(Debug, Clone)]
pub struct CheckpointWriter {
    dir: PathBuf,
}

impl CheckpointWriter {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Writes `checkpoint` and returns the file path.
    ///
    /// Two checkpoints within the same second overwrite each other.
    pub async fn write(&self, checkpoint: &Checkpoint) -> Result<PathBuf, CheckpointError> {
        let path = self.dir.join(format!(
            "checkpoint_{}.json",
            checkpoint.timestamp.timestamp()
        ));
        write_json_atomic(&path, checkpoint).await?;
        info!(path = %path.display(), "Created checkpoint");
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::read_json;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_write_checkpoint_file() {
        let dir = TempDir::new().expect("temp dir");
        let writer = CheckpointWriter::new(dir.path().join("checkpoints"));

        let pool_stats = PoolStats {
            current_concurrency: 3,
            max_concurrency: 5,
            urls_processed: 7,
            ..Default::default()
        };
        let queue_stats = QueueStats {
            total: 10,
            queued: 3,
            completed: 7,
            ..Default::default()
        };
        let checkpoint = Checkpoint::new(pool_stats, queue_stats);

        let path = writer.write(&checkpoint).await.expect("write checkpoint");
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .expect("file name");
        assert!(name.starts_with("checkpoint_"));
        assert!(name.ends_with(".json"));

        let value: serde_json::Value = read_json(&path).await.expect("read").expect("present");
        assert_eq!(value["current_concurrency"], 3);
        assert_eq!(value["queue_stats"]["completed"], 7);
        assert_eq!(value["processor_stats"]["urls_processed"], 7);
        assert!(value.get("timestamp").is_some());
    }
}
