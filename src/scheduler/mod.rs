//! Durable, adaptive job scheduling.
//!
//! This module provides the queue-driven processing pipeline:
//!
//! - **DurableQueue**: deduplicating, file-backed queue with retry bookkeeping
//! - **AdaptiveWorkerPool**: workers that drain the queue under a resizable
//!   concurrency limit, tuned from job durations and host telemetry
//! - **CheckpointWriter**: periodic JSON snapshots of pool and queue state
//! - **JobProcessor**: the seam through which the actual work is invoked
//!
//! # Architecture
//!
//! ```text
//!                      ┌──────────────┐
//!                      │   Producer   │
//!                      │  (CLI/API)   │
//!                      └──────┬───────┘
//!                             │ add()
//!                      ┌──────▼───────┐
//!                      │ DurableQueue │──► job_queue.json
//!                      │              │──► completed_urls.json
//!                      └──────┬───────┘──► failed_urls.json
//!                             │ next()
//!         ┌───────────────────┼───────────────────┐
//!         │                   │                   │
//!         ▼                   ▼                   ▼
//!    ┌─────────┐         ┌─────────┐         ┌─────────┐
//!    │ Worker 0│         │ Worker 1│   ...   │ Worker N│ (idle above limit)
//!    └────┬────┘         └────┬────┘         └─────────┘
//!         │   ConcurrencyLimiter (resized by the adjustment loop)
//!         ▼
//!    JobProcessor ──► complete() / fail()
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use crawl_forge::monitor::SysinfoTelemetry;
//! use crawl_forge::scheduler::{
//!     processor_fn, AdaptiveWorkerPool, DurableQueue, QueueConfig, WorkerPoolConfig,
//! };
//! use std::sync::Arc;
//!
//! let queue = Arc::new(DurableQueue::open_in_dir("db", QueueConfig::default()).await?);
//! queue.add(["https://example.com/a", "https://example.com/b"]).await;
//!
//! let telemetry = Arc::new(SysinfoTelemetry::new("db"));
//! let pool = AdaptiveWorkerPool::new(WorkerPoolConfig::default(), telemetry, "db/checkpoints")?;
//! let processor = processor_fn(|url: String| async move {
//!     Ok(serde_json::json!({ "url": url }))
//! });
//! pool.start(Arc::clone(&queue), Arc::new(processor)).await?;
//!
//! // Graceful shutdown
//! pool.stop().await?;
//! ```
//!
//! # Reliability Features
//!
//! - **Atomic persistence**: every state file is replaced via temp file + rename
//! - **Crash recovery**: claimed jobs stay in the pending file until they finish
//! - **Give up but remember**: exhausted jobs stay in the failure registry
//! - **Graceful shutdown**: workers finish current jobs before stopping

pub mod checkpoint;
pub mod concurrency;
pub mod job;
pub mod queue;
pub mod worker_pool;

// Re-export main types for convenience
pub use checkpoint::{Checkpoint, CheckpointError, CheckpointWriter};
pub use concurrency::{ConcurrencyLimiter, ConcurrencyPermit};
pub use job::{
    processor_fn, FailureRecord, FnProcessor, JobId, JobOutput, JobProcessor, DEFAULT_MAX_RETRIES,
};
pub use queue::{
    DurableQueue, FailOutcome, QueueConfig, QueueError, QueuePaths, QueueSnapshot, QueueStats,
};
pub use worker_pool::{
    plan_adjustment, AdaptiveWorkerPool, ConcurrencyAdjustment, PauseReason, PoolError,
    PoolStats, WorkerPoolConfig, SCALE_UP_DURATION_LIMIT,
};
