//! Job definitions for the scheduler.
//!
//! This module defines the core job types used in the scheduling system:
//!
//! - `JobId`: The opaque identifier (a URL) that keys all queue state
//! - `FailureRecord`: Retry bookkeeping for a job that has failed at least once
//! - `JobProcessor`: The collaborator boundary that performs the actual work

use std::future::Future;
use std::marker::PhantomData;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ProcessorError;

/// Default maximum number of failed attempts before a job is given up on.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Opaque job identifier. In practice a URL.
pub type JobId = String;

/// Value produced by a successful job.
pub type JobOutput = serde_json::Value;

/// Retry bookkeeping for a job that has failed at least once.
///
/// Created on the first failure, incremented on every further failure and
/// removed when the job eventually succeeds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FailureRecord {
    /// Number of failed attempts so far (always >= 1).
    #[serde(rename = "retries")]
    pub retry_count: u32,
    /// Error message of the most recent failure.
    pub last_error: String,
    /// When the most recent failure was recorded.
    pub last_attempt: DateTime<Utc>,
}

impl FailureRecord {
    /// Creates the record for a first failure.
    pub fn first(error: impl Into<String>) -> Self {
        Self {
            retry_count: 1,
            last_error: error.into(),
            last_attempt: Utc::now(),
        }
    }

    /// Registers another failed attempt.
    pub fn record_retry(&mut self, error: impl Into<String>) {
        self.retry_count += 1;
        self.last_error = error.into();
        self.last_attempt = Utc::now();
    }

    /// Returns whether the retry budget is spent.
    pub fn is_exhausted(&self, max_retries: u32) -> bool {
        self.retry_count >= max_retries
    }

    /// Returns the number of attempts left before the job is abandoned.
    pub fn remaining_attempts(&self, max_retries: u32) -> u32 {
        max_retries.saturating_sub(self.retry_count)
    }
}

/// Performs the work behind a job identifier.
///
/// This is the only seam between the scheduler and the scraping/LLM
/// collaborators. Errors are caught by the worker pool and recorded against
/// the job; they never reach the pool's own control flow.
#[async_trait]
pub trait JobProcessor: Send + Sync {
    /// Processes one job.
    async fn process(&self, job_id: &str) -> Result<JobOutput, ProcessorError>;
}

/// Adapter turning an async closure into a [`JobProcessor`].
///
/// Built with [`processor_fn`].
pub struct FnProcessor<F, Fut> {
    func: F,
    _marker: PhantomData<fn() -> Fut>,
}

/// Wraps an async closure as a [`JobProcessor`].
///
/// ```rust,ignore
/// let processor = processor_fn(|url: String| async move {
///     Ok(serde_json::json!({ "url": url }))
/// });
/// ```
pub fn processor_fn<F, Fut>(func: F) -> FnProcessor<F, Fut>
where
    F: Fn(String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<JobOutput, ProcessorError>> + Send + 'static,
{
    FnProcessor {
        func,
        _marker: PhantomData,
    }
}

#[async_trait]
impl<F, Fut> JobProcessor for FnProcessor<F, Fut>
where
    F: Fn(String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<JobOutput, ProcessorError>> + Send + 'static,
{
    async fn process(&self, job_id: &str) -> Result<JobOutput, ProcessorError> {
        (self.func)(job_id.to_string()).await
    }
}
