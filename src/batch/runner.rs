//! Rate-limited batch runner for ad hoc bulk submissions.
//!
//! Independent of the durable queue: a caller hands over a list of items and
//! an async function, and the runner drives them to completion in fixed-size
//! chunks. Within a chunk, items run concurrently under a counting permit and
//! each one first takes a slot from the shared [`RateLimiter`]. A cooldown
//! separates consecutive chunks.
//!
//! Results are kept in memory per batch job and read back by id.

use std::collections::HashMap;
use std::fmt::Display;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::Instant;
use tracing::{debug, error, info};
use uuid::Uuid;

use super::rate_limiter::RateLimiter;
use crate::error::ProcessorError;
use crate::metrics::MetricsCollector;

/// Default page size for [`BatchRunner::get_job_results`].
pub const DEFAULT_RESULTS_LIMIT: usize = 100;

/// Errors raised by the batch runner.
#[derive(Debug, Error)]
pub enum BatchError {
    #[error("Job {0} not found")]
    NotFound(String),

    #[error("Invalid rate limit configuration: {0}")]
    InvalidConfig(String),

    /// The runner was closed while the batch was in flight.
    #[error("Batch runner closed while processing job {0}")]
    Closed(String),
}

/// Rate limiting and chunking settings.
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitConfig {
    pub requests_per_minute: u32,
    /// Items per chunk.
    pub batch_size: usize,
    /// Items in flight at once.
    pub max_concurrent_requests: usize,
    /// Pause between consecutive chunks.
    pub cooldown_period: Duration,
    /// Length of the rate-limit window.
    pub window: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_minute: 100,
            batch_size: 50,
            max_concurrent_requests: 10,
            cooldown_period: Duration::from_secs(1),
            window: Duration::from_secs(60),
        }
    }
}

impl RateLimitConfig {
    pub fn with_requests_per_minute(mut self, requests_per_minute: u32) -> Self {
        self.requests_per_minute = requests_per_minute;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_max_concurrent_requests(mut self, max_concurrent_requests: usize) -> Self {
        self.max_concurrent_requests = max_concurrent_requests;
        self
    }

    pub fn with_cooldown_period(mut self, cooldown_period: Duration) -> Self {
        self.cooldown_period = cooldown_period;
        self
    }

    pub fn with_window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    /// Checks that every limit is non-zero.
    pub fn validate(&self) -> Result<(), BatchError> {
        if self.requests_per_minute == 0 {
            return Err(BatchError::InvalidConfig(
                "requests_per_minute must be greater than 0".to_string(),
            ));
        }
        if self.batch_size == 0 {
            return Err(BatchError::InvalidConfig(
                "batch_size must be greater than 0".to_string(),
            ));
        }
        if self.max_concurrent_requests == 0 {
            return Err(BatchError::InvalidConfig(
                "max_concurrent_requests must be greater than 0".to_string(),
            ));
        }
        if self.window.is_zero() {
            return Err(BatchError::InvalidConfig(
                "window must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Lifecycle of a batch job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Running,
    Completed,
    Failed,
}

impl BatchStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, BatchStatus::Running)
    }
}

/// A failed item and its error message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemError {
    pub item: serde_json::Value,
    pub error: String,
}

/// Summary of a batch job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchJobStatus {
    pub job_id: String,
    pub status: BatchStatus,
    pub total: usize,
    pub completed: usize,
    pub errors: usize,
    pub started_at: DateTime<Utc>,
    /// Seconds since the job started.
    pub duration: f64,
}

/// One page of a batch job's results.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchJobResults {
    pub job_id: String,
    pub status: BatchStatus,
    pub total: usize,
    pub completed: usize,
    pub results: Vec<serde_json::Value>,
    pub failed: Vec<ItemError>,
    pub has_more: bool,
}

/// Paging options for [`BatchRunner::get_job_results`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResultsQuery {
    pub include_failed: bool,
    pub limit: usize,
    pub offset: usize,
}

impl Default for ResultsQuery {
    fn default() -> Self {
        Self {
            include_failed: true,
            limit: DEFAULT_RESULTS_LIMIT,
            offset: 0,
        }
    }
}

#[derive(Debug)]
struct BatchJob {
    total: usize,
    completed: usize,
    results: Vec<serde_json::Value>,
    errors: Vec<ItemError>,
    started_at: DateTime<Utc>,
    started: Instant,
    finished: Option<Instant>,
    status: BatchStatus,
}

impl BatchJob {
    fn new(total: usize) -> Self {
        Self {
            total,
            completed: 0,
            results: Vec::new(),
            errors: Vec::new(),
            started_at: Utc::now(),
            started: Instant::now(),
            finished: None,
            status: BatchStatus::Running,
        }
    }

    fn status(&self, job_id: &str) -> BatchJobStatus {
        let end = self.finished.unwrap_or_else(Instant::now);
        BatchJobStatus {
            job_id: job_id.to_string(),
            status: self.status,
            total: self.total,
            completed: self.completed,
            errors: self.errors.len(),
            started_at: self.started_at,
            duration: end.duration_since(self.started).as_secs_f64(),
        }
    }

    fn finish(&mut self, status: BatchStatus) {
        self.status = status;
        self.finished = Some(Instant::now());
    }
}

fn page<T: Clone>(items: &[T], offset: usize, limit: usize) -> Vec<T> {
    items.iter().skip(offset).take(limit).cloned().collect()
}

enum ItemOutcome {
    Done,
    Closed,
}

/// Runs batches of items under a rate limit and a concurrency cap.
pub struct BatchRunner {
    config: RateLimitConfig,
    limiter: RateLimiter,
    semaphore: Semaphore,
    jobs: Mutex<HashMap<String, BatchJob>>,
    metrics: MetricsCollector,
}

impl BatchRunner {
    /// Creates a runner.
    ///
    /// # Errors
    ///
    /// Returns `BatchError::InvalidConfig` if any limit is zero.
    pub fn new(config: RateLimitConfig) -> Result<Self, BatchError> {
        config.validate()?;
        Ok(Self {
            limiter: RateLimiter::new(config.requests_per_minute, config.window),
            semaphore: Semaphore::new(config.max_concurrent_requests),
            config,
            jobs: Mutex::new(HashMap::new()),
            metrics: MetricsCollector::new(),
        })
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Processes `items` with `process_func` and returns the batch job id.
    ///
    /// Returns once every item has been attempted. Item failures, including
    /// panics, are recorded in the job's error list and never abort the
    /// batch.
    ///
    /// # Errors
    ///
    /// Returns `BatchError::Closed` if [`BatchRunner::close`] was called
    /// mid-batch; the job is then marked failed.
    pub async fn process_batch<T, F, Fut, E>(
        &self,
        items: Vec<T>,
        process_func: F,
    ) -> Result<String, BatchError>
    where
        T: Serialize,
        F: Fn(T) -> Fut,
        Fut: Future<Output = Result<serde_json::Value, E>>,
        E: Display,
    {
        let job_id = format!("batch_{}", Uuid::new_v4().simple());
        let total = items.len();
        self.jobs
            .lock()
            .await
            .insert(job_id.clone(), BatchJob::new(total));

        info!(job_id = %job_id, total_items = total, "Batch job started");

        let chunk_count = total.div_ceil(self.config.batch_size);
        let mut items = items.into_iter();
        for chunk_index in 0..chunk_count {
            let chunk: Vec<T> = items.by_ref().take(self.config.batch_size).collect();
            let outcomes = join_all(
                chunk
                    .into_iter()
                    .map(|item| self.process_item(&job_id, item, &process_func)),
            )
            .await;

            if outcomes.iter().any(|o| matches!(o, ItemOutcome::Closed)) {
                if let Some(job) = self.jobs.lock().await.get_mut(&job_id) {
                    job.finish(BatchStatus::Failed);
                }
                error!(job_id = %job_id, "Batch job failed, runner closed");
                return Err(BatchError::Closed(job_id));
            }

            if chunk_index + 1 < chunk_count && !self.config.cooldown_period.is_zero() {
                tokio::time::sleep(self.config.cooldown_period).await;
            }
        }

        let mut jobs = self.jobs.lock().await;
        if let Some(job) = jobs.get_mut(&job_id) {
            job.finish(BatchStatus::Completed);
            info!(
                job_id = %job_id,
                total_processed = job.completed,
                total_errors = job.errors.len(),
                "Batch job completed"
            );
        }
        Ok(job_id)
    }

    async fn process_item<T, F, Fut, E>(
        &self,
        job_id: &str,
        item: T,
        process_func: &F,
    ) -> ItemOutcome
    where
        T: Serialize,
        F: Fn(T) -> Fut,
        Fut: Future<Output = Result<serde_json::Value, E>>,
        E: Display,
    {
        let item_value = serde_json::to_value(&item).unwrap_or(serde_json::Value::Null);

        let Ok(_permit) = self.semaphore.acquire().await else {
            return ItemOutcome::Closed;
        };

        if !self.limiter.acquire().await.is_zero() {
            self.metrics.record_rate_limit_wait();
        }

        let outcome = AssertUnwindSafe(async { process_func(item).await })
            .catch_unwind()
            .await;
        let result = match outcome {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(e.to_string()),
            Err(payload) => Err(ProcessorError::from_panic(payload).to_string()),
        };

        let mut jobs = self.jobs.lock().await;
        let Some(job) = jobs.get_mut(job_id) else {
            return ItemOutcome::Done;
        };
        match result {
            Ok(value) => {
                job.results.push(value);
                job.completed += 1;
                self.metrics.record_batch_item(true);
                debug!(
                    job_id = %job_id,
                    completed = job.completed,
                    total = job.total,
                    "Item processed"
                );
            }
            Err(message) => {
                self.metrics.record_batch_item(false);
                error!(
                    job_id = %job_id,
                    item = %item_value,
                    error = %message,
                    "Item processing failed"
                );
                job.errors.push(ItemError {
                    item: item_value,
                    error: message,
                });
            }
        }
        ItemOutcome::Done
    }

    /// Returns a summary of a batch job.
    ///
    /// # Errors
    ///
    /// Returns `BatchError::NotFound` for unknown ids.
    pub async fn get_job_status(&self, job_id: &str) -> Result<BatchJobStatus, BatchError> {
        let jobs = self.jobs.lock().await;
        jobs.get(job_id)
            .map(|job| job.status(job_id))
            .ok_or_else(|| BatchError::NotFound(job_id.to_string()))
    }

    /// Returns one page of a batch job's results and, optionally, errors.
    ///
    /// The same `offset`/`limit` window applies to both lists.
    /// `has_more` is true while `offset + limit < total`.
    ///
    /// # Errors
    ///
    /// Returns `BatchError::NotFound` for unknown ids.
    pub async fn get_job_results(
        &self,
        job_id: &str,
        query: ResultsQuery,
    ) -> Result<BatchJobResults, BatchError> {
        let jobs = self.jobs.lock().await;
        let job = jobs
            .get(job_id)
            .ok_or_else(|| BatchError::NotFound(job_id.to_string()))?;

        let failed = if query.include_failed {
            page(&job.errors, query.offset, query.limit)
        } else {
            Vec::new()
        };

        Ok(BatchJobResults {
            job_id: job_id.to_string(),
            status: job.status,
            total: job.total,
            completed: job.completed,
            results: page(&job.results, query.offset, query.limit),
            failed,
            has_more: query.offset.saturating_add(query.limit) < job.total,
        })
    }

    /// Summaries of every known job, oldest first.
    pub async fn list_jobs(&self) -> Vec<BatchJobStatus> {
        let jobs = self.jobs.lock().await;
        let mut statuses: Vec<BatchJobStatus> = jobs
            .iter()
            .map(|(job_id, job)| job.status(job_id))
            .collect();
        statuses.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        statuses
    }

    /// Forgets terminal jobs that finished at least `older_than` ago.
    ///
    /// # Returns
    ///
    /// The number of jobs removed.
    pub async fn cleanup_finished(&self, older_than: Duration) -> usize {
        let mut jobs = self.jobs.lock().await;
        let before = jobs.len();
        jobs.retain(|_, job| match job.finished {
            Some(finished) if job.status.is_terminal() => finished.elapsed() < older_than,
            _ => true,
        });
        let removed = before - jobs.len();
        if removed > 0 {
            info!(removed = removed, "Cleaned up finished batch jobs");
        }
        removed
    }

    /// Stops admitting items; in-flight batches end as failed.
    pub fn close(&self) {
        self.semaphore.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn quick_config() -> RateLimitConfig {
        RateLimitConfig::default()
            .with_requests_per_minute(10_000)
            .with_cooldown_period(Duration::ZERO)
    }

    async fn echo(item: String) -> Result<serde_json::Value, String> {
        Ok(serde_json::json!({ "item": item }))
    }

    #[test]
    fn test_rate_limit_config_defaults() {
        let config = RateLimitConfig::default();
        assert_eq!(config.requests_per_minute, 100);
        assert_eq!(config.batch_size, 50);
        assert_eq!(config.max_concurrent_requests, 10);
        assert_eq!(config.cooldown_period, Duration::from_secs(1));
        assert!(config.validate().is_ok());
        assert!(RateLimitConfig::default().with_batch_size(0).validate().is_err());
    }

    #[tokio::test]
    async fn test_batch_collects_results_and_errors() {
        let runner = BatchRunner::new(quick_config()).expect("runner");
        let items: Vec<String> = (0..6).map(|i| format!("item-{}", i)).collect();

        let job_id = runner
            .process_batch(items, |item: String| async move {
                if item.ends_with('3') {
                    Err(format!("cannot handle {}", item))
                } else {
                    Ok(serde_json::json!(item))
                }
            })
            .await
            .expect("batch");
        assert!(job_id.starts_with("batch_"));

        let status = runner.get_job_status(&job_id).await.expect("status");
        assert_eq!(status.status, BatchStatus::Completed);
        assert_eq!(status.total, 6);
        assert_eq!(status.completed, 5);
        assert_eq!(status.errors, 1);

        let results = runner
            .get_job_results(&job_id, ResultsQuery::default())
            .await
            .expect("results");
        assert_eq!(results.results.len(), 5);
        assert_eq!(results.failed.len(), 1);
        assert_eq!(results.failed[0].item, serde_json::json!("item-3"));
        assert!(results.failed[0].error.contains("cannot handle"));
        assert!(!results.has_more);
    }

    #[tokio::test]
    async fn test_panicking_item_is_recorded() {
        let runner = BatchRunner::new(quick_config()).expect("runner");
        let job_id = runner
            .process_batch(vec![1_u32, 2, 3], |n: u32| async move {
                if n == 2 {
                    panic!("item two exploded");
                }
                Ok::<_, String>(serde_json::json!(n))
            })
            .await
            .expect("batch");

        let results = runner
            .get_job_results(&job_id, ResultsQuery::default())
            .await
            .expect("results");
        assert_eq!(results.completed, 2);
        assert_eq!(results.failed.len(), 1);
        assert!(results.failed[0].error.contains("item two exploded"));
    }

    #[tokio::test]
    async fn test_results_pagination() {
        let runner = BatchRunner::new(quick_config()).expect("runner");
        let items: Vec<String> = (0..5).map(|i| i.to_string()).collect();
        let job_id = runner.process_batch(items, echo).await.expect("batch");

        let page = runner
            .get_job_results(
                &job_id,
                ResultsQuery {
                    include_failed: false,
                    limit: 2,
                    offset: 2,
                },
            )
            .await
            .expect("results");
        assert_eq!(page.results.len(), 2);
        assert!(page.failed.is_empty());
        assert!(page.has_more);

        let last = runner
            .get_job_results(
                &job_id,
                ResultsQuery {
                    limit: 2,
                    offset: 4,
                    ..Default::default()
                },
            )
            .await
            .expect("results");
        assert_eq!(last.results.len(), 1);
        assert!(!last.has_more);
    }

    #[tokio::test]
    async fn test_unknown_job_is_not_found() {
        let runner = BatchRunner::new(quick_config()).expect("runner");
        assert!(matches!(
            runner.get_job_status("batch_missing").await,
            Err(BatchError::NotFound(_))
        ));
        assert!(matches!(
            runner
                .get_job_results("batch_missing", ResultsQuery::default())
                .await,
            Err(BatchError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_concurrency_is_capped() {
        let runner =
            BatchRunner::new(quick_config().with_max_concurrent_requests(3)).expect("runner");
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let job_id = runner
            .process_batch((0..20).collect::<Vec<u32>>(), |n: u32| {
                let running = Arc::clone(&running);
                let peak = Arc::clone(&peak);
                async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    Ok::<_, String>(serde_json::json!(n))
                }
            })
            .await
            .expect("batch");

        assert!(peak.load(Ordering::SeqCst) <= 3);
        let status = runner.get_job_status(&job_id).await.expect("status");
        assert_eq!(status.completed, 20);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cooldown_only_between_chunks() {
        let runner = BatchRunner::new(
            RateLimitConfig::default()
                .with_requests_per_minute(10_000)
                .with_batch_size(1)
                .with_cooldown_period(Duration::from_secs(1)),
        )
        .expect("runner");

        let start = Instant::now();
        runner
            .process_batch(vec!["a".to_string(), "b".to_string(), "c".to_string()], echo)
            .await
            .expect("batch");
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(2));
        assert!(elapsed < Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_suspends_past_window_capacity() {
        let runner = BatchRunner::new(RateLimitConfig::default()).expect("runner");
        let items: Vec<String> = (0..120)
            .map(|i| format!("https://example.com/{}", i))
            .collect();

        let start = Instant::now();
        let job_id = runner.process_batch(items, echo).await.expect("batch");
        let elapsed = start.elapsed();

        // 100 requests fit in the first window; the rest wait for it to reset.
        assert!(elapsed >= Duration::from_secs(60));
        let status = runner.get_job_status(&job_id).await.expect("status");
        assert_eq!(status.completed, 120);
        assert_eq!(status.status, BatchStatus::Completed);
    }

    #[tokio::test]
    async fn test_job_ids_are_unique_and_listed() {
        let runner = BatchRunner::new(quick_config()).expect("runner");
        let first = runner
            .process_batch(vec!["a".to_string()], echo)
            .await
            .expect("batch");
        let second = runner
            .process_batch(vec!["b".to_string()], echo)
            .await
            .expect("batch");
        assert_ne!(first, second);

        let jobs = runner.list_jobs().await;
        assert_eq!(jobs.len(), 2);
        assert!(jobs.iter().all(|j| j.status == BatchStatus::Completed));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_finished_removes_old_jobs() {
        let runner = BatchRunner::new(quick_config()).expect("runner");
        let job_id = runner
            .process_batch(vec!["a".to_string()], echo)
            .await
            .expect("batch");

        assert_eq!(runner.cleanup_finished(Duration::from_secs(60)).await, 0);
        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(runner.cleanup_finished(Duration::from_secs(60)).await, 1);
        assert!(runner.get_job_status(&job_id).await.is_err());
    }

    #[tokio::test]
    async fn test_closed_runner_fails_batch() {
        let runner = BatchRunner::new(quick_config()).expect("runner");
        runner.close();

        let result = runner.process_batch(vec!["a".to_string()], echo).await;
        let Err(BatchError::Closed(job_id)) = result else {
            panic!("expected closed error");
        };
        let status = runner.get_job_status(&job_id).await.expect("status");
        assert_eq!(status.status, BatchStatus::Failed);
    }
}
