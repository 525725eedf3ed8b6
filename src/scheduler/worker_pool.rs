//! Adaptive worker pool driving jobs from the durable queue.
//!
//! The pool spawns `max_concurrency` workers up front, but only workers whose
//! index is below the live concurrency setting take work; the rest idle. A
//! [`ConcurrencyLimiter`] sized to the same setting bounds the number of jobs
//! in flight.
//!
//! # Features
//!
//! - Periodic concurrency adjustment from job durations and host telemetry
//! - Pause reasons (operator vs. resource pressure), resource pressure wins
//! - Periodic checkpoints of pool and queue statistics
//! - Graceful shutdown with broadcast channel
//! - Per-job error and panic isolation

use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::checkpoint::{Checkpoint, CheckpointError, CheckpointWriter};
use super::concurrency::ConcurrencyLimiter;
use super::job::{JobId, JobProcessor};
use super::queue::{DurableQueue, FailOutcome, QueueStats};
use crate::error::ProcessorError;
use crate::metrics::MetricsCollector;
use crate::monitor::telemetry::{ResourceTelemetry, ResourceUsage};

/// Mean job duration at or above which concurrency is never increased.
pub const SCALE_UP_DURATION_LIMIT: Duration = Duration::from_secs(10);

/// Errors that can occur in the worker pool.
#[derive(Debug, Error)]
pub enum PoolError {
    /// The pool configuration is unusable.
    #[error("Invalid pool configuration: {0}")]
    InvalidConfig(String),

    /// Pool is already running.
    #[error("Pool is already running")]
    AlreadyRunning,

    /// Pool is not running.
    #[error("Pool is not running")]
    NotRunning,

    /// Shutdown timed out.
    #[error("Shutdown timed out after {0:?}")]
    ShutdownTimeout(Duration),
}

/// Configuration for the adaptive worker pool.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerPoolConfig {
    /// Concurrency setting at start.
    pub initial_concurrency: usize,
    /// Hard ceiling; also the number of workers spawned.
    pub max_concurrency: usize,
    /// Time between concurrency adjustment cycles.
    pub adjustment_interval: Duration,
    /// CPU percentage above which concurrency is reduced.
    pub cpu_threshold_high: f64,
    /// CPU percentage below which concurrency may grow.
    pub cpu_threshold_low: f64,
    /// Memory percentage above which concurrency is reduced.
    pub memory_threshold_high: f64,
    /// Memory percentage below which concurrency may grow.
    pub memory_threshold_low: f64,
    /// Time between checkpoints.
    pub checkpoint_interval: Duration,
    /// Idle back-off when a worker is inactive, paused or the queue is empty.
    pub poll_interval: Duration,
    /// Timeout for graceful shutdown.
    pub shutdown_timeout: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            initial_concurrency: 2,
            max_concurrency: 10,
            adjustment_interval: Duration::from_secs(60),
            cpu_threshold_high: 80.0,
            cpu_threshold_low: 50.0,
            memory_threshold_high: 80.0,
            memory_threshold_low: 60.0,
            checkpoint_interval: Duration::from_secs(300),
            poll_interval: Duration::from_secs(5),
            shutdown_timeout: Duration::from_secs(60),
        }
    }
}

impl WorkerPoolConfig {
    /// Creates a configuration with the given concurrency bounds.
    pub fn new(initial_concurrency: usize, max_concurrency: usize) -> Self {
        Self {
            initial_concurrency,
            max_concurrency,
            ..Default::default()
        }
    }

    /// Sets the adjustment interval.
    pub fn with_adjustment_interval(mut self, interval: Duration) -> Self {
        self.adjustment_interval = interval;
        self
    }

    /// Sets the CPU thresholds.
    pub fn with_cpu_thresholds(mut self, high: f64, low: f64) -> Self {
        self.cpu_threshold_high = high;
        self.cpu_threshold_low = low;
        self
    }

    /// Sets the memory thresholds.
    pub fn with_memory_thresholds(mut self, high: f64, low: f64) -> Self {
        self.memory_threshold_high = high;
        self.memory_threshold_low = low;
        self
    }

    /// Sets the checkpoint interval.
    pub fn with_checkpoint_interval(mut self, interval: Duration) -> Self {
        self.checkpoint_interval = interval;
        self
    }

    /// Sets the poll interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Sets the shutdown timeout.
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Checks bounds, thresholds and intervals.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::InvalidConfig` describing the first problem found.
    pub fn validate(&self) -> Result<(), PoolError> {
        if self.max_concurrency == 0 {
            return Err(PoolError::InvalidConfig(
                "max_concurrency must be greater than 0".to_string(),
            ));
        }
        if self.initial_concurrency == 0 || self.initial_concurrency > self.max_concurrency {
            return Err(PoolError::InvalidConfig(format!(
                "initial_concurrency must be between 1 and {}, got {}",
                self.max_concurrency, self.initial_concurrency
            )));
        }
        check_threshold_pair("cpu", self.cpu_threshold_high, self.cpu_threshold_low)?;
        check_threshold_pair(
            "memory",
            self.memory_threshold_high,
            self.memory_threshold_low,
        )?;
        for (name, interval) in [
            ("adjustment_interval", self.adjustment_interval),
            ("checkpoint_interval", self.checkpoint_interval),
            ("poll_interval", self.poll_interval),
        ] {
            if interval.is_zero() {
                return Err(PoolError::InvalidConfig(format!(
                    "{} must be greater than 0",
                    name
                )));
            }
        }
        Ok(())
    }
}

fn check_threshold_pair(name: &str, high: f64, low: f64) -> Result<(), PoolError> {
    let in_range = |v: f64| v > 0.0 && v <= 100.0;
    if !in_range(high) || !in_range(low) {
        return Err(PoolError::InvalidConfig(format!(
            "{} thresholds must be within (0, 100]",
            name
        )));
    }
    if low >= high {
        return Err(PoolError::InvalidConfig(format!(
            "{} low threshold ({}) must be below high threshold ({})",
            name, low, high
        )));
    }
    Ok(())
}

/// Computes the next concurrency setting.
///
/// High CPU or memory shrinks by one (floor 1). Low CPU and memory with a
/// mean job duration under [`SCALE_UP_DURATION_LIMIT`] grows by one (ceiling
/// `max_concurrency`), unless the pool is paused. Anything else keeps the
/// current value.
pub fn plan_adjustment(
    config: &WorkerPoolConfig,
    current: usize,
    usage: ResourceUsage,
    mean_duration: Duration,
    paused: bool,
) -> usize {
    let next = if usage.cpu_percent > config.cpu_threshold_high
        || usage.memory_percent > config.memory_threshold_high
    {
        current.saturating_sub(1)
    } else if !paused
        && usage.cpu_percent < config.cpu_threshold_low
        && usage.memory_percent < config.memory_threshold_low
        && mean_duration < SCALE_UP_DURATION_LIMIT
    {
        current + 1
    } else {
        current
    };
    next.clamp(1, config.max_concurrency)
}

/// Record of one concurrency change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConcurrencyAdjustment {
    pub timestamp: DateTime<Utc>,
    pub old_value: usize,
    pub new_value: usize,
    pub cpu_usage: f64,
    pub memory_usage: f64,
    /// Mean job duration (seconds) over the cycle.
    pub avg_processing_time: f64,
}

/// Why the pool is paused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PauseReason {
    /// Paused through the control surface.
    Operator,
    /// Paused by the resource monitor.
    ResourcePressure,
}

impl PauseReason {
    const ALL: [PauseReason; 2] = [PauseReason::Operator, PauseReason::ResourcePressure];

    fn bit(self) -> u8 {
        match self {
            PauseReason::Operator => 0b01,
            PauseReason::ResourcePressure => 0b10,
        }
    }
}

/// Statistics about the worker pool.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PoolStats {
    pub started_at: Option<DateTime<Utc>>,
    pub urls_processed: u64,
    pub urls_succeeded: u64,
    pub urls_failed: u64,
    /// Moving average of successful job durations, in seconds.
    pub avg_processing_time: f64,
    pub concurrency_adjustments: Vec<ConcurrencyAdjustment>,
    pub current_concurrency: usize,
    pub max_concurrency: usize,
    pub active_tasks: usize,
    pub paused: bool,
    pub pause_reasons: Vec<PauseReason>,
    pub running: bool,
    /// Estimated completion time of the queued work.
    pub eta: Option<DateTime<Utc>>,
    pub eta_seconds: Option<f64>,
    /// Live host usage; absent when sampling failed.
    pub system: Option<ResourceUsage>,
}

impl PoolStats {
    /// Returns the success rate as a percentage.
    pub fn success_rate(&self) -> f64 {
        if self.urls_processed == 0 {
            return 0.0;
        }
        (self.urls_succeeded as f64 / self.urls_processed as f64) * 100.0
    }
}

/// Estimated seconds until `queued` jobs finish.
///
/// Only defined once at least one job was processed and at least one is
/// running.
fn estimate_remaining_secs(
    urls_processed: u64,
    avg_processing_time: f64,
    active_tasks: usize,
    queued: usize,
    current_concurrency: usize,
) -> Option<f64> {
    if urls_processed == 0 || avg_processing_time <= 0.0 || active_tasks == 0 || queued == 0 {
        return None;
    }
    let seconds_per_url = avg_processing_time / current_concurrency.max(1) as f64;
    Some(queued as f64 * seconds_per_url)
}

#[derive(Debug, Default)]
struct Performance {
    samples: Vec<Duration>,
    average_secs: Option<f64>,
    adjustments: Vec<ConcurrencyAdjustment>,
}

impl Performance {
    fn record(&mut self, duration: Duration, success: bool) {
        self.samples.push(duration);
        if success {
            let secs = duration.as_secs_f64();
            self.average_secs = Some(match self.average_secs {
                Some(average) => average * 0.9 + secs * 0.1,
                None => secs,
            });
        }
    }

    /// Mean of the samples collected since the last call; clears them.
    fn take_mean(&mut self) -> Option<Duration> {
        if self.samples.is_empty() {
            return None;
        }
        let count = self.samples.len() as u32;
        let total: Duration = self.samples.drain(..).sum();
        Some(total / count)
    }
}

/// State shared between the pool handle, its workers and its background loops.
struct PoolShared {
    config: WorkerPoolConfig,
    limiter: ConcurrencyLimiter,
    telemetry: Arc<dyn ResourceTelemetry>,
    pause_reasons: AtomicU8,
    running: AtomicBool,
    active_tasks: AtomicUsize,
    urls_processed: AtomicU64,
    urls_succeeded: AtomicU64,
    urls_failed: AtomicU64,
    performance: Mutex<Performance>,
    started_at: Mutex<Option<DateTime<Utc>>>,
    queue: Mutex<Option<Arc<DurableQueue>>>,
    metrics: MetricsCollector,
}

impl PoolShared {
    fn is_paused(&self) -> bool {
        self.pause_reasons.load(Ordering::SeqCst) != 0
    }

    fn pause_reasons(&self) -> Vec<PauseReason> {
        let bits = self.pause_reasons.load(Ordering::SeqCst);
        PauseReason::ALL
            .into_iter()
            .filter(|reason| bits & reason.bit() != 0)
            .collect()
    }

    async fn record_outcome(&self, duration: Duration, success: bool) {
        self.urls_processed.fetch_add(1, Ordering::SeqCst);
        if success {
            self.urls_succeeded.fetch_add(1, Ordering::SeqCst);
        } else {
            self.urls_failed.fetch_add(1, Ordering::SeqCst);
        }
        self.performance.lock().await.record(duration, success);
        self.metrics.record_job(success, duration);
    }

    async fn queue_stats(&self) -> QueueStats {
        let queue = self.queue.lock().await.clone();
        match queue {
            Some(queue) => queue.stats().await,
            None => QueueStats::default(),
        }
    }

    async fn stats(&self) -> PoolStats {
        let (avg_processing_time, concurrency_adjustments) = {
            let performance = self.performance.lock().await;
            (
                performance.average_secs.unwrap_or(0.0),
                performance.adjustments.clone(),
            )
        };
        let urls_processed = self.urls_processed.load(Ordering::SeqCst);
        let active_tasks = self.active_tasks.load(Ordering::SeqCst);
        let current_concurrency = self.limiter.limit();

        let queued = self.queue_stats().await.queued;
        let eta_seconds = estimate_remaining_secs(
            urls_processed,
            avg_processing_time,
            active_tasks,
            queued,
            current_concurrency,
        );
        let eta = eta_seconds
            .and_then(|secs| chrono::Duration::try_milliseconds((secs * 1000.0) as i64))
            .map(|remaining| Utc::now() + remaining);

        let system = match self.telemetry.sample().await {
            Ok(usage) => Some(usage),
            Err(e) => {
                debug!(error = %e, "Resource sampling failed while collecting pool stats");
                None
            }
        };

        PoolStats {
            started_at: *self.started_at.lock().await,
            urls_processed,
            urls_succeeded: self.urls_succeeded.load(Ordering::SeqCst),
            urls_failed: self.urls_failed.load(Ordering::SeqCst),
            avg_processing_time,
            concurrency_adjustments,
            current_concurrency,
            max_concurrency: self.config.max_concurrency,
            active_tasks,
            paused: self.is_paused(),
            pause_reasons: self.pause_reasons(),
            running: self.running.load(Ordering::SeqCst),
            eta,
            eta_seconds,
            system,
        }
    }

    async fn run_adjustment_cycle(&self) -> Option<ConcurrencyAdjustment> {
        let mean = self.performance.lock().await.take_mean()?;

        let usage = match self.telemetry.sample().await {
            Ok(usage) => usage,
            Err(e) => {
                warn!(error = %e, "Skipping concurrency adjustment, resource sampling failed");
                return None;
            }
        };
        self.metrics.update_resources(&usage);

        info!(
            avg_time_secs = mean.as_secs_f64(),
            cpu = usage.cpu_percent,
            memory = usage.memory_percent,
            "Performance metrics"
        );

        let old_value = self.limiter.limit();
        let new_value = plan_adjustment(&self.config, old_value, usage, mean, self.is_paused());
        if new_value == old_value {
            return None;
        }

        self.limiter.resize(new_value);
        self.metrics.record_concurrency_change(old_value, new_value);
        if new_value < old_value {
            info!(
                old = old_value,
                new = new_value,
                "Reducing concurrency due to high system load"
            );
        } else {
            info!(old = old_value, new = new_value, "Increasing concurrency");
        }

        let adjustment = ConcurrencyAdjustment {
            timestamp: Utc::now(),
            old_value,
            new_value,
            cpu_usage: usage.cpu_percent,
            memory_usage: usage.memory_percent,
            avg_processing_time: mean.as_secs_f64(),
        };
        self.performance
            .lock()
            .await
            .adjustments
            .push(adjustment.clone());
        Some(adjustment)
    }

    async fn write_checkpoint(
        &self,
        writer: &CheckpointWriter,
    ) -> Result<PathBuf, CheckpointError> {
        let checkpoint = Checkpoint::new(self.stats().await, self.queue_stats().await);
        writer.write(&checkpoint).await
    }
}

/// Pool of workers that processes the durable queue with adaptive concurrency.
pub struct AdaptiveWorkerPool {
    shared: Arc<PoolShared>,
    checkpoints: CheckpointWriter,
    shutdown_tx: broadcast::Sender<()>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl AdaptiveWorkerPool {
    /// Creates a new, stopped pool.
    ///
    /// # Arguments
    ///
    /// * `config` - Pool configuration
    /// * `telemetry` - Host resource source sampled at every adjustment
    /// * `checkpoint_dir` - Directory receiving checkpoint files
    ///
    /// # Errors
    ///
    /// Returns `PoolError::InvalidConfig` if the configuration fails validation.
    pub fn new(
        config: WorkerPoolConfig,
        telemetry: Arc<dyn ResourceTelemetry>,
        checkpoint_dir: impl Into<PathBuf>,
    ) -> Result<Self, PoolError> {
        config.validate()?;

        // Buffer size of 1 is sufficient since we only send once per run
        let (shutdown_tx, _) = broadcast::channel(1);

        let shared = PoolShared {
            limiter: ConcurrencyLimiter::new(config.initial_concurrency),
            config,
            telemetry,
            pause_reasons: AtomicU8::new(0),
            running: AtomicBool::new(false),
            active_tasks: AtomicUsize::new(0),
            urls_processed: AtomicU64::new(0),
            urls_succeeded: AtomicU64::new(0),
            urls_failed: AtomicU64::new(0),
            performance: Mutex::new(Performance::default()),
            started_at: Mutex::new(None),
            queue: Mutex::new(None),
            metrics: MetricsCollector::new(),
        };

        Ok(Self {
            shared: Arc::new(shared),
            checkpoints: CheckpointWriter::new(checkpoint_dir),
            shutdown_tx,
            handles: Mutex::new(Vec::new()),
        })
    }

    /// Starts the workers and the adjustment and checkpoint loops.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::AlreadyRunning` if the pool is already running.
    pub async fn start(
        &self,
        queue: Arc<DurableQueue>,
        processor: Arc<dyn JobProcessor>,
    ) -> Result<(), PoolError> {
        if self.shared.running.swap(true, Ordering::SeqCst) {
            return Err(PoolError::AlreadyRunning);
        }

        *self.shared.started_at.lock().await = Some(Utc::now());
        *self.shared.queue.lock().await = Some(Arc::clone(&queue));

        let mut handles = self.handles.lock().await;
        for index in 0..self.shared.config.max_concurrency {
            let worker = Worker {
                index,
                shared: Arc::clone(&self.shared),
                queue: Arc::clone(&queue),
                processor: Arc::clone(&processor),
                shutdown_rx: self.shutdown_tx.subscribe(),
            };
            handles.push(tokio::spawn(worker.run()));
        }

        handles.push(tokio::spawn(adjustment_loop(
            Arc::clone(&self.shared),
            self.shutdown_tx.subscribe(),
        )));
        handles.push(tokio::spawn(checkpoint_loop(
            Arc::clone(&self.shared),
            self.checkpoints.clone(),
            self.shutdown_tx.subscribe(),
        )));

        let concurrency = self.shared.limiter.limit();
        self.shared
            .metrics
            .record_concurrency_change(concurrency, concurrency);
        self.shared.metrics.update_paused(self.shared.is_paused());
        self.shared.metrics.update_queue(&queue.stats().await);

        info!(
            current_concurrency = concurrency,
            max_concurrency = self.shared.config.max_concurrency,
            "Adaptive worker pool started"
        );
        Ok(())
    }

    /// Signals shutdown and waits for all tasks to exit.
    ///
    /// Jobs already executing run to completion.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::NotRunning` if the pool was not running, or
    /// `PoolError::ShutdownTimeout` if tasks don't stop within the configured
    /// timeout.
    pub async fn stop(&self) -> Result<(), PoolError> {
        if !self.shared.running.swap(false, Ordering::SeqCst) {
            return Err(PoolError::NotRunning);
        }

        info!("Stopping worker pool");

        // Ignore send error - all receivers may already be gone
        let _ = self.shutdown_tx.send(());

        let handles: Vec<JoinHandle<()>> = self.handles.lock().await.drain(..).collect();
        let join_all = async {
            for handle in handles {
                if let Err(e) = handle.await {
                    error!(error = %e, "Pool task panicked during shutdown");
                }
            }
        };

        let timeout = self.shared.config.shutdown_timeout;
        match time::timeout(timeout, join_all).await {
            Ok(()) => {
                info!("Worker pool stopped");
                Ok(())
            }
            Err(_) => Err(PoolError::ShutdownTimeout(timeout)),
        }
    }

    /// Pauses on behalf of the operator.
    pub fn pause(&self) -> bool {
        self.pause_for(PauseReason::Operator)
    }

    /// Clears the operator pause. A resource pause stays in force.
    pub fn resume(&self) -> bool {
        self.resume_for(PauseReason::Operator)
    }

    /// Adds a pause reason. Returns `false` if it was already set.
    pub fn pause_for(&self, reason: PauseReason) -> bool {
        let previous = self
            .shared
            .pause_reasons
            .fetch_or(reason.bit(), Ordering::SeqCst);
        if previous & reason.bit() != 0 {
            return false;
        }

        match reason {
            PauseReason::Operator => info!("Processing paused"),
            PauseReason::ResourcePressure => warn!("Processing paused due to resource pressure"),
        }
        self.shared.metrics.update_paused(true);
        true
    }

    /// Clears a pause reason. Returns `false` if it was not set.
    ///
    /// Processing resumes only once no reason remains.
    pub fn resume_for(&self, reason: PauseReason) -> bool {
        let previous = self
            .shared
            .pause_reasons
            .fetch_and(!reason.bit(), Ordering::SeqCst);
        if previous & reason.bit() == 0 {
            return false;
        }

        if previous & !reason.bit() == 0 {
            info!(reason = ?reason, "Processing resumed");
            self.shared.metrics.update_paused(false);
        } else {
            info!(
                reason = ?reason,
                remaining = ?self.shared.pause_reasons(),
                "Pause reason cleared, processing still paused"
            );
        }
        true
    }

    pub fn is_paused(&self) -> bool {
        self.shared.is_paused()
    }

    pub fn is_paused_for(&self, reason: PauseReason) -> bool {
        self.shared.pause_reasons.load(Ordering::SeqCst) & reason.bit() != 0
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// Returns the live concurrency setting.
    pub fn current_concurrency(&self) -> usize {
        self.shared.limiter.limit()
    }

    pub fn max_concurrency(&self) -> usize {
        self.shared.config.max_concurrency
    }

    /// Returns the number of jobs currently executing.
    pub fn active_tasks(&self) -> usize {
        self.shared.active_tasks.load(Ordering::SeqCst)
    }

    pub fn config(&self) -> &WorkerPoolConfig {
        &self.shared.config
    }

    pub fn checkpoint_dir(&self) -> &Path {
        self.checkpoints.dir()
    }

    /// Returns current pool statistics, including ETA and live host usage.
    pub async fn stats(&self) -> PoolStats {
        self.shared.stats().await
    }

    /// Runs one adjustment cycle now.
    ///
    /// Does nothing when no job finished since the previous cycle.
    ///
    /// # Returns
    ///
    /// The adjustment made, or `None` if concurrency was left unchanged.
    pub async fn run_adjustment_cycle(&self) -> Option<ConcurrencyAdjustment> {
        self.shared.run_adjustment_cycle().await
    }

    /// Writes a checkpoint now.
    pub async fn write_checkpoint(&self) -> Result<PathBuf, CheckpointError> {
        self.shared.write_checkpoint(&self.checkpoints).await
    }

    /// Returns a receiver that fires when the pool stops.
    pub fn shutdown_signal(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }
}

/// A single worker bound to one concurrency slot index.
struct Worker {
    index: usize,
    shared: Arc<PoolShared>,
    queue: Arc<DurableQueue>,
    processor: Arc<dyn JobProcessor>,
    shutdown_rx: broadcast::Receiver<()>,
}

impl Worker {
    async fn run(mut self) {
        debug!(worker_id = self.index, "Worker started");

        loop {
            if self.shutdown_requested() {
                break;
            }

            if self.index >= self.shared.limiter.limit() || self.shared.is_paused() {
                if self.idle().await {
                    break;
                }
                continue;
            }

            let permit = tokio::select! {
                permit = self.shared.limiter.acquire() => permit,
                _ = self.shutdown_rx.recv() => break,
            };
            let Ok(permit) = permit else {
                break;
            };

            // The limit may have shrunk while this worker waited.
            if self.index >= self.shared.limiter.limit() || self.shared.is_paused() {
                drop(permit);
                continue;
            }

            let Some(job_id) = self.queue.next().await else {
                drop(permit);
                if self.idle().await {
                    break;
                }
                continue;
            };

            // Pause may have landed while claiming.
            if self.shared.is_paused() {
                self.queue.release(&job_id).await;
                drop(permit);
                continue;
            }

            self.process_job(job_id).await;
            drop(permit);
        }

        debug!(worker_id = self.index, "Worker stopped");
    }

    fn shutdown_requested(&mut self) -> bool {
        !matches!(
            self.shutdown_rx.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        )
    }

    /// Sleeps one poll interval. Returns `true` if shutdown arrived meanwhile.
    async fn idle(&mut self) -> bool {
        tokio::select! {
            _ = self.shutdown_rx.recv() => true,
            _ = time::sleep(self.shared.config.poll_interval) => false,
        }
    }

    async fn process_job(&self, job_id: JobId) {
        let start_time = Instant::now();
        self.shared.active_tasks.fetch_add(1, Ordering::SeqCst);
        self.shared.metrics.inc_jobs_in_progress();

        info!(worker_id = self.index, job_id = %job_id, "Processing URL");

        let result = match AssertUnwindSafe(self.processor.process(&job_id))
            .catch_unwind()
            .await
        {
            Ok(result) => result,
            Err(payload) => Err(ProcessorError::from_panic(payload)),
        };
        let duration = start_time.elapsed();

        match result {
            Ok(_) => {
                self.queue.complete(&job_id).await;
                self.shared.record_outcome(duration, true).await;
                info!(
                    worker_id = self.index,
                    job_id = %job_id,
                    duration_ms = duration.as_millis() as u64,
                    "Processed URL"
                );
            }
            Err(e) => {
                let message = format!("Error processing {}: {}", job_id, e);
                let outcome = self.queue.fail(&job_id, &message, true).await;
                self.shared.record_outcome(duration, false).await;
                match outcome {
                    FailOutcome::Retrying { attempts } => warn!(
                        worker_id = self.index,
                        job_id = %job_id,
                        attempts = attempts,
                        error = %e,
                        "Job failed, requeued for retry"
                    ),
                    FailOutcome::Permanent { attempts } => error!(
                        worker_id = self.index,
                        job_id = %job_id,
                        attempts = attempts,
                        error = %e,
                        "Job failed permanently"
                    ),
                    FailOutcome::AlreadyCompleted => debug!(
                        worker_id = self.index,
                        job_id = %job_id,
                        "Failure ignored for completed job"
                    ),
                }
            }
        }

        self.shared.active_tasks.fetch_sub(1, Ordering::SeqCst);
        self.shared.metrics.dec_jobs_in_progress();
        self.shared.metrics.update_queue(&self.queue.stats().await);
    }
}

async fn adjustment_loop(shared: Arc<PoolShared>, mut shutdown_rx: broadcast::Receiver<()>) {
    let period = shared.config.adjustment_interval;
    let mut ticker = time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            _ = ticker.tick() => {
                shared.run_adjustment_cycle().await;
            }
        }
    }
    debug!("Adjustment loop stopped");
}

async fn checkpoint_loop(
    shared: Arc<PoolShared>,
    writer: CheckpointWriter,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let period = shared.config.checkpoint_interval;
    let mut ticker = time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            _ = ticker.tick() => {
                if let Err(e) = shared.write_checkpoint(&writer).await {
                    error!(error = %e, "Error creating checkpoint");
                }
            }
        }
    }
    debug!("Checkpoint loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProcessorError;
    use crate::monitor::telemetry::FixedTelemetry;
    use crate::scheduler::job::processor_fn;
    use crate::scheduler::queue::QueueConfig;
    use std::sync::atomic::AtomicUsize;
    use tempfile::TempDir;

    fn calm() -> ResourceUsage {
        ResourceUsage::new(30.0, 40.0, 50.0)
    }

    fn fast_config(initial: usize, max: usize) -> WorkerPoolConfig {
        WorkerPoolConfig::new(initial, max)
            .with_poll_interval(Duration::from_millis(10))
            .with_adjustment_interval(Duration::from_secs(3600))
            .with_checkpoint_interval(Duration::from_secs(3600))
            .with_shutdown_timeout(Duration::from_secs(5))
    }

    fn new_pool(
        dir: &TempDir,
        config: WorkerPoolConfig,
        telemetry: Arc<FixedTelemetry>,
    ) -> AdaptiveWorkerPool {
        AdaptiveWorkerPool::new(config, telemetry, dir.path().join("checkpoints"))
            .expect("valid pool config")
    }

    async fn open_queue(dir: &TempDir, max_retries: u32) -> Arc<DurableQueue> {
        let queue = DurableQueue::open_in_dir(
            dir.path(),
            QueueConfig::default().with_max_retries(max_retries),
        )
        .await
        .expect("queue should open");
        Arc::new(queue)
    }

    async fn wait_until_drained(queue: &DurableQueue) {
        for _ in 0..500 {
            if queue.stats().await.is_drained() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("queue did not drain: {:?}", queue.stats().await);
    }

    #[test]
    fn test_worker_pool_config_default() {
        let config = WorkerPoolConfig::default();

        assert_eq!(config.initial_concurrency, 2);
        assert_eq!(config.max_concurrency, 10);
        assert_eq!(config.adjustment_interval, Duration::from_secs(60));
        assert_eq!(config.cpu_threshold_high, 80.0);
        assert_eq!(config.cpu_threshold_low, 50.0);
        assert_eq!(config.memory_threshold_high, 80.0);
        assert_eq!(config.memory_threshold_low, 60.0);
        assert_eq!(config.checkpoint_interval, Duration::from_secs(300));
        assert_eq!(config.shutdown_timeout, Duration::from_secs(60));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_worker_pool_config_validation() {
        assert!(WorkerPoolConfig::new(0, 5).validate().is_err());
        assert!(WorkerPoolConfig::new(6, 5).validate().is_err());
        assert!(WorkerPoolConfig::new(1, 0).validate().is_err());
        assert!(WorkerPoolConfig::new(1, 5)
            .with_cpu_thresholds(50.0, 80.0)
            .validate()
            .is_err());
        assert!(WorkerPoolConfig::new(1, 5)
            .with_memory_thresholds(120.0, 60.0)
            .validate()
            .is_err());
        assert!(WorkerPoolConfig::new(1, 5)
            .with_poll_interval(Duration::ZERO)
            .validate()
            .is_err());
    }

    #[test]
    fn test_plan_adjustment_grows_to_max_and_stays() {
        let config = WorkerPoolConfig::new(2, 5);
        let mut current = 2;
        let mut seen = vec![current];
        for _ in 0..5 {
            current = plan_adjustment(&config, current, calm(), Duration::from_secs(2), false);
            seen.push(current);
        }
        assert_eq!(seen, vec![2, 3, 4, 5, 5, 5]);
    }

    #[test]
    fn test_plan_adjustment_high_load_shrinks_with_floor() {
        let config = WorkerPoolConfig::new(2, 5);
        let hot_cpu = ResourceUsage::new(85.0, 40.0, 50.0);
        let hot_memory = ResourceUsage::new(30.0, 85.0, 50.0);

        assert_eq!(plan_adjustment(&config, 3, hot_cpu, Duration::from_secs(1), false), 2);
        assert_eq!(plan_adjustment(&config, 2, hot_memory, Duration::from_secs(1), false), 1);
        assert_eq!(plan_adjustment(&config, 1, hot_cpu, Duration::from_secs(1), false), 1);
    }

    #[test]
    fn test_plan_adjustment_holds_in_middle_band_and_for_slow_jobs() {
        let config = WorkerPoolConfig::new(2, 5);
        let middle = ResourceUsage::new(65.0, 40.0, 50.0);

        assert_eq!(plan_adjustment(&config, 3, middle, Duration::from_secs(1), false), 3);
        assert_eq!(plan_adjustment(&config, 3, calm(), Duration::from_secs(10), false), 3);
    }

    #[test]
    fn test_plan_adjustment_paused_never_grows() {
        let config = WorkerPoolConfig::new(2, 5);
        assert_eq!(plan_adjustment(&config, 3, calm(), Duration::from_secs(1), true), 3);

        let hot = ResourceUsage::new(95.0, 40.0, 50.0);
        assert_eq!(plan_adjustment(&config, 3, hot, Duration::from_secs(1), true), 2);
    }

    #[test]
    fn test_moving_average_seeds_then_smooths() {
        let mut performance = Performance::default();
        performance.record(Duration::from_secs(2), true);
        assert_eq!(performance.average_secs, Some(2.0));

        performance.record(Duration::from_secs(4), true);
        let average = performance.average_secs.expect("seeded");
        assert!((average - 2.2).abs() < 1e-9);

        // Failures add samples but leave the average alone.
        performance.record(Duration::from_secs(30), false);
        assert!((performance.average_secs.expect("seeded") - 2.2).abs() < 1e-9);
        assert_eq!(performance.samples.len(), 3);

        assert_eq!(performance.take_mean(), Some(Duration::from_secs(12)));
        assert_eq!(performance.take_mean(), None);
    }

    #[test]
    fn test_estimate_remaining_secs() {
        assert_eq!(estimate_remaining_secs(0, 2.0, 1, 10, 2), None);
        assert_eq!(estimate_remaining_secs(5, 2.0, 0, 10, 2), None);
        assert_eq!(estimate_remaining_secs(5, 2.0, 1, 0, 2), None);
        assert_eq!(estimate_remaining_secs(5, 2.0, 1, 10, 2), Some(10.0));
    }

    #[tokio::test]
    async fn test_adjustment_cycle_without_samples_is_noop() {
        let dir = TempDir::new().expect("temp dir");
        let telemetry = Arc::new(FixedTelemetry::new(calm()));
        let pool = new_pool(&dir, fast_config(2, 5), telemetry);

        assert!(pool.run_adjustment_cycle().await.is_none());
        assert_eq!(pool.current_concurrency(), 2);
    }

    #[tokio::test]
    async fn test_adjustment_cycle_grows_one_step_per_cycle() {
        let dir = TempDir::new().expect("temp dir");
        let telemetry = Arc::new(FixedTelemetry::new(calm()));
        let pool = new_pool(&dir, fast_config(2, 5), telemetry);

        for expected in [3, 4, 5, 5] {
            pool.shared
                .record_outcome(Duration::from_secs(2), true)
                .await;
            pool.run_adjustment_cycle().await;
            assert_eq!(pool.current_concurrency(), expected);
        }

        let stats = pool.stats().await;
        assert_eq!(stats.concurrency_adjustments.len(), 3);
        let first = &stats.concurrency_adjustments[0];
        assert_eq!((first.old_value, first.new_value), (2, 3));
        assert_eq!(first.cpu_usage, 30.0);
        assert!((first.avg_processing_time - 2.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_adjustment_cycle_skips_on_telemetry_failure() {
        let dir = TempDir::new().expect("temp dir");
        let telemetry = Arc::new(FixedTelemetry::new(calm()));
        let pool = new_pool(&dir, fast_config(2, 5), Arc::clone(&telemetry));

        telemetry.set_failing(true);
        pool.shared
            .record_outcome(Duration::from_secs(1), true)
            .await;
        assert!(pool.run_adjustment_cycle().await.is_none());
        assert_eq!(pool.current_concurrency(), 2);

        let stats = pool.stats().await;
        assert!(stats.system.is_none());
    }

    #[tokio::test]
    async fn test_resource_pause_wins_over_operator_resume() {
        let dir = TempDir::new().expect("temp dir");
        let telemetry = Arc::new(FixedTelemetry::new(calm()));
        let pool = new_pool(&dir, fast_config(2, 5), telemetry);

        assert!(pool.pause_for(PauseReason::ResourcePressure));
        assert!(!pool.pause_for(PauseReason::ResourcePressure));
        assert!(pool.pause());

        assert!(pool.resume());
        assert!(pool.is_paused());
        assert!(pool.is_paused_for(PauseReason::ResourcePressure));
        assert!(!pool.resume());

        assert!(pool.resume_for(PauseReason::ResourcePressure));
        assert!(!pool.is_paused());
        assert!(pool.stats().await.pause_reasons.is_empty());
    }

    #[tokio::test]
    async fn test_pool_processes_queue_to_completion() {
        let dir = TempDir::new().expect("temp dir");
        let queue = open_queue(&dir, 3).await;
        queue
            .add((0..8).map(|i| format!("https://example.com/{}", i)))
            .await;

        let telemetry = Arc::new(FixedTelemetry::new(calm()));
        let pool = new_pool(&dir, fast_config(2, 4), telemetry);
        let processor = processor_fn(|url: String| async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            Ok::<_, ProcessorError>(serde_json::json!({ "url": url }))
        });

        pool.start(Arc::clone(&queue), Arc::new(processor))
            .await
            .expect("start");
        wait_until_drained(&queue).await;
        pool.stop().await.expect("stop");

        let stats = pool.stats().await;
        assert_eq!(stats.urls_processed, 8);
        assert_eq!(stats.urls_succeeded, 8);
        assert_eq!(stats.urls_failed, 0);
        assert!(stats.avg_processing_time > 0.0);
        assert!(!stats.running);
        assert!(stats.started_at.is_some());
        assert_eq!(queue.stats().await.completed, 8);
    }

    #[tokio::test]
    async fn test_concurrency_never_exceeds_setting() {
        let dir = TempDir::new().expect("temp dir");
        let queue = open_queue(&dir, 3).await;
        queue
            .add((0..12).map(|i| format!("https://example.com/{}", i)))
            .await;

        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (running_c, peak_c) = (Arc::clone(&running), Arc::clone(&peak));
        let processor = processor_fn(move |_url: String| {
            let running = Arc::clone(&running_c);
            let peak = Arc::clone(&peak_c);
            async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                running.fetch_sub(1, Ordering::SeqCst);
                Ok::<_, ProcessorError>(serde_json::Value::Null)
            }
        });

        let telemetry = Arc::new(FixedTelemetry::new(calm()));
        let pool = new_pool(&dir, fast_config(2, 6), telemetry);
        pool.start(Arc::clone(&queue), Arc::new(processor))
            .await
            .expect("start");
        wait_until_drained(&queue).await;
        pool.stop().await.expect("stop");

        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(queue.stats().await.completed, 12);
    }

    #[tokio::test]
    async fn test_worker_above_shrunk_limit_claims_nothing() {
        let dir = TempDir::new().expect("temp dir");
        let queue = open_queue(&dir, 3).await;
        queue.add(["https://example.com/a"]).await;

        let invocations = Arc::new(AtomicUsize::new(0));
        let invocations_c = Arc::clone(&invocations);
        let processor = processor_fn(move |_url: String| {
            let invocations = Arc::clone(&invocations_c);
            async move {
                invocations.fetch_add(1, Ordering::SeqCst);
                Ok::<_, ProcessorError>(serde_json::Value::Null)
            }
        });

        let pool = new_pool(&dir, fast_config(2, 4), Arc::new(FixedTelemetry::new(calm())));
        let limiter = &pool.shared.limiter;
        let held_a = limiter.acquire().await.expect("permit");
        let held_b = limiter.acquire().await.expect("permit");

        let worker = Worker {
            index: 1,
            shared: Arc::clone(&pool.shared),
            queue: Arc::clone(&queue),
            processor: Arc::new(processor),
            shutdown_rx: pool.shutdown_tx.subscribe(),
        };
        let handle = tokio::spawn(worker.run());

        // Let the worker park on the permit, then shrink under it.
        tokio::time::sleep(Duration::from_millis(50)).await;
        limiter.resize(1);
        drop(held_a);
        drop(held_b);
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(invocations.load(Ordering::SeqCst), 0);
        assert_eq!(queue.stats().await.completed, 0);
        assert_eq!(queue.dispatchable().await, 1);

        pool.shutdown_tx.send(()).expect("worker subscribed");
        handle.await.expect("worker task");
    }

    #[tokio::test]
    async fn test_failing_job_becomes_permanent_failure() {
        let dir = TempDir::new().expect("temp dir");
        let queue = open_queue(&dir, 2).await;
        queue.add(["https://example.com/bad", "https://example.com/good"]).await;

        let processor = processor_fn(|url: String| async move {
            if url.ends_with("/bad") {
                Err(ProcessorError::failed("503 from upstream"))
            } else {
                Ok(serde_json::json!({ "ok": true }))
            }
        });

        let telemetry = Arc::new(FixedTelemetry::new(calm()));
        let pool = new_pool(&dir, fast_config(1, 2), telemetry);
        pool.start(Arc::clone(&queue), Arc::new(processor))
            .await
            .expect("start");
        wait_until_drained(&queue).await;
        pool.stop().await.expect("stop");

        let stats = pool.stats().await;
        assert_eq!(stats.urls_succeeded, 1);
        assert_eq!(stats.urls_failed, 2);

        let queue_stats = queue.stats().await;
        assert_eq!(queue_stats.completed, 1);
        assert_eq!(queue_stats.permanent_failures, 1);

        let failures = queue.failures().await;
        let record = &failures["https://example.com/bad"];
        assert_eq!(record.retry_count, 2);
        assert!(record.last_error.contains("503 from upstream"));
    }

    #[tokio::test]
    async fn test_panicking_processor_does_not_kill_pool() {
        let dir = TempDir::new().expect("temp dir");
        let queue = open_queue(&dir, 1).await;
        queue.add(["https://example.com/panic", "https://example.com/fine"]).await;

        let processor = processor_fn(|url: String| async move {
            if url.ends_with("/panic") {
                panic!("parser exploded");
            }
            Ok::<_, ProcessorError>(serde_json::Value::Null)
        });

        let telemetry = Arc::new(FixedTelemetry::new(calm()));
        let pool = new_pool(&dir, fast_config(1, 1), telemetry);
        pool.start(Arc::clone(&queue), Arc::new(processor))
            .await
            .expect("start");
        wait_until_drained(&queue).await;
        pool.stop().await.expect("stop");

        assert!(queue.is_completed("https://example.com/fine").await);
        let failures = queue.failures().await;
        assert!(failures["https://example.com/panic"]
            .last_error
            .contains("parser exploded"));
    }

    #[tokio::test]
    async fn test_paused_pool_starts_no_jobs() {
        let dir = TempDir::new().expect("temp dir");
        let queue = open_queue(&dir, 3).await;
        queue.add(["https://example.com/a"]).await;

        let calls = Arc::new(AtomicUsize::new(0));
        let calls_c = Arc::clone(&calls);
        let processor = processor_fn(move |_url: String| {
            let calls = Arc::clone(&calls_c);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, ProcessorError>(serde_json::Value::Null)
            }
        });

        let telemetry = Arc::new(FixedTelemetry::new(calm()));
        let pool = new_pool(&dir, fast_config(2, 2), telemetry);
        pool.pause();
        pool.start(Arc::clone(&queue), Arc::new(processor))
            .await
            .expect("start");

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(queue.stats().await.in_progress, 0);

        pool.resume();
        wait_until_drained(&queue).await;
        pool.stop().await.expect("stop");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_start_and_stop_state_errors() {
        let dir = TempDir::new().expect("temp dir");
        let queue = open_queue(&dir, 3).await;
        let telemetry = Arc::new(FixedTelemetry::new(calm()));
        let pool = new_pool(&dir, fast_config(1, 2), telemetry);
        let processor: Arc<dyn JobProcessor> = Arc::new(processor_fn(|_url: String| async move {
            Ok::<_, ProcessorError>(serde_json::Value::Null)
        }));

        assert!(matches!(pool.stop().await, Err(PoolError::NotRunning)));
        pool.start(Arc::clone(&queue), Arc::clone(&processor))
            .await
            .expect("start");
        assert!(matches!(
            pool.start(Arc::clone(&queue), processor).await,
            Err(PoolError::AlreadyRunning)
        ));

        let mut signal = pool.shutdown_signal();
        pool.stop().await.expect("stop");
        assert!(signal.recv().await.is_ok());
    }

    #[tokio::test]
    async fn test_write_checkpoint_includes_queue_stats() {
        let dir = TempDir::new().expect("temp dir");
        let queue = open_queue(&dir, 3).await;
        queue.add(["https://example.com/a", "https://example.com/b"]).await;

        let telemetry = Arc::new(FixedTelemetry::new(calm()));
        let pool = new_pool(&dir, fast_config(1, 2), telemetry);
        pool.pause();
        let processor = processor_fn(|_url: String| async move {
            Ok::<_, ProcessorError>(serde_json::Value::Null)
        });
        pool.start(Arc::clone(&queue), Arc::new(processor))
            .await
            .expect("start");

        let path = pool.write_checkpoint().await.expect("checkpoint");
        pool.stop().await.expect("stop");

        let value: serde_json::Value = crate::storage::read_json(&path)
            .await
            .expect("read")
            .expect("present");
        assert_eq!(value["queue_stats"]["queued"], 2);
        assert_eq!(value["current_concurrency"], 1);
        assert_eq!(value["processor_stats"]["paused"], true);
    }
}
