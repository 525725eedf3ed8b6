//! Threshold-based circuit breaker over host resources.
//!
//! Independent of the pool's own concurrency tuning, the monitor samples
//! CPU / memory / disk every `check_interval` and pauses the pool with
//! [`PauseReason::ResourcePressure`] when any reading crosses its critical
//! threshold. It resumes once every reading is back under
//! `resume_ratio * critical`. Only the monitor's own pause is cleared; an
//! operator pause stays in force.
//!
//! Every sample is kept in a bounded in-memory history and appended to
//! `resource_history_YYYYMMDD.json` in batches.

use std::collections::{BTreeMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::telemetry::{ResourceTelemetry, ResourceUsage};
use crate::error::{StorageError, TelemetryError};
use crate::metrics::MetricsCollector;
use crate::scheduler::queue::{DurableQueue, QueueStats};
use crate::scheduler::worker_pool::{AdaptiveWorkerPool, PauseReason};
use crate::storage::{read_json, write_json_atomic};

/// Errors raised by the resource monitor.
#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("Invalid monitor configuration: {0}")]
    InvalidConfig(String),

    #[error("Monitor is already running")]
    AlreadyRunning,

    #[error("Failed to write resource history: {0}")]
    Storage(#[from] StorageError),
}

/// Resource monitor settings.
#[derive(Debug, Clone, PartialEq)]
pub struct MonitorConfig {
    pub check_interval: Duration,
    pub cpu_critical: f64,
    pub memory_critical: f64,
    pub disk_critical: f64,
    /// Fraction of each critical threshold all readings must drop below to resume.
    pub resume_ratio: f64,
    /// Samples kept in memory.
    pub max_history: usize,
    /// Samples between history file flushes.
    pub flush_every: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(30),
            cpu_critical: 90.0,
            memory_critical: 90.0,
            disk_critical: 95.0,
            resume_ratio: 0.8,
            max_history: 100,
            flush_every: 10,
        }
    }
}

impl MonitorConfig {
    pub fn with_check_interval(mut self, interval: Duration) -> Self {
        self.check_interval = interval;
        self
    }

    /// Sets the CPU, memory and disk critical thresholds.
    pub fn with_critical_thresholds(mut self, cpu: f64, memory: f64, disk: f64) -> Self {
        self.cpu_critical = cpu;
        self.memory_critical = memory;
        self.disk_critical = disk;
        self
    }

    pub fn with_max_history(mut self, max_history: usize) -> Self {
        self.max_history = max_history;
        self
    }

    pub fn with_flush_every(mut self, flush_every: usize) -> Self {
        self.flush_every = flush_every;
        self
    }

    /// Checks thresholds and intervals.
    pub fn validate(&self) -> Result<(), MonitorError> {
        if self.check_interval.is_zero() {
            return Err(MonitorError::InvalidConfig(
                "check_interval must be greater than 0".to_string(),
            ));
        }
        for (name, value) in [
            ("cpu_critical", self.cpu_critical),
            ("memory_critical", self.memory_critical),
            ("disk_critical", self.disk_critical),
        ] {
            if !(value > 0.0 && value <= 100.0) {
                return Err(MonitorError::InvalidConfig(format!(
                    "{} must be within (0, 100], got {}",
                    name, value
                )));
            }
        }
        if !(self.resume_ratio > 0.0 && self.resume_ratio <= 1.0) {
            return Err(MonitorError::InvalidConfig(format!(
                "resume_ratio must be within (0, 1], got {}",
                self.resume_ratio
            )));
        }
        if self.max_history == 0 || self.flush_every == 0 {
            return Err(MonitorError::InvalidConfig(
                "max_history and flush_every must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Classifies a reading against the thresholds.
    pub fn classify(&self, usage: &ResourceUsage) -> Pressure {
        if usage.cpu_percent > self.cpu_critical
            || usage.memory_percent > self.memory_critical
            || usage.disk_percent > self.disk_critical
        {
            Pressure::Critical
        } else if usage.cpu_percent < self.cpu_critical * self.resume_ratio
            && usage.memory_percent < self.memory_critical * self.resume_ratio
            && usage.disk_percent < self.disk_critical * self.resume_ratio
        {
            Pressure::Normal
        } else {
            Pressure::Elevated
        }
    }
}

/// Resource pressure band.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Pressure {
    /// At least one reading above its critical threshold.
    Critical,
    /// Between the resume band and critical; no action.
    Elevated,
    /// Every reading under the resume band.
    Normal,
}

/// What a single check did to the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorAction {
    Paused,
    Resumed,
    Unchanged,
}

/// Pool state captured alongside a resource sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolSnapshot {
    pub concurrency: usize,
    pub active_tasks: usize,
    pub paused: bool,
}

/// One resource check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceSample {
    pub timestamp: DateTime<Utc>,
    pub cpu: f64,
    pub memory: f64,
    pub disk: f64,
    pub processor: PoolSnapshot,
    pub queue: QueueStats,
}

/// Critical thresholds as reported by [`MonitorStats`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Thresholds {
    pub cpu_critical: f64,
    pub memory_critical: f64,
    pub disk_critical: f64,
}

/// Monitor status summary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorStats {
    /// Live usage; absent when sampling failed.
    pub current: Option<ResourceUsage>,
    pub thresholds: Thresholds,
    pub processor_paused: bool,
    pub history_size: usize,
}

#[derive(Debug, Default)]
struct History {
    samples: VecDeque<ResourceSample>,
    unflushed: Vec<ResourceSample>,
}

struct MonitorInner {
    config: MonitorConfig,
    telemetry: Arc<dyn ResourceTelemetry>,
    pool: Arc<AdaptiveWorkerPool>,
    queue: Arc<DurableQueue>,
    history_dir: PathBuf,
    history: Mutex<History>,
    metrics: MetricsCollector,
}

impl MonitorInner {
    async fn check_resources(&self) -> Result<MonitorAction, TelemetryError> {
        let usage = self.telemetry.sample().await?;
        self.metrics.update_resources(&usage);

        info!(
            cpu = usage.cpu_percent,
            memory = usage.memory_percent,
            disk = usage.disk_percent,
            "System resources"
        );

        let sample = ResourceSample {
            timestamp: Utc::now(),
            cpu: usage.cpu_percent,
            memory: usage.memory_percent,
            disk: usage.disk_percent,
            processor: PoolSnapshot {
                concurrency: self.pool.current_concurrency(),
                active_tasks: self.pool.active_tasks(),
                paused: self.pool.is_paused(),
            },
            queue: self.queue.stats().await,
        };
        self.record(sample).await;

        let action = match self.config.classify(&usage) {
            Pressure::Critical if !self.pool.is_paused_for(PauseReason::ResourcePressure) => {
                warn!(
                    cpu = usage.cpu_percent,
                    memory = usage.memory_percent,
                    disk = usage.disk_percent,
                    "System resources critical, pausing processing"
                );
                self.pool.pause_for(PauseReason::ResourcePressure);
                MonitorAction::Paused
            }
            Pressure::Normal if self.pool.is_paused_for(PauseReason::ResourcePressure) => {
                info!("System resources normal, resuming processing");
                self.pool.resume_for(PauseReason::ResourcePressure);
                MonitorAction::Resumed
            }
            _ => MonitorAction::Unchanged,
        };
        Ok(action)
    }

    async fn record(&self, sample: ResourceSample) {
        let due = {
            let mut history = self.history.lock().await;
            history.samples.push_back(sample.clone());
            while history.samples.len() > self.config.max_history {
                history.samples.pop_front();
            }
            history.unflushed.push(sample);
            history.unflushed.len() >= self.config.flush_every
        };
        if due {
            self.flush().await;
        }
    }

    /// Appends unflushed samples to their daily files.
    ///
    /// Samples that could not be written are kept for the next flush, up to
    /// `max_history` of them.
    async fn flush(&self) {
        let mut history = self.history.lock().await;
        if history.unflushed.is_empty() {
            return;
        }

        let mut by_day: BTreeMap<String, Vec<ResourceSample>> = BTreeMap::new();
        for sample in history.unflushed.drain(..) {
            by_day
                .entry(sample.timestamp.format("%Y%m%d").to_string())
                .or_default()
                .push(sample);
        }

        let mut failed = Vec::new();
        for (day, samples) in by_day {
            let path = history_file(&self.history_dir, &day);
            match append_history(&path, &samples).await {
                Ok(total) => debug!(
                    path = %path.display(),
                    appended = samples.len(),
                    total = total,
                    "Saved resource history"
                ),
                Err(e) => {
                    error!(error = %e, "Error saving resource history");
                    failed.extend(samples);
                }
            }
        }

        if failed.len() > self.config.max_history {
            let excess = failed.len() - self.config.max_history;
            failed.drain(..excess);
        }
        history.unflushed = failed;
    }
}

fn history_file(dir: &Path, day: &str) -> PathBuf {
    dir.join(format!("resource_history_{}.json", day))
}

async fn append_history(path: &Path, samples: &[ResourceSample]) -> Result<usize, StorageError> {
    let mut entries: Vec<serde_json::Value> = match read_json(path).await {
        Ok(existing) => existing.unwrap_or_default(),
        Err(StorageError::Json { .. }) => {
            warn!(path = %path.display(), "Replacing unreadable resource history file");
            Vec::new()
        }
        Err(e) => return Err(e),
    };
    for sample in samples {
        entries.push(serde_json::to_value(sample).map_err(|e| StorageError::json(path, e))?);
    }
    write_json_atomic(path, &entries).await?;
    Ok(entries.len())
}

/// Background resource monitor bound to one pool and queue.
pub struct ResourceMonitor {
    inner: Arc<MonitorInner>,
    stop_tx: broadcast::Sender<()>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl ResourceMonitor {
    /// Creates a stopped monitor.
    ///
    /// # Errors
    ///
    /// Returns `MonitorError::InvalidConfig` if the configuration fails validation.
    pub fn new(
        config: MonitorConfig,
        telemetry: Arc<dyn ResourceTelemetry>,
        pool: Arc<AdaptiveWorkerPool>,
        queue: Arc<DurableQueue>,
        history_dir: impl Into<PathBuf>,
    ) -> Result<Self, MonitorError> {
        config.validate()?;
        let (stop_tx, _) = broadcast::channel(1);

        Ok(Self {
            inner: Arc::new(MonitorInner {
                config,
                telemetry,
                pool,
                queue,
                history_dir: history_dir.into(),
                history: Mutex::new(History::default()),
                metrics: MetricsCollector::new(),
            }),
            stop_tx,
            handle: Mutex::new(None),
        })
    }

    /// Spawns the monitoring loop.
    ///
    /// The loop ends on [`ResourceMonitor::stop`] or when the pool stops.
    pub async fn start(&self) -> Result<(), MonitorError> {
        let mut handle = self.handle.lock().await;
        if handle.as_ref().is_some_and(|h| !h.is_finished()) {
            return Err(MonitorError::AlreadyRunning);
        }

        let inner = Arc::clone(&self.inner);
        let mut stop_rx = self.stop_tx.subscribe();
        let mut pool_shutdown = self.inner.pool.shutdown_signal();

        *handle = Some(tokio::spawn(async move {
            info!(
                check_interval_secs = inner.config.check_interval.as_secs_f64(),
                "System monitoring started"
            );
            loop {
                if let Err(e) = inner.check_resources().await {
                    error!(error = %e, "Error checking resources");
                }

                tokio::select! {
                    _ = stop_rx.recv() => break,
                    _ = pool_shutdown.recv() => break,
                    _ = tokio::time::sleep(inner.config.check_interval) => {}
                }
            }
            inner.flush().await;
            info!("System monitoring stopped");
        }));
        Ok(())
    }

    /// Stops the loop and flushes remaining history.
    pub async fn stop(&self) {
        // Ignore send error - the loop may already have exited
        let _ = self.stop_tx.send(());
        if let Some(handle) = self.handle.lock().await.take() {
            if let Err(e) = handle.await {
                error!(error = %e, "Monitor task panicked");
            }
        }
        self.inner.flush().await;
    }

    /// Performs one sample and pause/resume decision now.
    ///
    /// # Errors
    ///
    /// Returns the telemetry error if sampling failed; nothing is recorded then.
    pub async fn check_resources(&self) -> Result<MonitorAction, TelemetryError> {
        self.inner.check_resources().await
    }

    /// Writes unflushed history now.
    pub async fn flush_history(&self) {
        self.inner.flush().await;
    }

    pub async fn stats(&self) -> MonitorStats {
        let current = match self.inner.telemetry.sample().await {
            Ok(usage) => Some(usage),
            Err(e) => {
                debug!(error = %e, "Resource sampling failed while collecting monitor stats");
                None
            }
        };
        let config = &self.inner.config;

        MonitorStats {
            current,
            thresholds: Thresholds {
                cpu_critical: config.cpu_critical,
                memory_critical: config.memory_critical,
                disk_critical: config.disk_critical,
            },
            processor_paused: self.inner.pool.is_paused(),
            history_size: self.inner.history.lock().await.samples.len(),
        }
    }

    /// Returns the in-memory history, oldest first.
    pub async fn history(&self) -> Vec<ResourceSample> {
        self.inner
            .history
            .lock()
            .await
            .samples
            .iter()
            .cloned()
            .collect()
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.inner.config
    }

    pub fn history_dir(&self) -> &Path {
        &self.inner.history_dir
    }
}
