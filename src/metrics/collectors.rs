//! Metric recording facade for scheduler components.
//!
//! `MetricsCollector` wraps the raw Prometheus statics so callers never have
//! to check whether metrics were initialized.

use std::time::Duration;

use super::prometheus::{
    BATCH_ITEMS_TOTAL, CONCURRENCY_ADJUSTMENTS, CURRENT_CONCURRENCY, JOBS_IN_PROGRESS, JOBS_TOTAL,
    JOB_DURATION, POOL_PAUSED, QUEUE_DEPTH, RATE_LIMIT_WAITS, RESOURCE_USAGE,
};
use crate::monitor::telemetry::ResourceUsage;
use crate::scheduler::queue::QueueStats;

/// Metrics collector for recording crawl-forge operational metrics.
///
/// # Example
///
/// ```ignore
/// use crawl_forge::metrics::{init_metrics, MetricsCollector};
///
/// init_metrics().expect("Failed to init metrics");
/// let collector = MetricsCollector::new();
/// collector.record_job(true, Duration::from_secs(2));
/// ```
#[derive(Debug, Clone, Default)]
pub struct MetricsCollector;

impl MetricsCollector {
    pub fn new() -> Self {
        Self
    }

    /// Record a finished job.
    pub fn record_job(&self, success: bool, duration: Duration) {
        let outcome = if success { "success" } else { "failure" };

        if let Some(jobs_total) = JOBS_TOTAL.get() {
            jobs_total.with_label_values(&[outcome]).inc();
        }

        if let Some(job_duration) = JOB_DURATION.get() {
            job_duration
                .with_label_values(&[outcome])
                .observe(duration.as_secs_f64());
        }

        tracing::trace!(
            outcome = outcome,
            duration_secs = duration.as_secs_f64(),
            "Recorded job metric"
        );
    }

    /// Update per-state queue gauges.
    pub fn update_queue(&self, stats: &QueueStats) {
        if let Some(queue_depth) = QUEUE_DEPTH.get() {
            queue_depth
                .with_label_values(&["queued"])
                .set(stats.queued as f64);
            queue_depth
                .with_label_values(&["in_progress"])
                .set(stats.in_progress as f64);
            queue_depth
                .with_label_values(&["completed"])
                .set(stats.completed as f64);
            queue_depth
                .with_label_values(&["failed"])
                .set(stats.failed as f64);
            queue_depth
                .with_label_values(&["permanent"])
                .set(stats.permanent_failures as f64);
        }
    }

    pub fn inc_jobs_in_progress(&self) {
        if let Some(gauge) = JOBS_IN_PROGRESS.get() {
            gauge.inc();
        }
    }

    pub fn dec_jobs_in_progress(&self) {
        if let Some(gauge) = JOBS_IN_PROGRESS.get() {
            gauge.dec();
        }
    }

    /// Record a concurrency change.
    pub fn record_concurrency_change(&self, old: usize, new: usize) {
        if let Some(gauge) = CURRENT_CONCURRENCY.get() {
            gauge.set(new as f64);
        }

        if old != new {
            let direction = if new > old { "increase" } else { "decrease" };
            if let Some(counter) = CONCURRENCY_ADJUSTMENTS.get() {
                counter.with_label_values(&[direction]).inc();
            }
        }
    }

    pub fn update_paused(&self, paused: bool) {
        if let Some(gauge) = POOL_PAUSED.get() {
            gauge.set(if paused { 1.0 } else { 0.0 });
        }
    }

    pub fn update_resources(&self, usage: &ResourceUsage) {
        if let Some(gauge) = RESOURCE_USAGE.get() {
            gauge.with_label_values(&["cpu"]).set(usage.cpu_percent);
            gauge.with_label_values(&["memory"]).set(usage.memory_percent);
            gauge.with_label_values(&["disk"]).set(usage.disk_percent);
        }
    }

    pub fn record_batch_item(&self, success: bool) {
        let outcome = if success { "success" } else { "failure" };
        if let Some(counter) = BATCH_ITEMS_TOTAL.get() {
            counter.with_label_values(&[outcome]).inc();
        }
    }

    pub fn record_rate_limit_wait(&self) {
        if let Some(counter) = RATE_LIMIT_WAITS.get() {
            counter.inc();
        }
    }
}
