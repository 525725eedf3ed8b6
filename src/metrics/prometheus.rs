//! Prometheus metrics registration and export.
//!
//! This module defines all Prometheus metrics used by crawl-forge and provides
//! functions for initializing, registering, and exporting metrics.

use prometheus::{
    CounterVec, Encoder, Gauge, GaugeVec, HistogramVec, IntCounter, Opts, Registry, TextEncoder,
};
use std::sync::OnceLock;

/// Global Prometheus registry for all crawl-forge metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Total jobs finished by the worker pool, labeled by outcome.
pub static JOBS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Job processing duration in seconds, labeled by outcome.
pub static JOB_DURATION: OnceLock<HistogramVec> = OnceLock::new();

/// Number of identifiers per queue state (queued, in_progress, completed, failed, permanent).
pub static QUEUE_DEPTH: OnceLock<GaugeVec> = OnceLock::new();

/// Number of jobs currently being processed.
pub static JOBS_IN_PROGRESS: OnceLock<Gauge> = OnceLock::new();

/// Live concurrency permit count of the worker pool.
pub static CURRENT_CONCURRENCY: OnceLock<Gauge> = OnceLock::new();

/// Concurrency adjustments, labeled by direction (increase/decrease).
pub static CONCURRENCY_ADJUSTMENTS: OnceLock<CounterVec> = OnceLock::new();

/// 1 while the pool is paused, 0 otherwise.
pub static POOL_PAUSED: OnceLock<Gauge> = OnceLock::new();

/// Last sampled host utilisation percentage, labeled by resource.
pub static RESOURCE_USAGE: OnceLock<GaugeVec> = OnceLock::new();

/// Batch runner items, labeled by outcome.
pub static BATCH_ITEMS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Times the batch runner had to wait for the rate-limit window.
pub static RATE_LIMIT_WAITS: OnceLock<IntCounter> = OnceLock::new();

/// Initialize all metrics and register them with the registry.
///
/// Call once at startup. Recording through [`super::MetricsCollector`] before
/// this is a silent no-op.
///
/// # Errors
///
/// Returns a `prometheus::Error` if metric registration fails, typically due to
/// duplicate metric names or invalid metric configurations.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    let registry = Registry::new();

    // Job metrics
    let jobs_total = CounterVec::new(
        Opts::new("crawl_forge_jobs_total", "Total number of jobs processed"),
        &["outcome"],
    )?;

    let job_duration = HistogramVec::new(
        prometheus::HistogramOpts::new(
            "crawl_forge_job_duration_seconds",
            "Job processing duration in seconds",
        )
        .buckets(vec![0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0, 60.0, 300.0]),
        &["outcome"],
    )?;

    // Queue metrics
    let queue_depth = GaugeVec::new(
        Opts::new("crawl_forge_queue_depth", "Number of identifiers per queue state"),
        &["state"],
    )?;

    let jobs_in_progress = Gauge::new(
        "crawl_forge_jobs_in_progress",
        "Number of jobs currently being processed",
    )?;

    // Pool metrics
    let current_concurrency = Gauge::new(
        "crawl_forge_current_concurrency",
        "Live concurrency permit count",
    )?;

    let concurrency_adjustments = CounterVec::new(
        Opts::new(
            "crawl_forge_concurrency_adjustments_total",
            "Concurrency adjustments made by the worker pool",
        ),
        &["direction"],
    )?;

    let pool_paused = Gauge::new("crawl_forge_pool_paused", "1 while the pool is paused")?;

    // Host metrics
    let resource_usage = GaugeVec::new(
        Opts::new(
            "crawl_forge_resource_usage_percent",
            "Last sampled host utilisation",
        ),
        &["resource"],
    )?;

    // Batch runner metrics
    let batch_items_total = CounterVec::new(
        Opts::new("crawl_forge_batch_items_total", "Batch runner items processed"),
        &["outcome"],
    )?;

    let rate_limit_waits = IntCounter::new(
        "crawl_forge_rate_limit_waits_total",
        "Times a batch had to wait for the rate-limit window",
    )?;

    registry.register(Box::new(jobs_total.clone()))?;
    registry.register(Box::new(job_duration.clone()))?;
    registry.register(Box::new(queue_depth.clone()))?;
    registry.register(Box::new(jobs_in_progress.clone()))?;
    registry.register(Box::new(current_concurrency.clone()))?;
    registry.register(Box::new(concurrency_adjustments.clone()))?;
    registry.register(Box::new(pool_paused.clone()))?;
    registry.register(Box::new(resource_usage.clone()))?;
    registry.register(Box::new(batch_items_total.clone()))?;
    registry.register(Box::new(rate_limit_waits.clone()))?;

    // If any of these fail, metrics were already initialized (idempotent)
    let _ = REGISTRY.set(registry);
    let _ = JOBS_TOTAL.set(jobs_total);
    let _ = JOB_DURATION.set(job_duration);
    let _ = QUEUE_DEPTH.set(queue_depth);
    let _ = JOBS_IN_PROGRESS.set(jobs_in_progress);
    let _ = CURRENT_CONCURRENCY.set(current_concurrency);
    let _ = CONCURRENCY_ADJUSTMENTS.set(concurrency_adjustments);
    let _ = POOL_PAUSED.set(pool_paused);
    let _ = RESOURCE_USAGE.set(resource_usage);
    let _ = BATCH_ITEMS_TOTAL.set(batch_items_total);
    let _ = RATE_LIMIT_WAITS.set(rate_limit_waits);

    tracing::info!("Prometheus metrics initialized successfully");

    Ok(())
}

/// Export all registered metrics in Prometheus text format.
///
/// If the registry has not been initialized or encoding fails, returns a
/// comment line describing the problem.
pub fn export_metrics() -> String {
    let Some(registry) = REGISTRY.get() else {
        return "# Metrics not initialized. Call init_metrics() first.\n".to_string();
    };

    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return format!("# Error encoding metrics: {}\n", e);
    }

    String::from_utf8(buffer)
        .unwrap_or_else(|e| format!("# Error converting metrics to UTF-8: {}\n", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_metrics() {
        let result = init_metrics();
        // First call should succeed or metrics already initialized
        assert!(result.is_ok() || REGISTRY.get().is_some());
    }

    #[test]
    fn test_metrics_after_init() {
        let _ = init_metrics();

        let metrics = export_metrics();
        assert!(!metrics.is_empty());
        if REGISTRY.get().is_some() {
            assert!(!metrics.starts_with("# Error"));
        }
    }
}
