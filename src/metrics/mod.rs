//! Prometheus-based monitoring for the scheduler.
//!
//! Covers job outcomes and durations, queue depth per state, pool
//! concurrency and pause state, sampled host utilisation and the batch
//! runner's throughput.
//!
//! # Example
//!
//! ```ignore
//! use crawl_forge::metrics::{init_metrics, export_metrics, MetricsCollector};
//!
//! init_metrics().expect("Failed to initialize metrics");
//! let collector = MetricsCollector::new();
//! collector.record_job(true, Duration::from_secs(3));
//! let metrics_text = export_metrics();
//! ```

pub mod collectors;
pub mod prometheus;

pub use collectors::MetricsCollector;
pub use prometheus::{export_metrics, init_metrics};

pub use prometheus::{
    BATCH_ITEMS_TOTAL, CONCURRENCY_ADJUSTMENTS, CURRENT_CONCURRENCY, JOBS_IN_PROGRESS, JOBS_TOTAL,
    JOB_DURATION, POOL_PAUSED, QUEUE_DEPTH, RATE_LIMIT_WAITS, REGISTRY, RESOURCE_USAGE,
};
