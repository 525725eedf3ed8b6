//! Control operations exposed to an outer transport layer.
//!
//! [`ControlSurface`] bundles the pool, the queue and (optionally) the
//! resource monitor behind the handful of operations an HTTP front end
//! would route to: status, pause, resume, add-urls and metrics export.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::metrics::{export_metrics, MetricsCollector};
use crate::monitor::{MonitorStats, ResourceMonitor};
use crate::scheduler::{AdaptiveWorkerPool, DurableQueue, PoolStats, QueueStats};

/// Combined pool, queue and host status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusReport {
    pub processor: PoolStats,
    pub queue: QueueStats,
    /// Monitor view of the host; absent when no monitor is attached.
    pub system: Option<MonitorStats>,
}

/// Result of a pause or resume request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PauseResponse {
    /// Whether the pool is paused after the request.
    pub paused: bool,
    /// Whether the request changed anything.
    pub changed: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AddUrlsRequest {
    pub urls: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddUrlsResponse {
    pub added: usize,
}

/// Transport-free control operations over a running engine.
#[derive(Clone)]
pub struct ControlSurface {
    pool: Arc<AdaptiveWorkerPool>,
    queue: Arc<DurableQueue>,
    monitor: Option<Arc<ResourceMonitor>>,
    metrics: MetricsCollector,
}

impl ControlSurface {
    pub fn new(pool: Arc<AdaptiveWorkerPool>, queue: Arc<DurableQueue>) -> Self {
        Self {
            pool,
            queue,
            monitor: None,
            metrics: MetricsCollector::new(),
        }
    }

    /// Attaches a resource monitor whose view is included in [`status`](Self::status).
    pub fn with_monitor(mut self, monitor: Arc<ResourceMonitor>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    /// Best-known in-memory state of the pool, queue and host.
    pub async fn status(&self) -> StatusReport {
        let processor = self.pool.stats().await;
        let queue = self.queue.stats().await;
        let system = match &self.monitor {
            Some(monitor) => Some(monitor.stats().await),
            None => None,
        };
        self.metrics.update_queue(&queue);

        StatusReport {
            processor,
            queue,
            system,
        }
    }

    /// Operator pause. Idempotent.
    pub fn pause(&self) -> PauseResponse {
        let changed = self.pool.pause();
        info!(changed = changed, "Pause requested");
        PauseResponse {
            paused: self.pool.is_paused(),
            changed,
        }
    }

    /// Operator resume. Idempotent.
    ///
    /// A pause held by the resource monitor stays in effect, in which case
    /// `paused` is still `true` in the response.
    pub fn resume(&self) -> PauseResponse {
        let changed = self.pool.resume();
        info!(changed = changed, "Resume requested");
        PauseResponse {
            paused: self.pool.is_paused(),
            changed,
        }
    }

    /// Adds URLs to the durable queue.
    pub async fn add_urls(&self, request: AddUrlsRequest) -> AddUrlsResponse {
        let urls = request
            .urls
            .into_iter()
            .map(|url| url.trim().to_string())
            .filter(|url| !url.is_empty());
        let added = self.queue.add(urls).await;
        self.metrics.update_queue(&self.queue.stats().await);
        AddUrlsResponse { added }
    }

    /// Prometheus text exposition of all registered metrics.
    pub fn metrics(&self) -> String {
        export_metrics()
    }

    pub fn pool(&self) -> &Arc<AdaptiveWorkerPool> {
        &self.pool
    }

    pub fn queue(&self) -> &Arc<DurableQueue> {
        &self.queue
    }
}
