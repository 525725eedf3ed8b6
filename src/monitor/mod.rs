//! Host resource telemetry and the resource monitor.
//!
//! - [`ResourceTelemetry`]: polled source of CPU / memory / disk utilisation
//! - [`ResourceMonitor`]: pauses the worker pool under critical load and
//!   keeps a bounded, periodically flushed history of samples

pub mod resource_monitor;
pub mod telemetry;

pub use resource_monitor::{
    MonitorAction, MonitorConfig, MonitorError, MonitorStats, PoolSnapshot, Pressure,
    ResourceMonitor, ResourceSample, Thresholds,
};
pub use telemetry::{FixedTelemetry, ResourceTelemetry, ResourceUsage, SysinfoTelemetry};
