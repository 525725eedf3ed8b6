//! Host resource telemetry sources.
//!
//! Telemetry is polled, never pushed: the worker pool samples it once per
//! adjustment cycle and the resource monitor once per check interval.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sysinfo::{CpuRefreshKind, Disks, MemoryRefreshKind, RefreshKind, System};
use tokio::sync::Mutex;

use crate::error::TelemetryError;

/// Point-in-time utilisation percentages (0-100).
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub disk_percent: f64,
}

impl ResourceUsage {
    pub fn new(cpu_percent: f64, memory_percent: f64, disk_percent: f64) -> Self {
        Self {
            cpu_percent,
            memory_percent,
            disk_percent,
        }
    }
}

/// Source of CPU / memory / disk utilisation.
#[async_trait]
pub trait ResourceTelemetry: Send + Sync {
    /// Samples current utilisation.
    async fn sample(&self) -> Result<ResourceUsage, TelemetryError>;
}

/// Telemetry backed by the `sysinfo` crate.
///
/// Disk usage is reported for the filesystem holding `disk_path` (the mount
/// point with the longest matching prefix).
pub struct SysinfoTelemetry {
    system: Mutex<System>,
    disks: Mutex<Disks>,
    disk_path: PathBuf,
}

impl SysinfoTelemetry {
    /// Creates a telemetry source watching the disk that holds `disk_path`.
    pub fn new(disk_path: impl Into<PathBuf>) -> Self {
        let mut system = System::new_with_specifics(
            RefreshKind::nothing()
                .with_cpu(CpuRefreshKind::everything())
                .with_memory(MemoryRefreshKind::everything()),
        );
        // CPU usage is a delta between refreshes; prime the first reading.
        system.refresh_cpu_all();

        let disk_path = disk_path.into();
        let disk_path = std::fs::canonicalize(&disk_path).unwrap_or(disk_path);

        Self {
            system: Mutex::new(system),
            disks: Mutex::new(Disks::new_with_refreshed_list()),
            disk_path,
        }
    }

    async fn disk_percent(&self) -> Result<f64, TelemetryError> {
        let mut disks = self.disks.lock().await;
        disks.refresh(true);

        let mut best: Option<(&sysinfo::Disk, usize)> = None;
        for disk in disks.list() {
            let mount_point = disk.mount_point();
            if self.disk_path.starts_with(mount_point) {
                let depth = mount_point.components().count();
                if best.is_none_or(|(_, best_depth)| depth > best_depth) {
                    best = Some((disk, depth));
                }
            }
        }

        let (disk, _) =
            best.ok_or_else(|| TelemetryError::DiskNotFound(self.disk_path.display().to_string()))?;
        Ok(used_percent(disk.total_space(), disk.available_space()))
    }

    /// Returns the watched path.
    pub fn disk_path(&self) -> &Path {
        &self.disk_path
    }
}

#[async_trait]
impl ResourceTelemetry for SysinfoTelemetry {
    async fn sample(&self) -> Result<ResourceUsage, TelemetryError> {
        let (cpu_percent, memory_percent) = {
            let mut system = self.system.lock().await;
            system.refresh_cpu_all();
            system.refresh_memory();

            let cpu = system.global_cpu_usage() as f64;
            let total = system.total_memory();
            let used = system.used_memory();
            let memory = if total > 0 {
                used as f64 / total as f64 * 100.0
            } else {
                0.0
            };
            (cpu, memory)
        };

        let disk_percent = self.disk_percent().await?;

        Ok(ResourceUsage {
            cpu_percent,
            memory_percent,
            disk_percent,
        })
    }
}

fn used_percent(total_bytes: u64, available_bytes: u64) -> f64 {
    if total_bytes == 0 {
        return 0.0;
    }
    let used = total_bytes.saturating_sub(available_bytes);
    used as f64 / total_bytes as f64 * 100.0
}

/// Telemetry that reports whatever values were last set.
///
/// Useful for tests and for running without touching the host.
#[derive(Debug, Default)]
pub struct FixedTelemetry {
    cpu: AtomicU64,
    memory: AtomicU64,
    disk: AtomicU64,
    failing: AtomicBool,
}

impl FixedTelemetry {
    pub fn new(usage: ResourceUsage) -> Self {
        let telemetry = Self::default();
        telemetry.set(usage);
        telemetry
    }

    /// Replaces all three readings.
    pub fn set(&self, usage: ResourceUsage) {
        self.cpu.store(usage.cpu_percent.to_bits(), Ordering::SeqCst);
        self.memory
            .store(usage.memory_percent.to_bits(), Ordering::SeqCst);
        self.disk.store(usage.disk_percent.to_bits(), Ordering::SeqCst);
    }

    pub fn set_cpu(&self, cpu_percent: f64) {
        self.cpu.store(cpu_percent.to_bits(), Ordering::SeqCst);
    }

    /// Makes subsequent samples fail (or succeed again).
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn current(&self) -> ResourceUsage {
        ResourceUsage {
            cpu_percent: f64::from_bits(self.cpu.load(Ordering::SeqCst)),
            memory_percent: f64::from_bits(self.memory.load(Ordering::SeqCst)),
            disk_percent: f64::from_bits(self.disk.load(Ordering::SeqCst)),
        }
    }
}

#[async_trait]
impl ResourceTelemetry for FixedTelemetry {
    async fn sample(&self) -> Result<ResourceUsage, TelemetryError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(TelemetryError::SampleFailed(
                "fixed telemetry set to fail".to_string(),
            ));
        }
        Ok(self.current())
    }
}
