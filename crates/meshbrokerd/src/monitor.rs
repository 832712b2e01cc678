//! Resource monitoring for the broker daemon.
//!
//! A relay that runs for weeks on a small box should notice when it
//! starts eating memory. This task samples the daemon's own CPU and
//! memory periodically, warning when either crosses its threshold.

use std::process;
use std::time::Duration;

use sysinfo::{Pid, System};
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Memory usage warning threshold in MB.
pub const HIGH_MEMORY_THRESHOLD_MB: u64 = 64;

/// CPU usage warning threshold (percentage).
pub const HIGH_CPU_THRESHOLD_PERCENT: f32 = 50.0;

/// How often to sample resource usage.
pub const SAMPLE_INTERVAL: Duration = Duration::from_secs(60);

/// One resource usage sample.
#[derive(Debug, Clone, Default)]
pub struct ResourceUsage {
    /// Resident memory in megabytes.
    pub memory_mb: u64,

    /// CPU usage as percentage (0.0 - 100.0+).
    pub cpu_percent: f32,

    /// Whether memory is above threshold.
    pub memory_high: bool,

    /// Whether CPU is above threshold.
    pub cpu_high: bool,
}

impl ResourceUsage {
    pub fn is_any_high(&self) -> bool {
        self.memory_high || self.cpu_high
    }
}

/// Samples resource usage of the broker process via `sysinfo`.
pub struct ResourceMonitor {
    system: System,
    pid: Pid,
    memory_threshold_mb: u64,
    cpu_threshold_percent: f32,
}

impl ResourceMonitor {
    /// Monitor for the current process with default thresholds.
    pub fn new() -> Self {
        Self::with_thresholds(HIGH_MEMORY_THRESHOLD_MB, HIGH_CPU_THRESHOLD_PERCENT)
    }

    pub fn with_thresholds(memory_threshold_mb: u64, cpu_threshold_percent: f32) -> Self {
        Self {
            system: System::new(),
            pid: Pid::from_u32(process::id()),
            memory_threshold_mb,
            cpu_threshold_percent,
        }
    }

    /// Refreshes process information and returns the current sample.
    ///
    /// sysinfo computes CPU against the previous refresh, so the first
    /// sample after startup reads 0% and serves as the baseline.
    pub fn sample(&mut self) -> ResourceUsage {
        // refresh_all() is required for CPU calculation; refreshing a
        // single process does not compute CPU%.
        self.system.refresh_all();

        let (memory_bytes, cpu_percent) = self
            .system
            .process(self.pid)
            .map(|p| (p.memory(), p.cpu_usage()))
            .unwrap_or((0, 0.0));

        let memory_mb = memory_bytes / 1024 / 1024;
        ResourceUsage {
            memory_mb,
            cpu_percent,
            memory_high: memory_mb > self.memory_threshold_mb,
            cpu_high: cpu_percent > self.cpu_threshold_percent,
        }
    }

    pub fn memory_threshold_mb(&self) -> u64 {
        self.memory_threshold_mb
    }

    pub fn cpu_threshold_percent(&self) -> f32 {
        self.cpu_threshold_percent
    }
}

impl Default for ResourceMonitor {
    fn default() -> Self {
        Self::new()
    }
}

/// Spawns the resource monitoring task.
pub fn spawn_resource_monitor(cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut monitor = ResourceMonitor::new();
        let mut tick = interval(SAMPLE_INTERVAL);

        // Baseline refresh so the next sample's CPU% is meaningful.
        let _ = monitor.sample();

        info!(
            memory_threshold_mb = monitor.memory_threshold_mb(),
            cpu_threshold_percent = monitor.cpu_threshold_percent(),
            interval_secs = SAMPLE_INTERVAL.as_secs(),
            "Resource monitor started"
        );

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    debug!("Resource monitor shutting down");
                    break;
                }

                _ = tick.tick() => {
                    let usage = monitor.sample();
                    log_usage(&usage, &monitor);
                }
            }
        }
    })
}

fn log_usage(usage: &ResourceUsage, monitor: &ResourceMonitor) {
    if usage.memory_high {
        warn!(
            memory_mb = usage.memory_mb,
            threshold_mb = monitor.memory_threshold_mb(),
            cpu_percent = format!("{:.1}", usage.cpu_percent),
            "Broker memory usage above threshold"
        );
    } else if usage.cpu_high {
        warn!(
            memory_mb = usage.memory_mb,
            cpu_percent = format!("{:.1}", usage.cpu_percent),
            threshold_percent = monitor.cpu_threshold_percent(),
            "Broker CPU usage above threshold"
        );
    } else {
        debug!(
            memory_mb = usage.memory_mb,
            cpu_percent = format!("{:.1}", usage.cpu_percent),
            "Broker resource usage"
        );
    }
}
