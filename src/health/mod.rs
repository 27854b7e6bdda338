//! Health monitoring and autoscaling of the worker pool.
//!
//! The controller polls worker processes on a fixed interval, escalates
//! workers through `HealthStatus` levels on consecutive failed checks, restarts
//! critical ones within a bounded budget, and sizes the pool to queue depth
//! with a cooldown between fleet changes.

pub mod controller;
pub mod launcher;
pub mod probe;
pub mod scaling;
pub mod tracker;

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use controller::{ControllerSettings, CycleReport, HealthController};
pub use launcher::{ControllerError, ProcessLauncher, StopMode, WorkerLauncher};
pub use probe::{ProcessProbe, Snapshot, WorkerProbe};
pub use scaling::{evaluate_scaling, Autoscaler, ScalingAction, ScalingDecision, ScalingPolicy};
pub use tracker::{Assessment, HealthAction, HealthTracker};

/// Process state as observed by the probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Running,
    Sleeping,
    Stopped,
    Zombie,
    Unknown,
}

impl WorkerStatus {
    /// Running or blocked waiting for work; either way the process is alive.
    pub fn is_running(&self) -> bool {
        matches!(self, WorkerStatus::Running | WorkerStatus::Sleeping)
    }
}

/// Resource limits a healthy worker stays under.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HealthThresholds {
    pub memory_limit_mb: f64,
    pub cpu_limit_percent: f32,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            memory_limit_mb: 2048.0,
            cpu_limit_percent: 90.0,
        }
    }
}

/// One worker process at one poll.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerMetrics {
    /// Worker identity (stable across restarts).
    pub name: String,
    pub pid: u32,
    pub memory_mb: f64,
    pub cpu_percent: f32,
    pub status: WorkerStatus,
    pub timestamp: DateTime<Utc>,
}

impl WorkerMetrics {
    pub fn is_healthy(&self, thresholds: &HealthThresholds) -> bool {
        self.status.is_running()
            && self.memory_mb < thresholds.memory_limit_mb
            && self.cpu_percent < thresholds.cpu_limit_percent
    }
}

/// Escalation level derived from consecutive failed checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
    Critical,
}

impl HealthStatus {
    /// Level after `failures` consecutive failed checks, with `threshold`
    /// failures meaning critical.
    pub fn from_failures(failures: u32, threshold: u32) -> Self {
        let threshold = threshold.max(1);
        if failures == 0 {
            HealthStatus::Healthy
        } else if failures >= threshold {
            HealthStatus::Critical
        } else if failures + 1 == threshold {
            HealthStatus::Unhealthy
        } else {
            HealthStatus::Degraded
        }
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Unhealthy => "unhealthy",
            HealthStatus::Critical => "critical",
        };
        f.write_str(s)
    }
}
