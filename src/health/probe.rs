//! Worker process discovery.
//!
//! Polling is bounded: results stream out of a blocking task, and whatever
//! arrived before the deadline is returned as an incomplete snapshot rather
//! than as "no workers".

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use regex::Regex;
use sysinfo::{Pid, Process, ProcessRefreshKind, ProcessStatus, ProcessesToUpdate, RefreshKind, System, UpdateKind};
use tokio::sync::mpsc;
use tracing::warn;

use super::{WorkerMetrics, WorkerStatus};

/// Default bound on one poll.
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_secs(5);

/// Workers seen in one poll.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Snapshot {
    pub workers: Vec<WorkerMetrics>,
    /// False when the poll hit its deadline; absent workers are then unknown,
    /// not gone.
    pub complete: bool,
}

impl Snapshot {
    pub fn complete(workers: Vec<WorkerMetrics>) -> Self {
        Self {
            workers,
            complete: true,
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.workers.iter().any(|w| w.name == name)
    }
}

/// Source of worker snapshots.
#[async_trait]
pub trait WorkerProbe: Send + Sync {
    async fn poll(&self) -> Snapshot;
}

/// Finds workers in the OS process table by command-line pattern.
pub struct ProcessProbe {
    pattern: Regex,
    timeout: Duration,
    system: Arc<Mutex<System>>,
}

impl ProcessProbe {
    pub fn new(pattern: Regex) -> Self {
        Self {
            pattern,
            timeout: DEFAULT_POLL_TIMEOUT,
            system: Arc::new(Mutex::new(System::new_with_specifics(RefreshKind::nothing()))),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl WorkerProbe for ProcessProbe {
    async fn poll(&self) -> Snapshot {
        let (tx, mut rx) = mpsc::channel(64);
        let system = Arc::clone(&self.system);
        let pattern = self.pattern.clone();

        let scan = tokio::task::spawn_blocking(move || {
            let Ok(mut system) = system.lock() else {
                return;
            };
            system.refresh_processes_specifics(
                ProcessesToUpdate::All,
                true,
                ProcessRefreshKind::nothing()
                    .with_memory()
                    .with_cpu()
                    .with_cmd(UpdateKind::OnlyIfNotSet),
            );
            let own_pid = sysinfo::get_current_pid().ok();
            for (pid, process) in system.processes() {
                if Some(*pid) == own_pid {
                    continue;
                }
                let command_line = command_line(process);
                if !pattern.is_match(&command_line) {
                    continue;
                }
                if tx.blocking_send(metrics_for(*pid, process, &command_line)).is_err() {
                    // Receiver gave up at the deadline.
                    return;
                }
            }
        });

        let mut workers = Vec::new();
        let deadline = tokio::time::sleep(self.timeout);
        tokio::pin!(deadline);
        let complete = loop {
            tokio::select! {
                received = rx.recv() => match received {
                    Some(worker) => workers.push(worker),
                    None => break true,
                },
                _ = &mut deadline => break false,
            }
        };

        if !complete {
            warn!(
                timeout_secs = self.timeout.as_secs_f64(),
                seen = workers.len(),
                "Worker poll timed out, visibility degraded"
            );
        }
        drop(scan);
        Snapshot { workers, complete }
    }
}

fn command_line(process: &Process) -> String {
    if process.cmd().is_empty() {
        return process.name().to_string_lossy().into_owned();
    }
    process
        .cmd()
        .iter()
        .map(|arg| arg.to_string_lossy())
        .collect::<Vec<_>>()
        .join(" ")
}

fn metrics_for(pid: Pid, process: &Process, command_line: &str) -> WorkerMetrics {
    let fallback = format!("{}-{}", process.name().to_string_lossy(), pid.as_u32());
    WorkerMetrics {
        name: worker_identity(command_line).unwrap_or(fallback),
        pid: pid.as_u32(),
        memory_mb: process.memory() as f64 / (1024.0 * 1024.0),
        cpu_percent: process.cpu_usage(),
        status: map_status(process.status()),
        timestamp: Utc::now(),
    }
}

/// Extracts the `--worker-id` value from a command line.
pub fn worker_identity(command_line: &str) -> Option<String> {
    let mut args = command_line.split_whitespace();
    while let Some(arg) = args.next() {
        if arg == "--worker-id" {
            return args.next().map(str::to_string);
        }
        if let Some(value) = arg.strip_prefix("--worker-id=") {
            return (!value.is_empty()).then(|| value.to_string());
        }
    }
    None
}

fn map_status(status: ProcessStatus) -> WorkerStatus {
    match status {
        ProcessStatus::Run => WorkerStatus::Running,
        ProcessStatus::Sleep | ProcessStatus::Idle | ProcessStatus::Waking => WorkerStatus::Sleeping,
        ProcessStatus::Stop | ProcessStatus::Tracing => WorkerStatus::Stopped,
        ProcessStatus::Zombie | ProcessStatus::Dead => WorkerStatus::Zombie,
        _ => WorkerStatus::Unknown,
    }
}
