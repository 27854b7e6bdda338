//! Worker lifecycle signals: start, graceful stop, hard stop.

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;
use tracing::info;

use super::WorkerMetrics;

/// A spawn or stop that did not happen. Never fatal to the control loop.
#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("Worker command is empty")]
    EmptyCommand,

    #[error("Failed to spawn worker {worker}: {source}")]
    Spawn {
        worker: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to signal pid {pid}: {message}")]
    Signal { pid: u32, message: String },
}

/// How to stop a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopMode {
    /// SIGTERM: finish the in-flight message, then exit.
    Graceful,
    /// SIGKILL: the in-flight message is recovered by the broker.
    Hard,
}

impl StopMode {
    fn signal(&self) -> &'static str {
        match self {
            StopMode::Graceful => "-TERM",
            StopMode::Hard => "-KILL",
        }
    }
}

#[async_trait]
pub trait WorkerLauncher: Send + Sync {
    /// Starts a worker with the given identity and returns its pid.
    async fn spawn(&self, worker_id: &str) -> Result<u32, ControllerError>;

    async fn stop(&self, worker: &WorkerMetrics, mode: StopMode) -> Result<(), ControllerError>;
}

/// Launches `<command> --worker-id <id>` as a detached child process.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    command: String,
    working_dir: PathBuf,
}

impl ProcessLauncher {
    pub fn new(command: impl Into<String>, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            command: command.into(),
            working_dir: working_dir.into(),
        }
    }
}

#[async_trait]
impl WorkerLauncher for ProcessLauncher {
    async fn spawn(&self, worker_id: &str) -> Result<u32, ControllerError> {
        let mut parts = self.command.split_whitespace();
        let program = parts.next().ok_or(ControllerError::EmptyCommand)?;

        let child = Command::new(program)
            .args(parts)
            .arg("--worker-id")
            .arg(worker_id)
            .current_dir(&self.working_dir)
            .stdin(Stdio::null())
            .spawn()
            .map_err(|source| ControllerError::Spawn {
                worker: worker_id.to_string(),
                source,
            })?;

        let pid = child.id().unwrap_or_default();
        info!(worker = %worker_id, pid, "Started worker");
        // The child outlives this handle; tokio reaps it once it exits.
        drop(child);
        Ok(pid)
    }

    async fn stop(&self, worker: &WorkerMetrics, mode: StopMode) -> Result<(), ControllerError> {
        let pid = worker.pid.to_string();
        let output = Command::new("kill")
            .args([mode.signal(), pid.as_str()])
            .output()
            .await
            .map_err(|e| ControllerError::Signal {
                pid: worker.pid,
                message: e.to_string(),
            })?;

        if !output.status.success() {
            return Err(ControllerError::Signal {
                pid: worker.pid,
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        info!(worker = %worker.name, pid = worker.pid, mode = ?mode, "Signalled worker");
        Ok(())
    }
}
