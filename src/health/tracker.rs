//! Per-worker consecutive-failure tracking and restart budgeting.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, error, warn};

use super::probe::Snapshot;
use super::{HealthStatus, HealthThresholds, WorkerMetrics};

/// What the controller should do about one worker.
#[derive(Debug, Clone, PartialEq)]
pub enum HealthAction {
    None,
    /// Critical: restart. `worker` is `None` when the process has vanished.
    Restart { worker: Option<WorkerMetrics> },
    /// Restart budget exhausted: surface for manual intervention (once).
    GiveUp,
}

/// Outcome of one check for one worker identity.
#[derive(Debug, Clone, PartialEq)]
pub struct Assessment {
    pub name: String,
    pub status: HealthStatus,
    pub failures: u32,
    pub action: HealthAction,
}

#[derive(Debug, Default)]
struct WorkerHealth {
    failures: u32,
    restarts: VecDeque<Instant>,
    permanently_failed: bool,
}

/// Tracks consecutive failed checks per worker identity.
#[derive(Debug)]
pub struct HealthTracker {
    failure_threshold: u32,
    max_restarts: u32,
    restart_window: Duration,
    thresholds: HealthThresholds,
    workers: HashMap<String, WorkerHealth>,
    /// Stopped on purpose; ignored until they leave the process table.
    stopping: HashSet<String>,
}

impl HealthTracker {
    pub fn new(
        failure_threshold: u32,
        max_restarts: u32,
        restart_window: Duration,
        thresholds: HealthThresholds,
    ) -> Self {
        Self {
            failure_threshold: failure_threshold.max(1),
            max_restarts,
            restart_window,
            thresholds,
            workers: HashMap::new(),
            stopping: HashSet::new(),
        }
    }

    /// Applies one poll. Known workers missing from a complete snapshot count
    /// as a failed check; an incomplete snapshot leaves them untouched.
    /// Workers being stopped are skipped.
    pub fn observe(&mut self, snapshot: &Snapshot, now: Instant) -> Vec<Assessment> {
        let mut assessments = Vec::new();

        if snapshot.complete {
            self.stopping.retain(|name| snapshot.contains(name));
        }

        for worker in &snapshot.workers {
            if self.stopping.contains(&worker.name) {
                continue;
            }
            let healthy = worker.is_healthy(&self.thresholds);
            assessments.push(self.check(&worker.name, healthy, Some(worker), now));
        }

        if snapshot.complete {
            let mut missing: Vec<String> = self
                .workers
                .keys()
                .filter(|name| !snapshot.contains(name))
                .cloned()
                .collect();
            missing.sort();
            for name in missing {
                debug!(worker = %name, "Known worker missing from process table");
                assessments.push(self.check(&name, false, None, now));
            }
        }

        assessments
    }

    /// Stops tracking a worker that is being stopped on purpose. It stays
    /// ignored while it drains, then is dropped once it exits.
    pub fn mark_stopping(&mut self, name: &str) {
        self.workers.remove(name);
        self.stopping.insert(name.to_string());
    }

    pub fn is_stopping(&self, name: &str) -> bool {
        self.stopping.contains(name)
    }

    /// Tracked workers absent from a complete snapshot that will still be
    /// restarted. Zero for an incomplete snapshot.
    pub fn pending(&self, snapshot: &Snapshot) -> usize {
        if !snapshot.complete {
            return 0;
        }
        self.workers
            .iter()
            .filter(|(name, state)| !state.permanently_failed && !snapshot.contains(name))
            .count()
    }

    pub fn is_permanently_failed(&self, name: &str) -> bool {
        self.workers
            .get(name)
            .is_some_and(|w| w.permanently_failed)
    }

    pub fn failures(&self, name: &str) -> u32 {
        self.workers.get(name).map_or(0, |w| w.failures)
    }

    pub fn restarts_in_window(&self, name: &str) -> usize {
        self.workers.get(name).map_or(0, |w| w.restarts.len())
    }

    fn check(
        &mut self,
        name: &str,
        healthy: bool,
        worker: Option<&WorkerMetrics>,
        now: Instant,
    ) -> Assessment {
        let threshold = self.failure_threshold;
        let state = self.workers.entry(name.to_string()).or_default();

        if state.permanently_failed {
            return Assessment {
                name: name.to_string(),
                status: HealthStatus::Critical,
                failures: state.failures,
                action: HealthAction::None,
            };
        }

        if healthy {
            state.failures = 0;
        } else {
            state.failures = state.failures.saturating_add(1);
        }
        let status = HealthStatus::from_failures(state.failures, threshold);
        let failures = state.failures;

        let action = if status == HealthStatus::Critical {
            while state
                .restarts
                .front()
                .is_some_and(|at| now.duration_since(*at) >= self.restart_window)
            {
                state.restarts.pop_front();
            }

            if state.restarts.len() >= self.max_restarts as usize {
                error!(
                    worker = %name,
                    restarts = state.restarts.len(),
                    "Restart budget exhausted, marking permanently failed"
                );
                state.permanently_failed = true;
                HealthAction::GiveUp
            } else {
                warn!(worker = %name, failures, "Worker critical, restarting");
                state.restarts.push_back(now);
                state.failures = 0;
                HealthAction::Restart {
                    worker: worker.cloned(),
                }
            }
        } else {
            if status != HealthStatus::Healthy {
                debug!(worker = %name, failures, status = %status, "Worker failed health check");
            }
            HealthAction::None
        };

        Assessment {
            name: name.to_string(),
            status,
            failures,
            action,
        }
    }
}
