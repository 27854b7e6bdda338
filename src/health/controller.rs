//! The health and scaling control loop.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::launcher::{ControllerError, StopMode, WorkerLauncher};
use super::probe::{Snapshot, WorkerProbe};
use super::scaling::{Autoscaler, ScalingAction, ScalingDecision};
use super::tracker::{HealthAction, HealthTracker};
use super::WorkerMetrics;
use crate::metrics::{self, MetricsCollector};
use crate::notify::{NotificationEvent, NotificationRouter};
use crate::queue::{Broker, TASK_INTAKE};

#[derive(Debug, Clone)]
pub struct ControllerSettings {
    pub interval: Duration,
    /// Queue whose depth drives scaling.
    pub queue: String,
    /// Prometheus textfile rewritten every cycle.
    pub metrics_file: Option<PathBuf>,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            queue: TASK_INTAKE.to_string(),
            metrics_file: None,
        }
    }
}

/// What one cycle saw and did.
#[derive(Debug, Clone, Default)]
pub struct CycleReport {
    pub snapshot_complete: bool,
    pub workers: usize,
    pub queue_depth: Option<usize>,
    pub decision: Option<ScalingDecision>,
    pub restarted: Vec<String>,
    pub given_up: Vec<String>,
    pub spawned: Vec<String>,
    pub stopped: Vec<String>,
    pub action_failures: usize,
}

pub struct HealthController {
    probe: Arc<dyn WorkerProbe>,
    launcher: Arc<dyn WorkerLauncher>,
    broker: Arc<dyn Broker>,
    notifier: Arc<NotificationRouter>,
    tracker: HealthTracker,
    autoscaler: Autoscaler,
    settings: ControllerSettings,
    metrics: MetricsCollector,
}

impl HealthController {
    pub fn new(
        probe: Arc<dyn WorkerProbe>,
        launcher: Arc<dyn WorkerLauncher>,
        broker: Arc<dyn Broker>,
        notifier: Arc<NotificationRouter>,
        tracker: HealthTracker,
        autoscaler: Autoscaler,
        settings: ControllerSettings,
    ) -> Self {
        Self {
            probe,
            launcher,
            broker,
            notifier,
            tracker,
            autoscaler,
            settings,
            metrics: MetricsCollector::new(),
        }
    }

    pub fn tracker(&self) -> &HealthTracker {
        &self.tracker
    }

    /// Runs cycles on the fixed interval until cancelled.
    pub async fn run(&mut self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.settings.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            interval_secs = self.settings.interval.as_secs(),
            queue = %self.settings.queue,
            "Health controller started"
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let report = self.cycle().await;
            debug!(
                workers = report.workers,
                complete = report.snapshot_complete,
                action = report.decision.as_ref().map(|d| d.action.as_str()).unwrap_or("skipped"),
                "Controller cycle finished"
            );
        }

        info!("Health controller stopped");
    }

    /// One poll/heal/scale pass. Never fails; action failures are counted.
    pub async fn cycle(&mut self) -> CycleReport {
        let mut report = CycleReport::default();
        let snapshot = self.probe.poll().await;
        let now = Instant::now();
        report.snapshot_complete = snapshot.complete;
        report.workers = snapshot.workers.len();
        self.metrics.set_active_workers(snapshot.workers.len());

        self.heal(&snapshot, now, &mut report).await;

        match self.broker.depth(&self.settings.queue).await {
            Ok(depth) => {
                self.metrics.set_queue_depth(&self.settings.queue, depth);
                report.queue_depth = Some(depth);
                if snapshot.complete {
                    self.scale(&snapshot, depth, now, &mut report).await;
                } else {
                    warn!(seen = snapshot.workers.len(), "Skipping scaling on incomplete snapshot");
                }
            }
            Err(e) => warn!(queue = %self.settings.queue, error = %e, "Queue depth unavailable, skipping scaling"),
        }

        if let Some(path) = &self.settings.metrics_file {
            if let Err(e) = metrics::write_textfile(path).await {
                warn!(path = %path.display(), error = %e, "Failed to write metrics file");
            }
        }

        report
    }

    async fn heal(&mut self, snapshot: &Snapshot, now: Instant, report: &mut CycleReport) {
        for assessment in self.tracker.observe(snapshot, now) {
            match assessment.action {
                HealthAction::None => {}
                HealthAction::Restart { worker } => {
                    match self.restart(&assessment.name, worker.as_ref()).await {
                        Ok(pid) => {
                            self.metrics.record_restart(&assessment.name);
                            report.restarted.push(assessment.name.clone());
                            self.notifier
                                .route(NotificationEvent::health(
                                    format!("restart:{}", assessment.name),
                                    format!("Worker {} restarted", assessment.name),
                                    format!(
                                        "Critical after consecutive failed checks; new pid {}",
                                        pid
                                    ),
                                ));
                        }
                        Err(e) => self.action_failed("restart", &assessment.name, &e, report),
                    }
                }
                HealthAction::GiveUp => {
                    report.given_up.push(assessment.name.clone());
                    self.notifier
                        .route(NotificationEvent::health(
                            format!("permanent:{}", assessment.name),
                            format!("Worker {} permanently failed", assessment.name),
                            "Restart budget exhausted within the rolling window; manual intervention required"
                                .to_string(),
                        ));
                }
            }
        }
    }

    async fn restart(
        &self,
        name: &str,
        worker: Option<&WorkerMetrics>,
    ) -> Result<u32, ControllerError> {
        if let Some(worker) = worker {
            if let Err(e) = self.launcher.stop(worker, StopMode::Hard).await {
                // The process may already be gone; starting a fresh one still helps.
                warn!(worker = %name, error = %e, "Hard stop before restart failed");
            }
        }
        self.launcher.spawn(name).await
    }

    async fn scale(
        &mut self,
        snapshot: &Snapshot,
        depth: usize,
        now: Instant,
        report: &mut CycleReport,
    ) {
        let live: Vec<WorkerMetrics> = snapshot
            .workers
            .iter()
            .filter(|w| !self.tracker.is_stopping(&w.name))
            .cloned()
            .collect();
        let pending = self.tracker.pending(snapshot);
        let decision = self.autoscaler.evaluate(&live, pending, depth, now);
        self.metrics.record_scaling(decision.action.as_str());

        match decision.action {
            ScalingAction::ScaleUp => {
                let count = decision.target_workers.saturating_sub(decision.current_workers);
                for _ in 0..count {
                    let id = new_worker_id();
                    match self.launcher.spawn(&id).await {
                        Ok(_) => report.spawned.push(id),
                        Err(e) => self.action_failed("scale_up", &id, &e, report),
                    }
                }
            }
            ScalingAction::ScaleDown => {
                let count = decision.current_workers.saturating_sub(decision.target_workers);
                let mut candidates: Vec<&WorkerMetrics> = live.iter().collect();
                candidates.sort_by(|a, b| a.cpu_percent.total_cmp(&b.cpu_percent));
                for worker in candidates.into_iter().take(count) {
                    match self.launcher.stop(worker, StopMode::Graceful).await {
                        Ok(()) => {
                            self.tracker.mark_stopping(&worker.name);
                            report.stopped.push(worker.name.clone());
                        }
                        Err(e) => self.action_failed("scale_down", &worker.name, &e, report),
                    }
                }
            }
            ScalingAction::Maintain | ScalingAction::Wait => {
                debug!(action = %decision.action, reason = %decision.reason, "No fleet change");
            }
        }

        if decision.action.changes_fleet() {
            info!(
                action = %decision.action,
                current = decision.current_workers,
                target = decision.target_workers,
                queue_length = decision.queue_length,
                reason = %decision.reason,
                "Scaling decision"
            );
            self.notifier
                .route(NotificationEvent::scaling(
                    format!("{}:{}", decision.action, decision.target_workers),
                    format!(
                        "Scaling {}: {} -> {} workers",
                        decision.action, decision.current_workers, decision.target_workers
                    ),
                    format!("{} (queue length {})", decision.reason, decision.queue_length),
                ));
        }
        report.decision = Some(decision);
    }

    fn action_failed(
        &self,
        action: &str,
        worker: &str,
        err: &ControllerError,
        report: &mut CycleReport,
    ) {
        error!(action = action, worker = %worker, error = %err, "Scaling action failed");
        report.action_failures += 1;
        self.notifier
            .route(NotificationEvent::error(
                format!("{}:{}", action, worker),
                format!("Failed to {} worker {}", action.replace('_', " "), worker),
                err.to_string(),
            ));
    }
}

fn new_worker_id() -> String {
    let id = Uuid::new_v4().simple().to_string();
    format!("worker-{}", &id[..8])
}
