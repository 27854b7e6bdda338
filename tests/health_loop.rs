//! Health controller cycles against a scripted process table.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use fleet_forge::health::{
    Autoscaler, ControllerError, ControllerSettings, HealthController, HealthThresholds,
    HealthTracker, ScalingAction, ScalingPolicy, Snapshot, StopMode, WorkerLauncher,
    WorkerMetrics, WorkerProbe, WorkerStatus,
};
use fleet_forge::notify::{
    Category, ChannelMap, NotificationEvent, NotificationRouter, NotificationSink, NotifyError,
};
use fleet_forge::queue::{Broker, MemoryBroker, TASK_INTAKE};

/// Replays snapshots in order, then repeats the last one.
struct ScriptedProbe(Mutex<VecDeque<Snapshot>>);

#[async_trait]
impl WorkerProbe for ScriptedProbe {
    async fn poll(&self) -> Snapshot {
        let mut script = self.0.lock().unwrap();
        if script.len() > 1 {
            script.pop_front().unwrap_or_default()
        } else {
            script.front().cloned().unwrap_or_default()
        }
    }
}

#[derive(Default)]
struct RecordingLauncher {
    spawned: Mutex<Vec<String>>,
    stopped: Mutex<Vec<(String, StopMode)>>,
}

#[async_trait]
impl WorkerLauncher for RecordingLauncher {
    async fn spawn(&self, worker_id: &str) -> Result<u32, ControllerError> {
        self.spawned.lock().unwrap().push(worker_id.to_string());
        Ok(1000)
    }

    async fn stop(&self, worker: &WorkerMetrics, mode: StopMode) -> Result<(), ControllerError> {
        self.stopped.lock().unwrap().push((worker.name.clone(), mode));
        Ok(())
    }
}

#[derive(Default)]
struct RecordingSink(Mutex<Vec<NotificationEvent>>);

#[async_trait]
impl NotificationSink for RecordingSink {
    async fn deliver(&self, _channel: &str, event: &NotificationEvent) -> Result<(), NotifyError> {
        self.0.lock().unwrap().push(event.clone());
        Ok(())
    }
}

fn worker(name: &str, memory_mb: f64, cpu_percent: f32) -> WorkerMetrics {
    WorkerMetrics {
        name: name.into(),
        pid: 100,
        memory_mb,
        cpu_percent,
        status: WorkerStatus::Running,
        timestamp: Utc::now(),
    }
}

struct Harness {
    controller: HealthController,
    launcher: Arc<RecordingLauncher>,
    notifier: Arc<NotificationRouter>,
    sink: Arc<RecordingSink>,
}

async fn harness(snapshots: Vec<Snapshot>, queued: usize, policy: ScalingPolicy) -> Harness {
    let broker = Arc::new(MemoryBroker::new());
    broker.declare(TASK_INTAKE, true).await.unwrap();
    for i in 0..queued {
        broker
            .publish(TASK_INTAKE, &format!("{{\"task_id\":\"t-{i}\"}}"))
            .await
            .unwrap();
    }

    let launcher = Arc::new(RecordingLauncher::default());
    let sink = Arc::new(RecordingSink::default());
    let notifier = Arc::new(NotificationRouter::with_sink(ChannelMap::default(), sink.clone()));
    let controller = HealthController::new(
        Arc::new(ScriptedProbe(Mutex::new(snapshots.into()))),
        launcher.clone(),
        broker,
        notifier.clone(),
        HealthTracker::new(3, 10, Duration::from_secs(3600), HealthThresholds::default()),
        Autoscaler::new(policy),
        ControllerSettings::default(),
    );

    Harness {
        controller,
        launcher,
        notifier,
        sink,
    }
}

async fn scaling_events(h: &Harness) -> Vec<NotificationEvent> {
    h.notifier.flush().await;
    h.sink
        .0
        .lock()
        .unwrap()
        .iter()
        .filter(|e| e.category == Category::Scaling)
        .cloned()
        .collect()
}

#[tokio::test(start_paused = true)]
async fn test_cooldown_holds_fleet_between_changes() {
    let pool = Snapshot::complete(vec![
        worker("w1", 200.0, 60.0),
        worker("w2", 200.0, 60.0),
        worker("w3", 200.0, 60.0),
    ]);
    let mut h = harness(vec![pool], 120, ScalingPolicy::default()).await;

    let first = h.controller.cycle().await;
    assert_eq!(first.decision.unwrap().action, ScalingAction::ScaleUp);
    assert_eq!(first.spawned.len(), 3);

    let second = h.controller.cycle().await;
    assert_eq!(second.decision.unwrap().action, ScalingAction::Wait);
    assert!(second.spawned.is_empty());

    tokio::time::advance(Duration::from_secs(61)).await;
    let third = h.controller.cycle().await;
    assert_eq!(third.decision.unwrap().action, ScalingAction::ScaleUp);

    assert_eq!(h.launcher.spawned.lock().unwrap().len(), 6);
    // Same action and target inside the dedup window: one notification.
    let events = scaling_events(&h).await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].key, "scale_up:6");
}

#[tokio::test(start_paused = true)]
async fn test_critical_worker_restarted_once_and_notified() {
    let bloated = Snapshot::complete(vec![worker("w1", 8_000.0, 30.0)]);
    let mut h = harness(vec![bloated], 0, ScalingPolicy::default()).await;

    let mut restarted = Vec::new();
    for _ in 0..3 {
        restarted.extend(h.controller.cycle().await.restarted);
    }

    assert_eq!(restarted, vec!["w1".to_string()]);
    assert_eq!(h.controller.tracker().failures("w1"), 0);
    assert_eq!(
        *h.launcher.stopped.lock().unwrap(),
        vec![("w1".to_string(), StopMode::Hard)]
    );
    h.notifier.flush().await;
    let health: Vec<String> = h
        .sink
        .0
        .lock()
        .unwrap()
        .iter()
        .filter(|e| e.category == Category::Health)
        .map(|e| e.key.clone())
        .collect();
    assert_eq!(health, vec!["restart:w1".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn test_vanished_worker_is_respawned_under_its_identity() {
    let present = Snapshot::complete(vec![worker("w7", 200.0, 40.0)]);
    let gone = Snapshot::complete(Vec::new());
    let mut h = harness(vec![present, gone], 0, ScalingPolicy::default()).await;

    h.controller.cycle().await;
    let mut restarted = Vec::new();
    for _ in 0..3 {
        restarted.extend(h.controller.cycle().await.restarted);
    }

    assert_eq!(restarted, vec!["w7".to_string()]);
    assert!(h.launcher.stopped.lock().unwrap().is_empty());
    // The pending restart counts toward the minimum, so no fresh worker joins.
    assert_eq!(*h.launcher.spawned.lock().unwrap(), vec!["w7".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn test_crash_in_minimum_pool_spawns_only_the_replacement() {
    let pool = Snapshot::complete(vec![
        worker("w1", 200.0, 40.0),
        worker("w2", 200.0, 40.0),
        worker("w3", 200.0, 40.0),
    ]);
    let crashed = Snapshot::complete(vec![worker("w1", 200.0, 40.0), worker("w3", 200.0, 40.0)]);
    let policy = ScalingPolicy {
        min_workers: 3,
        ..Default::default()
    };
    let mut h = harness(vec![pool, crashed], 0, policy).await;

    for _ in 0..6 {
        h.controller.cycle().await;
    }

    assert_eq!(*h.launcher.spawned.lock().unwrap(), vec!["w2".to_string()]);
    assert!(scaling_events(&h).await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_scaled_down_workers_drain_without_restart() {
    let idle = Snapshot::complete(vec![
        worker("w1", 200.0, 40.0),
        worker("w2", 200.0, 0.5),
        worker("w3", 200.0, 0.5),
    ]);
    let exited = Snapshot::complete(vec![worker("w1", 200.0, 40.0), worker("w3", 200.0, 0.5)]);
    let policy = ScalingPolicy {
        idle_grace: Duration::from_secs(30),
        ..Default::default()
    };
    // Grace starts, scale-down, two polls while w2 drains, then it exits.
    let mut h = harness(vec![idle.clone(), idle.clone(), idle.clone(), idle, exited], 0, policy).await;

    h.controller.cycle().await;
    tokio::time::advance(Duration::from_secs(31)).await;
    let report = h.controller.cycle().await;
    assert_eq!(report.decision.unwrap().action, ScalingAction::ScaleDown);
    assert_eq!(report.stopped, vec!["w2".to_string()]);

    let mut restarted = Vec::new();
    for _ in 0..6 {
        restarted.extend(h.controller.cycle().await.restarted);
    }

    assert!(restarted.is_empty());
    assert!(h.launcher.spawned.lock().unwrap().is_empty());
    assert_eq!(
        *h.launcher.stopped.lock().unwrap(),
        vec![("w2".to_string(), StopMode::Graceful)]
    );
}
