//! The completion coordinator's state machine.

use std::collections::{HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use super::pipeline::{GitPipeline, PipelineRequest};
use super::snapshot::Baseline;
use super::state::{LedgerEntry, PersistedState};
use super::{CoordinatorError, CoordinatorState, GitPipelineResult, PipelineOutcome};
use crate::notify::{NotificationEvent, NotificationRouter};
use crate::queue::{
    Backoff, Broker, CompletionMessage, CompletionStatus, Disposition, Envelope, MessageHandler,
    ProcessingError, ResultRecord, TaskMessage, TASK_INTAKE, TASK_RESULTS,
};

/// Message ids remembered for redelivery detection.
const SEEN_CAPACITY: usize = 10_000;

/// Where the coordinator reads worker output and keeps its state.
#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    pub repo_path: PathBuf,
    /// Worker output directory, relative to the repository.
    pub output_dir: PathBuf,
    pub state_file: PathBuf,
    /// Forwarded ledger entries older than this are pruned.
    pub ledger_retention: Duration,
    /// Retry policy for publishes to `task.results` and `task.intake`.
    pub backoff: Backoff,
}

impl CoordinatorSettings {
    pub fn new(repo_path: impl Into<PathBuf>) -> Self {
        let repo_path = repo_path.into();
        Self {
            state_file: repo_path.join(".git").join("fleet-forge-state.json"),
            repo_path,
            output_dir: PathBuf::from("."),
            ledger_retention: Duration::from_secs(7 * 24 * 3600),
            backoff: Backoff::default(),
        }
    }

    pub fn with_ledger_retention(mut self, retention: Duration) -> Self {
        self.ledger_retention = retention;
        self
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_output_dir(mut self, output_dir: impl Into<PathBuf>) -> Self {
        self.output_dir = output_dir.into();
        self
    }

    pub fn with_state_file(mut self, state_file: impl Into<PathBuf>) -> Self {
        self.state_file = state_file.into();
        self
    }

    pub fn output_root(&self) -> PathBuf {
        self.repo_path.join(&self.output_dir)
    }

    /// Repository-relative path for a file relative to the output root.
    fn repo_relative(&self, file: &str) -> String {
        let joined = self.output_dir.join(file);
        let parts: Vec<String> = joined
            .components()
            .filter_map(|c| match c {
                std::path::Component::Normal(p) => Some(p.to_string_lossy().into_owned()),
                _ => None,
            })
            .collect();
        parts.join("/")
    }
}

/// Turns completion messages into result records, one at a time.
///
/// Owns the working tree exclusively; run exactly one instance per tree.
pub struct CompletionCoordinator {
    broker: Arc<dyn Broker>,
    pipeline: GitPipeline,
    notifier: Arc<NotificationRouter>,
    settings: CoordinatorSettings,
    baseline: Arc<Baseline>,
    state: PersistedState,
    seen: HashSet<String>,
    seen_order: VecDeque<String>,
}

impl CompletionCoordinator {
    /// Loads persisted state, or captures a fresh baseline on first start.
    pub async fn open(
        broker: Arc<dyn Broker>,
        pipeline: GitPipeline,
        notifier: Arc<NotificationRouter>,
        settings: CoordinatorSettings,
    ) -> Result<Self, CoordinatorError> {
        let root = settings.output_root();
        let (baseline, state) = match PersistedState::load(&settings.state_file).await? {
            Some(state) => {
                info!(
                    path = %settings.state_file.display(),
                    files = state.baseline.len(),
                    tasks = state.ledger.len(),
                    "Loaded coordinator state"
                );
                (Baseline::from_digests(root, state.baseline.clone()), state)
            }
            None => {
                let baseline = tokio::task::spawn_blocking(move || Baseline::capture(root)).await??;
                info!(files = baseline.len(), "Captured baseline snapshot");
                let state = PersistedState {
                    baseline: baseline.digests().clone(),
                    ..Default::default()
                };
                state.save(&settings.state_file).await?;
                (baseline, state)
            }
        };

        Ok(Self {
            broker,
            pipeline,
            notifier,
            settings,
            baseline: Arc::new(baseline),
            state,
            seen: HashSet::new(),
            seen_order: VecDeque::new(),
        })
    }

    /// Pipeline result recorded for a task, if it reached the pipeline.
    pub fn pipeline_result(&self, task_id: &str) -> Option<&GitPipelineResult> {
        self.state.ledger.get(task_id).map(|entry| &entry.result)
    }

    /// Handles one completion and returns the record for it.
    ///
    /// The record is forwarded to `task.results` unless an earlier delivery
    /// of the same task already forwarded its pipeline result.
    pub async fn handle_completion(
        &mut self,
        msg: &CompletionMessage,
    ) -> Result<ResultRecord, CoordinatorError> {
        debug!(task_id = %msg.task_id, status = %msg.status, worker = %msg.worker_id, "Handling completion");

        match msg.status {
            CompletionStatus::Completed => self.handle_completed(msg).await,
            CompletionStatus::Failed => {
                let error = msg
                    .error
                    .clone()
                    .unwrap_or_else(|| "worker reported failure".to_string());
                warn!(task_id = %msg.task_id, worker = %msg.worker_id, error = %error, "Task failed");
                let record = self.record(msg, CoordinatorState::ErrorForwarded, Vec::new(), None);
                self.forward(&record).await?;
                self.notifier
                    .route(NotificationEvent::error(
                        format!("task-error:{}", msg.task_id),
                        format!("Task {} failed", msg.task_id),
                        format!("Worker {}: {}", msg.worker_id, error),
                    ));
                Ok(record)
            }
            CompletionStatus::NeedInfo => {
                let record =
                    self.record(msg, CoordinatorState::AwaitingUserInput, Vec::new(), None);
                self.forward(&record).await?;
                self.notifier
                    .route(NotificationEvent::task_completion(
                        format!("need-info:{}", msg.task_id),
                        format!("Task {} needs input", msg.task_id),
                        msg.response.clone(),
                    ));
                Ok(record)
            }
            CompletionStatus::Progress => self.handle_progress(msg).await,
        }
    }

    async fn handle_completed(
        &mut self,
        msg: &CompletionMessage,
    ) -> Result<ResultRecord, CoordinatorError> {
        if let Some(entry) = self.state.ledger.get(&msg.task_id).cloned() {
            let record = self.record(
                msg,
                entry.result.state(),
                Vec::new(),
                Some(entry.result.clone()),
            );
            if entry.forwarded {
                info!(task_id = %msg.task_id, "Pipeline already ran and was forwarded, skipping");
            } else {
                self.forward(&record).await?;
                self.mark_forwarded(&msg.task_id).await?;
                self.notify_pipeline(msg, &entry.result);
            }
            return Ok(record);
        }

        let baseline = Arc::clone(&self.baseline);
        let claimed = msg.files_created.clone();
        let detected = tokio::task::spawn_blocking(move || baseline.detect(&claimed)).await?;
        if detected.is_empty() {
            info!(
                task_id = %msg.task_id,
                claimed = msg.files_created.len(),
                "No new files, forwarding as noop"
            );
            let record = self.record(msg, CoordinatorState::NoopForwarded, Vec::new(), None);
            self.forward(&record).await?;
            self.notifier
                .route(NotificationEvent::task_completion(
                    format!("task:{}", msg.task_id),
                    format!("Task {} completed", msg.task_id),
                    "Completed without file changes".to_string(),
                ));
            return Ok(record);
        }

        let files: Vec<String> = detected
            .iter()
            .map(|f| self.settings.repo_relative(f))
            .collect();
        let summary = msg.summary();
        let result = self
            .pipeline
            .run(&PipelineRequest {
                task_id: &msg.task_id,
                worker_id: &msg.worker_id,
                summary: &summary,
                files: &files,
            })
            .await;

        info!(
            task_id = %msg.task_id,
            branch = %result.branch_name,
            outcome = %result.outcome,
            "Git pipeline finished"
        );

        // Record before forwarding so a redelivery never reruns the pipeline.
        let baseline = Arc::clone(&self.baseline);
        let current = tokio::task::spawn_blocking(move || baseline.current(&detected)).await?;
        let baseline = Arc::make_mut(&mut self.baseline);
        baseline.absorb(current);
        self.state.baseline = baseline.digests().clone();
        self.state.ledger.insert(
            msg.task_id.clone(),
            LedgerEntry {
                result: result.clone(),
                forwarded: false,
                recorded_at: Utc::now(),
            },
        );
        self.prune_ledger();
        self.state.save(&self.settings.state_file).await?;

        let record = self.record(msg, result.state(), files, Some(result.clone()));
        self.forward(&record).await?;
        self.mark_forwarded(&msg.task_id).await?;
        self.notify_pipeline(msg, &result);
        Ok(record)
    }

    async fn handle_progress(
        &mut self,
        msg: &CompletionMessage,
    ) -> Result<ResultRecord, CoordinatorError> {
        let progress = msg.progress.unwrap_or(0);
        let next = msg
            .next_instruction
            .as_deref()
            .filter(|s| !s.trim().is_empty());

        let Some(instruction) = next.filter(|_| progress < 100) else {
            debug!(task_id = %msg.task_id, progress, "Progress report with nothing to dispatch");
            let record = self.record(msg, CoordinatorState::NoopForwarded, Vec::new(), None);
            self.forward(&record).await?;
            return Ok(record);
        };

        let task = TaskMessage::new(&msg.task_id, &msg.task_type, instruction)
            .with_context("continuation", Value::Bool(true))
            .with_context("progress", Value::from(progress))
            .with_context("previous_worker", Value::from(msg.worker_id.clone()));
        self.publish(TASK_INTAKE, Envelope::new(task).to_json()?)
            .await?;
        info!(task_id = %msg.task_id, progress, "Dispatched next instruction");

        let record = self.record(
            msg,
            CoordinatorState::NextInstructionDispatched,
            Vec::new(),
            None,
        );
        self.forward(&record).await?;
        self.notifier
            .route(NotificationEvent::task_completion(
                format!("progress:{}:{}", msg.task_id, progress),
                format!("Task {} at {}%", msg.task_id, progress),
                format!("Next: {}", instruction),
            ));
        Ok(record)
    }

    fn record(
        &self,
        msg: &CompletionMessage,
        state: CoordinatorState,
        files: Vec<String>,
        git: Option<GitPipelineResult>,
    ) -> ResultRecord {
        let error = match (&git, msg.status) {
            (Some(result), _) => result.error.clone(),
            (None, CompletionStatus::Failed) => msg.error.clone(),
            (None, _) => None,
        };
        ResultRecord {
            task_id: msg.task_id.clone(),
            task_type: msg.task_type.clone(),
            worker_id: msg.worker_id.clone(),
            status: msg.status,
            state,
            files,
            git,
            error,
            output_file: msg.output_file.clone(),
            duration: msg.duration,
            forwarded_at: Utc::now(),
        }
    }

    async fn forward(&self, record: &ResultRecord) -> Result<(), CoordinatorError> {
        self.publish(TASK_RESULTS, Envelope::new(record).to_json()?)
            .await?;
        debug!(task_id = %record.task_id, state = %record.state, "Forwarded result");
        Ok(())
    }

    async fn publish(&self, queue: &str, payload: String) -> Result<(), CoordinatorError> {
        self.settings
            .backoff
            .retry("publish", || self.broker.publish(queue, &payload))
            .await?;
        Ok(())
    }

    fn prune_ledger(&mut self) {
        let cutoff = chrono::Duration::from_std(self.settings.ledger_retention)
            .ok()
            .and_then(|retention| Utc::now().checked_sub_signed(retention));
        let Some(cutoff) = cutoff else {
            return;
        };
        let pruned = self.state.prune(cutoff);
        if pruned > 0 {
            debug!(pruned, "Pruned forwarded ledger entries past retention");
        }
    }

    async fn mark_forwarded(&mut self, task_id: &str) -> Result<(), CoordinatorError> {
        if let Some(entry) = self.state.ledger.get_mut(task_id) {
            entry.forwarded = true;
            self.state.save(&self.settings.state_file).await?;
        }
        Ok(())
    }

    fn notify_pipeline(&self, msg: &CompletionMessage, result: &GitPipelineResult) {
        let key = format!("task:{}", msg.task_id);
        let event = match result.outcome {
            PipelineOutcome::Merged | PipelineOutcome::PrOpen => {
                let mut body = format!(
                    "Branch {} at {}",
                    result.branch_name,
                    result.commit_sha.as_deref().unwrap_or("unknown")
                );
                if let Some(url) = &result.pr_url {
                    body.push_str(&format!("\nPull request: {}", url));
                }
                if result.outcome == PipelineOutcome::Merged {
                    body.push_str("\nMerged");
                }
                NotificationEvent::task_completion(key, format!("Task {} landed", msg.task_id), body)
            }
            PipelineOutcome::TestBlocked => NotificationEvent::task_completion(
                key,
                format!("Task {} failed: tests blocked commit", msg.task_id),
                format!(
                    "Branch {}: {}",
                    result.branch_name,
                    result.error.as_deref().unwrap_or("tests failed")
                ),
            ),
            PipelineOutcome::CommitFailed => NotificationEvent::error(
                format!("git:{}", msg.task_id),
                format!("Git pipeline failed for task {}", msg.task_id),
                format!(
                    "Branch {} left for manual recovery: {}",
                    result.branch_name,
                    result.error.as_deref().unwrap_or("unknown error")
                ),
            ),
        };
        self.notifier.route(event);
    }

    fn remember(&mut self, key: String) {
        if self.seen.insert(key.clone()) {
            self.seen_order.push_back(key);
            while self.seen_order.len() > SEEN_CAPACITY {
                if let Some(old) = self.seen_order.pop_front() {
                    self.seen.remove(&old);
                }
            }
        }
    }
}

/// Identity of a delivery: its `message_id`, or the body hash when the
/// publisher did not set one.
fn message_key(value: &Value, payload: &str) -> String {
    match value.get("message_id").and_then(Value::as_str) {
        Some(id) => id.to_string(),
        None => hex::encode(Sha256::digest(payload.as_bytes())),
    }
}

#[async_trait]
impl MessageHandler for CompletionCoordinator {
    async fn handle(&mut self, payload: &str) -> Result<Disposition, ProcessingError> {
        let value: Value =
            serde_json::from_str(payload).map_err(|e| ProcessingError::Malformed(e.to_string()))?;
        let key = message_key(&value, payload);
        if self.seen.contains(&key) {
            debug!(message_id = %key, "Duplicate delivery, acknowledging");
            return Ok(Disposition::Ack);
        }

        let envelope: Envelope<CompletionMessage> =
            serde_json::from_value(value).map_err(|e| ProcessingError::Schema(e.to_string()))?;
        if envelope.retry_count > 0 {
            info!(
                task_id = %envelope.body.task_id,
                retry_count = envelope.retry_count,
                "Reprocessing redelivered completion"
            );
        }

        self.handle_completion(&envelope.body)
            .await
            .map_err(|e| ProcessingError::Handler(e.to_string()))?;
        self.remember(key);
        Ok(Disposition::Ack)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::git::{GitOperationError, VersionControl};
    use crate::coordinator::pipeline::PipelineSettings;
    use crate::coordinator::test_gate::{TestReport, TestRunner};
    use crate::notify::ChannelMap;
    use crate::queue::MemoryBroker;
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct CountingVcs {
        branches: Mutex<Vec<String>>,
        commits: Mutex<u32>,
    }

    #[async_trait]
    impl VersionControl for CountingVcs {
        async fn branch_exists(&self, branch: &str) -> Result<bool, GitOperationError> {
            Ok(self.branches.lock().unwrap().iter().any(|b| b == branch))
        }
        async fn create_branch(&self, branch: &str) -> Result<(), GitOperationError> {
            self.branches.lock().unwrap().push(branch.to_string());
            Ok(())
        }
        async fn checkout(&self, _branch: &str) -> Result<(), GitOperationError> {
            Ok(())
        }
        async fn commit(&self, _files: &[String], _message: &str) -> Result<String, GitOperationError> {
            *self.commits.lock().unwrap() += 1;
            Ok("cafe".into())
        }
        async fn stash(&self, _files: &[String], _message: &str) -> Result<(), GitOperationError> {
            Ok(())
        }
        async fn push(&self, _branch: &str) -> Result<(), GitOperationError> {
            Ok(())
        }
        async fn open_pull_request(
            &self,
            _branch: &str,
            _base: &str,
            _title: &str,
            _body: &str,
        ) -> Result<String, GitOperationError> {
            Ok("https://example.com/pr/1".into())
        }
        async fn merge_pull_request(&self, _branch: &str) -> Result<(), GitOperationError> {
            Ok(())
        }
    }

    struct Passes;

    #[async_trait]
    impl TestRunner for Passes {
        async fn run(&self, _files: &[String]) -> TestReport {
            TestReport {
                passed: true,
                timed_out: false,
                exit_code: Some(0),
                output: String::new(),
                duration: Duration::ZERO,
            }
        }
    }

    async fn coordinator(
        dir: &std::path::Path,
        vcs: Arc<CountingVcs>,
    ) -> (Arc<MemoryBroker>, CompletionCoordinator) {
        let settings = CoordinatorSettings::new(dir).with_state_file(dir.join("state.json"));
        open_with(vcs, settings).await
    }

    async fn open_with(
        vcs: Arc<CountingVcs>,
        settings: CoordinatorSettings,
    ) -> (Arc<MemoryBroker>, CompletionCoordinator) {
        let broker = Arc::new(MemoryBroker::new());
        for queue in [TASK_INTAKE, TASK_RESULTS] {
            broker.declare(queue, true).await.unwrap();
        }
        let pipeline = GitPipeline::new(vcs, Arc::new(Passes), PipelineSettings::default());
        let notifier = Arc::new(NotificationRouter::new(ChannelMap::default()));
        let coordinator = CompletionCoordinator::open(broker.clone(), pipeline, notifier, settings)
            .await
            .unwrap();
        (broker, coordinator)
    }

    #[test]
    fn test_repo_relative_paths() {
        let settings = CoordinatorSettings::new("/repo").with_output_dir("generated");
        assert_eq!(settings.repo_relative("a/b.py"), "generated/a/b.py");
        let settings = CoordinatorSettings::new("/repo");
        assert_eq!(settings.repo_relative("b.py"), "b.py");
    }

    #[test]
    fn test_message_key_prefers_message_id() {
        let value: Value = serde_json::from_str(r#"{"message_id":"m-1"}"#).unwrap();
        assert_eq!(message_key(&value, "ignored"), "m-1");

        let value: Value = serde_json::from_str(r#"{"task_id":"t"}"#).unwrap();
        assert_eq!(message_key(&value, "a"), message_key(&value, "a"));
        assert_ne!(message_key(&value, "a"), message_key(&value, "b"));
    }

    #[tokio::test]
    async fn test_completed_with_new_file_opens_pr() {
        let dir = tempfile::tempdir().unwrap();
        let vcs = Arc::new(CountingVcs::default());
        let (broker, mut coordinator) = coordinator(dir.path(), vcs.clone()).await;
        std::fs::write(dir.path().join("a.py"), "print('a')\n").unwrap();

        let msg = CompletionMessage::new("t-1", "code", CompletionStatus::Completed, "w-0")
            .with_files(vec!["a.py".into()]);
        let record = coordinator.handle_completion(&msg).await.unwrap();

        assert_eq!(record.state, CoordinatorState::PrOpened);
        assert_eq!(record.files, vec!["a.py"]);
        assert_eq!(*vcs.commits.lock().unwrap(), 1);
        assert_eq!(broker.depth(TASK_RESULTS).await.unwrap(), 1);
        assert!(coordinator.pipeline_result("t-1").is_some());
    }

    #[tokio::test]
    async fn test_failed_status_forwards_error() {
        let dir = tempfile::tempdir().unwrap();
        let (broker, mut coordinator) =
            coordinator(dir.path(), Arc::new(CountingVcs::default())).await;

        let msg = CompletionMessage::new("t-2", "code", CompletionStatus::Failed, "w-0")
            .with_error("segfault");
        let record = coordinator.handle_completion(&msg).await.unwrap();

        assert_eq!(record.state, CoordinatorState::ErrorForwarded);
        assert_eq!(record.error.as_deref(), Some("segfault"));
        assert_eq!(broker.depth(TASK_RESULTS).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_progress_dispatches_follow_up_task() {
        let dir = tempfile::tempdir().unwrap();
        let (broker, mut coordinator) =
            coordinator(dir.path(), Arc::new(CountingVcs::default())).await;

        let msg = CompletionMessage::new("t-3", "code", CompletionStatus::Progress, "w-0")
            .with_progress(40, Some("write the tests".into()));
        let record = coordinator.handle_completion(&msg).await.unwrap();
        assert_eq!(record.state, CoordinatorState::NextInstructionDispatched);

        let intake = broker.drain(TASK_INTAKE).await;
        assert_eq!(intake.len(), 1);
        let task: Envelope<TaskMessage> = serde_json::from_str(&intake[0]).unwrap();
        assert_eq!(task.body.task_id, "t-3");
        assert_eq!(task.body.instruction, "write the tests");
        assert_eq!(task.body.context["continuation"], Value::Bool(true));
    }

    #[tokio::test]
    async fn test_full_progress_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let (broker, mut coordinator) =
            coordinator(dir.path(), Arc::new(CountingVcs::default())).await;

        let msg = CompletionMessage::new("t-4", "code", CompletionStatus::Progress, "w-0")
            .with_progress(100, Some("done".into()));
        let record = coordinator.handle_completion(&msg).await.unwrap();

        assert_eq!(record.state, CoordinatorState::NoopForwarded);
        assert_eq!(broker.depth(TASK_INTAKE).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_need_info_awaits_user() {
        let dir = tempfile::tempdir().unwrap();
        let (_broker, mut coordinator) =
            coordinator(dir.path(), Arc::new(CountingVcs::default())).await;

        let msg = CompletionMessage::new("t-5", "code", CompletionStatus::NeedInfo, "w-0")
            .with_response("Which database should I target?");
        let record = coordinator.handle_completion(&msg).await.unwrap();

        assert_eq!(record.state, CoordinatorState::AwaitingUserInput);
    }

    #[tokio::test]
    async fn test_duplicate_message_id_is_acked_without_reprocessing() {
        let dir = tempfile::tempdir().unwrap();
        let (broker, mut coordinator) =
            coordinator(dir.path(), Arc::new(CountingVcs::default())).await;

        let msg = CompletionMessage::new("t-6", "code", CompletionStatus::Failed, "w-0");
        let payload = Envelope::new(msg).to_json().unwrap();

        assert_eq!(coordinator.handle(&payload).await.unwrap(), Disposition::Ack);
        assert_eq!(coordinator.handle(&payload).await.unwrap(), Disposition::Ack);
        assert_eq!(broker.depth(TASK_RESULTS).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_schema_mismatch_is_processing_error() {
        let dir = tempfile::tempdir().unwrap();
        let (_broker, mut coordinator) =
            coordinator(dir.path(), Arc::new(CountingVcs::default())).await;

        let err = coordinator.handle(r#"{"task_id":"t"}"#).await.unwrap_err();
        assert!(matches!(err, ProcessingError::Schema(_)));

        let err = coordinator.handle("{oops").await.unwrap_err();
        assert!(matches!(err, ProcessingError::Malformed(_)));
    }

    #[tokio::test]
    async fn test_restart_keeps_ledger() {
        let dir = tempfile::tempdir().unwrap();
        let vcs = Arc::new(CountingVcs::default());
        std::fs::write(dir.path().join("a.py"), "x\n").unwrap();
        {
            // First capture sees a.py; write a new file afterwards.
            let (_b, _c) = coordinator(dir.path(), vcs.clone()).await;
        }
        std::fs::write(dir.path().join("b.py"), "y\n").unwrap();

        let (_broker, mut restarted) = coordinator(dir.path(), vcs.clone()).await;
        let msg = CompletionMessage::new("t-7", "code", CompletionStatus::Completed, "w-0")
            .with_files(vec!["a.py".into(), "b.py".into()]);
        let record = restarted.handle_completion(&msg).await.unwrap();
        assert_eq!(record.files, vec!["b.py"]);

        let (broker, mut again) = coordinator(dir.path(), vcs.clone()).await;
        let record = again.handle_completion(&msg).await.unwrap();
        assert_eq!(record.state, CoordinatorState::PrOpened);
        assert_eq!(*vcs.commits.lock().unwrap(), 1);
        assert_eq!(broker.depth(TASK_RESULTS).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_forwarded_entries_pruned_past_retention() {
        let dir = tempfile::tempdir().unwrap();
        let vcs = Arc::new(CountingVcs::default());
        let settings = CoordinatorSettings::new(dir.path())
            .with_state_file(dir.path().join("state.json"))
            .with_ledger_retention(Duration::ZERO);
        let (_broker, mut coordinator) = open_with(vcs, settings).await;

        std::fs::write(dir.path().join("a.py"), "a\n").unwrap();
        let first = CompletionMessage::new("t-8", "code", CompletionStatus::Completed, "w-0")
            .with_files(vec!["a.py".into()]);
        coordinator.handle_completion(&first).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        std::fs::write(dir.path().join("b.py"), "b\n").unwrap();
        let second = CompletionMessage::new("t-9", "code", CompletionStatus::Completed, "w-0")
            .with_files(vec!["b.py".into()]);
        coordinator.handle_completion(&second).await.unwrap();

        assert!(coordinator.pipeline_result("t-8").is_none());
        assert!(coordinator.pipeline_result("t-9").is_some());
        let saved = PersistedState::load(&dir.path().join("state.json"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(saved.ledger.keys().collect::<Vec<_>>(), vec!["t-9"]);
    }
}
