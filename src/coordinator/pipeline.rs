//! Test-gated git pipeline: branch, test, commit, pull request.

use std::sync::Arc;

use sha2::{Digest, Sha256};
use tracing::{error, info, warn};

use super::git::{GitOperationError, VersionControl};
use super::test_gate::TestRunner;
use super::{GitPipelineResult, PipelineOutcome};
use crate::metrics::MetricsCollector;

const BRANCH_PREFIX: &str = "task/";
const MAX_BRANCH_SUFFIX: usize = 60;

/// Pipeline switches.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub base_branch: String,
    pub test_gate_enabled: bool,
    pub pr_enabled: bool,
    pub auto_merge: bool,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            base_branch: "main".to_string(),
            test_gate_enabled: true,
            pr_enabled: true,
            auto_merge: false,
        }
    }
}

/// Deterministic branch name for a task.
///
/// Characters outside `[A-Za-z0-9._-]` become `-`; ids that sanitize to
/// nothing fall back to a hash so distinct ids keep distinct branches.
pub fn branch_name(task_id: &str) -> String {
    let mut suffix = String::with_capacity(task_id.len());
    for c in task_id.chars() {
        let c = if c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.' {
            c
        } else {
            '-'
        };
        // No runs of separators, and never "..".
        if (c == '-' || c == '.') && suffix.ends_with(['-', '.']) {
            continue;
        }
        suffix.push(c);
    }
    let mut suffix = suffix.trim_matches(['-', '.']).to_string();
    suffix.truncate(MAX_BRANCH_SUFFIX);
    while suffix.ends_with(".lock") || suffix.ends_with(['-', '.']) {
        suffix = suffix
            .trim_end_matches(".lock")
            .trim_end_matches(['-', '.'])
            .to_string();
    }

    if suffix.is_empty() {
        let digest = hex::encode(Sha256::digest(task_id.as_bytes()));
        suffix = digest[..12].to_string();
    }
    format!("{}{}", BRANCH_PREFIX, suffix)
}

/// Everything the pipeline needs to know about one task.
#[derive(Debug, Clone)]
pub struct PipelineRequest<'a> {
    pub task_id: &'a str,
    pub worker_id: &'a str,
    pub summary: &'a str,
    /// Repository-relative paths of the detected files.
    pub files: &'a [String],
}

/// Runs the branch/test/commit/PR sequence for one task.
pub struct GitPipeline {
    vcs: Arc<dyn VersionControl>,
    tests: Arc<dyn TestRunner>,
    settings: PipelineSettings,
    metrics: MetricsCollector,
}

impl GitPipeline {
    pub fn new(
        vcs: Arc<dyn VersionControl>,
        tests: Arc<dyn TestRunner>,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            vcs,
            tests,
            settings,
            metrics: MetricsCollector::new(),
        }
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    /// Runs the pipeline. Failures become outcomes, never errors: a partial
    /// git operation is not safe to retry.
    pub async fn run(&self, request: &PipelineRequest<'_>) -> GitPipelineResult {
        let branch = branch_name(request.task_id);
        let mut result = GitPipelineResult {
            task_id: request.task_id.to_string(),
            branch_name: branch.clone(),
            commit_sha: None,
            test_passed: true,
            pr_created: false,
            pr_url: None,
            outcome: PipelineOutcome::CommitFailed,
            error: None,
        };

        if let Err(e) = self.enter_branch(&branch).await {
            return self.fail(result, "branch", e).await;
        }

        if self.settings.test_gate_enabled {
            let report = self.tests.run(request.files).await;
            self.metrics.record_test_gate(report.duration.as_secs_f64());
            if !report.passed {
                result.test_passed = false;
                result.outcome = PipelineOutcome::TestBlocked;
                result.error = Some(report.reason());
                warn!(
                    task_id = %request.task_id,
                    branch = %branch,
                    timed_out = report.timed_out,
                    "Test gate failed, skipping commit"
                );
                let label = format!("fleet-forge: {} test-blocked", branch);
                if let Err(e) = self.vcs.stash(request.files, &label).await {
                    error!(task_id = %request.task_id, error = %e, "Failed to stash test-blocked changes");
                }
                self.return_to_base().await;
                return self.finish(result);
            }
        }

        let message = format!(
            "{}\n\nTask: {}\nWorker: {}",
            request.summary, request.task_id, request.worker_id
        );
        match self.vcs.commit(request.files, &message).await {
            Ok(sha) => {
                info!(task_id = %request.task_id, branch = %branch, sha = %sha, "Committed task changes");
                result.commit_sha = Some(sha);
            }
            Err(e) => return self.fail(result, "commit", e).await,
        }

        result.outcome = PipelineOutcome::PrOpen;
        if self.settings.pr_enabled {
            let body = format!(
                "Automated change for task `{}` produced by worker `{}`.\n\nFiles:\n{}",
                request.task_id,
                request.worker_id,
                request
                    .files
                    .iter()
                    .map(|f| format!("- `{}`", f))
                    .collect::<Vec<_>>()
                    .join("\n")
            );
            let opened = match self.vcs.push(&branch).await {
                Ok(()) => {
                    self.vcs
                        .open_pull_request(&branch, &self.settings.base_branch, request.summary, &body)
                        .await
                }
                Err(e) => Err(e),
            };
            match opened {
                Ok(url) => {
                    info!(task_id = %request.task_id, url = %url, "Opened pull request");
                    result.pr_created = true;
                    result.pr_url = Some(url);
                }
                Err(e) => return self.fail(result, "pull request", e).await,
            }

            if self.settings.auto_merge {
                match self.vcs.merge_pull_request(&branch).await {
                    Ok(()) => result.outcome = PipelineOutcome::Merged,
                    Err(e) => {
                        warn!(task_id = %request.task_id, error = %e, "Auto-merge failed, pull request left open");
                    }
                }
            }
        }

        self.return_to_base().await;
        self.finish(result)
    }

    /// Switches to the task branch; an existing branch is reused.
    async fn enter_branch(&self, branch: &str) -> Result<(), GitOperationError> {
        if self.vcs.branch_exists(branch).await? {
            info!(branch = %branch, "Branch already exists, reusing");
            self.vcs.checkout(branch).await
        } else {
            self.vcs.create_branch(branch).await
        }
    }

    async fn return_to_base(&self) {
        if let Err(e) = self.vcs.checkout(&self.settings.base_branch).await {
            error!(base = %self.settings.base_branch, error = %e, "Failed to return to base branch");
        }
    }

    async fn fail(
        &self,
        mut result: GitPipelineResult,
        step: &str,
        err: GitOperationError,
    ) -> GitPipelineResult {
        error!(
            task_id = %result.task_id,
            branch = %result.branch_name,
            step = step,
            error = %err,
            "Git operation failed, leaving branch for manual recovery"
        );
        result.outcome = PipelineOutcome::CommitFailed;
        result.error = Some(format!("{} failed: {}", step, err));
        self.return_to_base().await;
        self.finish(result)
    }

    fn finish(&self, result: GitPipelineResult) -> GitPipelineResult {
        self.metrics.record_pipeline(result.outcome.as_str());
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::test_gate::TestReport;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct FakeVcs {
        calls: Mutex<Vec<String>>,
        existing: Vec<String>,
        fail_on: Option<&'static str>,
    }

    impl FakeVcs {
        fn log(&self, call: String) -> Result<(), GitOperationError> {
            let failing = self.fail_on.is_some_and(|f| call.starts_with(f));
            self.calls.lock().unwrap().push(call.clone());
            if failing {
                Err(GitOperationError::CommandFailed {
                    command: call,
                    stderr: "simulated".into(),
                })
            } else {
                Ok(())
            }
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl VersionControl for FakeVcs {
        async fn branch_exists(&self, branch: &str) -> Result<bool, GitOperationError> {
            Ok(self.existing.iter().any(|b| b == branch))
        }
        async fn create_branch(&self, branch: &str) -> Result<(), GitOperationError> {
            self.log(format!("create {}", branch))
        }
        async fn checkout(&self, branch: &str) -> Result<(), GitOperationError> {
            self.log(format!("checkout {}", branch))
        }
        async fn commit(&self, files: &[String], _message: &str) -> Result<String, GitOperationError> {
            self.log(format!("commit {}", files.join(",")))?;
            Ok("abc123".into())
        }
        async fn stash(&self, files: &[String], message: &str) -> Result<(), GitOperationError> {
            self.log(format!("stash {} {}", files.join(","), message))
        }
        async fn push(&self, branch: &str) -> Result<(), GitOperationError> {
            self.log(format!("push {}", branch))
        }
        async fn open_pull_request(
            &self,
            branch: &str,
            base: &str,
            _title: &str,
            _body: &str,
        ) -> Result<String, GitOperationError> {
            self.log(format!("pr {} {}", branch, base))?;
            Ok("https://github.com/acme/repo/pull/7".into())
        }
        async fn merge_pull_request(&self, branch: &str) -> Result<(), GitOperationError> {
            self.log(format!("merge {}", branch))
        }
    }

    struct FixedTests(bool);

    #[async_trait]
    impl TestRunner for FixedTests {
        async fn run(&self, _files: &[String]) -> TestReport {
            TestReport {
                passed: self.0,
                timed_out: false,
                exit_code: Some(if self.0 { 0 } else { 1 }),
                output: String::new(),
                duration: Duration::from_millis(5),
            }
        }
    }

    fn pipeline(vcs: Arc<FakeVcs>, passes: bool, settings: PipelineSettings) -> GitPipeline {
        GitPipeline::new(vcs, Arc::new(FixedTests(passes)), settings)
    }

    fn request(files: &[String]) -> PipelineRequest<'_> {
        PipelineRequest {
            task_id: "t-1",
            worker_id: "worker-0",
            summary: "Add a",
            files,
        }
    }

    #[test]
    fn test_branch_name_is_deterministic_and_safe() {
        assert_eq!(branch_name("t-1"), "task/t-1");
        assert_eq!(branch_name("feat: add X/Y"), "task/feat-add-X-Y");
        assert_eq!(branch_name("a..b"), "task/a.b");
        assert_eq!(branch_name("name.lock"), "task/name");
        assert_eq!(branch_name("t-1"), branch_name("t-1"));

        let fallback = branch_name("///");
        assert!(fallback.starts_with("task/"));
        assert_eq!(fallback.len(), "task/".len() + 12);
        assert_ne!(branch_name("///"), branch_name("???"));
    }

    #[tokio::test]
    async fn test_passing_gate_commits_and_opens_pr() {
        let vcs = Arc::new(FakeVcs::default());
        let files = vec!["a.py".to_string()];

        let result = pipeline(vcs.clone(), true, PipelineSettings::default())
            .run(&request(&files))
            .await;

        assert_eq!(result.outcome, PipelineOutcome::PrOpen);
        assert_eq!(result.commit_sha.as_deref(), Some("abc123"));
        assert!(result.test_passed);
        assert!(result.pr_created);
        assert_eq!(
            vcs.calls(),
            vec![
                "create task/t-1",
                "commit a.py",
                "push task/t-1",
                "pr task/t-1 main",
                "checkout main",
            ]
        );
    }

    #[tokio::test]
    async fn test_failing_gate_blocks_commit() {
        let vcs = Arc::new(FakeVcs::default());
        let files = vec!["a.py".to_string()];

        let result = pipeline(vcs.clone(), false, PipelineSettings::default())
            .run(&request(&files))
            .await;

        assert_eq!(result.outcome, PipelineOutcome::TestBlocked);
        assert!(!result.test_passed);
        assert!(result.commit_sha.is_none());
        let calls = vcs.calls();
        assert!(!calls.iter().any(|c| c.starts_with("commit")));
        assert!(calls.contains(&"stash a.py fleet-forge: task/t-1 test-blocked".to_string()));
        assert_eq!(calls.last().map(String::as_str), Some("checkout main"));
    }

    #[tokio::test]
    async fn test_disabled_gate_skips_straight_to_commit() {
        let vcs = Arc::new(FakeVcs::default());
        let files = vec!["a.py".to_string()];
        let settings = PipelineSettings {
            test_gate_enabled: false,
            ..Default::default()
        };

        let result = pipeline(vcs, false, settings).run(&request(&files)).await;

        assert_eq!(result.outcome, PipelineOutcome::PrOpen);
        assert!(result.commit_sha.is_some());
    }

    #[tokio::test]
    async fn test_existing_branch_is_reused() {
        let vcs = Arc::new(FakeVcs {
            existing: vec!["task/t-1".into()],
            ..Default::default()
        });
        let files = vec!["a.py".to_string()];

        let result = pipeline(vcs.clone(), true, PipelineSettings::default())
            .run(&request(&files))
            .await;

        assert_eq!(result.outcome, PipelineOutcome::PrOpen);
        assert_eq!(vcs.calls()[0], "checkout task/t-1");
        assert!(!vcs.calls().iter().any(|c| c.starts_with("create")));
    }

    #[tokio::test]
    async fn test_commit_failure_is_terminal() {
        let vcs = Arc::new(FakeVcs {
            fail_on: Some("commit"),
            ..Default::default()
        });
        let files = vec!["a.py".to_string()];

        let result = pipeline(vcs.clone(), true, PipelineSettings::default())
            .run(&request(&files))
            .await;

        assert_eq!(result.outcome, PipelineOutcome::CommitFailed);
        assert!(result.error.as_deref().unwrap().starts_with("commit failed"));
        assert!(!vcs.calls().iter().any(|c| c.starts_with("push")));
    }

    #[tokio::test]
    async fn test_auto_merge_and_pr_disabled() {
        let vcs = Arc::new(FakeVcs::default());
        let files = vec!["a.py".to_string()];
        let merged = pipeline(
            vcs.clone(),
            true,
            PipelineSettings {
                auto_merge: true,
                ..Default::default()
            },
        )
        .run(&request(&files))
        .await;
        assert_eq!(merged.outcome, PipelineOutcome::Merged);

        let vcs = Arc::new(FakeVcs::default());
        let no_pr = pipeline(
            vcs.clone(),
            true,
            PipelineSettings {
                pr_enabled: false,
                ..Default::default()
            },
        )
        .run(&request(&files))
        .await;
        assert_eq!(no_pr.outcome, PipelineOutcome::PrOpen);
        assert!(!no_pr.pr_created);
        assert!(!vcs.calls().iter().any(|c| c.starts_with("push")));
    }
}
