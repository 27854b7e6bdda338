//! Completion coordinator: the single writer of the shared working tree.
//!
//! Completion messages are consumed one at a time (prefetch 1). Files a worker
//! reports are checked against a persisted baseline snapshot; when any are
//! genuinely new the test-gated git pipeline runs at most once per task, and an
//! enriched result record is forwarded to `task.results`.

pub mod completion;
pub mod git;
pub mod pipeline;
pub mod snapshot;
pub mod state;
pub mod test_gate;

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::queue::QueueError;

pub use completion::{CompletionCoordinator, CoordinatorSettings};
pub use git::{GitCli, GitOperationError, VersionControl};
pub use pipeline::{branch_name, GitPipeline, PipelineSettings};
pub use snapshot::Baseline;
pub use state::{LedgerEntry, PersistedState};
pub use test_gate::{CommandTestRunner, TestReport, TestRunner};

/// Terminal state reached for one completion message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoordinatorState {
    /// Completed without any new files.
    NoopForwarded,
    /// The worker reported a failure.
    ErrorForwarded,
    /// The worker asked a question; a follow-up task continues the work.
    AwaitingUserInput,
    /// A follow-up task was published to the intake queue.
    NextInstructionDispatched,
    /// Changes committed and a pull request opened (or merged).
    PrOpened,
    /// The test gate failed; nothing was committed.
    TestFailed,
    /// Branch, commit or pull request creation failed.
    CommitFailed,
}

impl CoordinatorState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CoordinatorState::NoopForwarded => "noop_forwarded",
            CoordinatorState::ErrorForwarded => "error_forwarded",
            CoordinatorState::AwaitingUserInput => "awaiting_user_input",
            CoordinatorState::NextInstructionDispatched => "next_instruction_dispatched",
            CoordinatorState::PrOpened => "pr_opened",
            CoordinatorState::TestFailed => "test_failed",
            CoordinatorState::CommitFailed => "commit_failed",
        }
    }
}

impl fmt::Display for CoordinatorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a git pipeline run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineOutcome {
    Merged,
    PrOpen,
    TestBlocked,
    CommitFailed,
}

impl PipelineOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineOutcome::Merged => "merged",
            PipelineOutcome::PrOpen => "pr_open",
            PipelineOutcome::TestBlocked => "test_blocked",
            PipelineOutcome::CommitFailed => "commit_failed",
        }
    }
}

impl fmt::Display for PipelineOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of the one git pipeline run a task is allowed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GitPipelineResult {
    pub task_id: String,
    pub branch_name: String,
    #[serde(default)]
    pub commit_sha: Option<String>,
    /// False only when the gate ran and did not pass.
    pub test_passed: bool,
    pub pr_created: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pr_url: Option<String>,
    pub outcome: PipelineOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl GitPipelineResult {
    /// State the coordinator reports for this pipeline result.
    pub fn state(&self) -> CoordinatorState {
        match self.outcome {
            PipelineOutcome::Merged | PipelineOutcome::PrOpen => CoordinatorState::PrOpened,
            PipelineOutcome::TestBlocked => CoordinatorState::TestFailed,
            PipelineOutcome::CommitFailed => CoordinatorState::CommitFailed,
        }
    }
}

/// Errors that make a completion retryable.
///
/// Git and test failures are not here: they are terminal outcomes recorded in
/// `GitPipelineResult`, never retried.
#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("Queue operation failed: {0}")]
    Queue(#[from] QueueError),

    #[error("Snapshot failed: {0}")]
    Snapshot(#[from] std::io::Error),

    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}
