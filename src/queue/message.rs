//! Message schemas carried on the orchestrator queues.
//!
//! This module defines the wire types shared with the worker pool:
//!
//! - `TaskMessage`: a unit of work published to `task.intake`
//! - `CompletionMessage`: a worker's report published to `task.completion`
//! - `Envelope`: retry metadata flattened alongside any message body
//! - `ResultRecord`: the enriched record forwarded to `task.results`

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::coordinator::{CoordinatorState, GitPipelineResult};

/// A task published to the intake queue and consumed by exactly one worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskMessage {
    /// Identifier of the underlying task, stable across follow-up messages.
    pub task_id: String,
    /// Kind of work (e.g. "code_generation", "refactor").
    pub task_type: String,
    /// Instruction handed to the worker.
    pub instruction: String,
    /// Free-form context for the worker.
    #[serde(default)]
    pub context: HashMap<String, serde_json::Value>,
}

impl TaskMessage {
    /// Creates a new task message with an empty context.
    pub fn new(
        task_id: impl Into<String>,
        task_type: impl Into<String>,
        instruction: impl Into<String>,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            task_type: task_type.into(),
            instruction: instruction.into(),
            context: HashMap::new(),
        }
    }

    /// Adds a context entry.
    pub fn with_context(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.context.insert(key.into(), value);
        self
    }
}

/// Status reported by a worker when it publishes a completion message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionStatus {
    /// The worker finished the task.
    Completed,
    /// The worker gave up; `error` describes why.
    #[serde(alias = "error")]
    Failed,
    /// Intermediate progress report.
    Progress,
    /// The worker needs more information from a human.
    NeedInfo,
}

impl std::fmt::Display for CompletionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CompletionStatus::Completed => write!(f, "completed"),
            CompletionStatus::Failed => write!(f, "failed"),
            CompletionStatus::Progress => write!(f, "progress"),
            CompletionStatus::NeedInfo => write!(f, "need_info"),
        }
    }
}

/// A worker's report at the end (or a checkpoint) of a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionMessage {
    pub task_id: String,
    pub task_type: String,
    pub status: CompletionStatus,
    pub worker_id: String,
    #[serde(default)]
    pub prompt: String,
    #[serde(default)]
    pub response: String,
    #[serde(default)]
    pub output_file: Option<String>,
    /// Paths the worker claims to have written, relative to the output root.
    #[serde(default)]
    pub files_created: Vec<String>,
    /// Wall-clock duration in seconds.
    #[serde(default)]
    pub duration: f64,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub error_trace: Option<String>,
    /// Percentage done; only meaningful for `progress`.
    #[serde(default)]
    pub progress: Option<u8>,
    /// Instruction to dispatch next; only meaningful for `progress`.
    #[serde(default)]
    pub next_instruction: Option<String>,
}

impl CompletionMessage {
    /// Creates a completion message with empty payload fields.
    pub fn new(
        task_id: impl Into<String>,
        task_type: impl Into<String>,
        status: CompletionStatus,
        worker_id: impl Into<String>,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            task_type: task_type.into(),
            status,
            worker_id: worker_id.into(),
            prompt: String::new(),
            response: String::new(),
            output_file: None,
            files_created: Vec::new(),
            duration: 0.0,
            error: None,
            error_trace: None,
            progress: None,
            next_instruction: None,
        }
    }

    /// Sets the files the worker reported.
    pub fn with_files(mut self, files: Vec<String>) -> Self {
        self.files_created = files;
        self
    }

    /// Sets the prompt the worker was given.
    pub fn with_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = prompt.into();
        self
    }

    /// Sets the worker's response text.
    pub fn with_response(mut self, response: impl Into<String>) -> Self {
        self.response = response.into();
        self
    }

    /// Sets the error message.
    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    /// Sets the progress percentage and follow-up instruction.
    pub fn with_progress(mut self, progress: u8, next_instruction: Option<String>) -> Self {
        self.progress = Some(progress);
        self.next_instruction = next_instruction;
        self
    }

    /// One-line summary used for commit messages and notification titles.
    pub fn summary(&self) -> String {
        let source = if self.prompt.trim().is_empty() {
            self.response.as_str()
        } else {
            self.prompt.as_str()
        };
        let line = source.lines().map(str::trim).find(|l| !l.is_empty());
        match line {
            Some(l) if l.chars().count() > 60 => {
                let cut: String = l.chars().take(57).collect();
                format!("{}...", cut.trim_end())
            }
            Some(l) => l.to_string(),
            None => format!("{} task {}", self.task_type, self.task_id),
        }
    }
}

/// Retry metadata carried alongside every message body.
///
/// The metadata fields are flattened into the same JSON object as the body so
/// that workers can ignore them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope<T> {
    /// Identifier assigned at first publish; survives requeue.
    #[serde(default = "Uuid::new_v4")]
    pub message_id: Uuid,
    /// Number of failed processing attempts so far.
    #[serde(default)]
    pub retry_count: u32,
    /// Error from the most recent failed attempt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(flatten)]
    pub body: T,
}

impl<T> Envelope<T> {
    /// Wraps a body in a fresh envelope.
    pub fn new(body: T) -> Self {
        Self {
            message_id: Uuid::new_v4(),
            retry_count: 0,
            last_error: None,
            body,
        }
    }
}

impl<T: Serialize> Envelope<T> {
    /// Serializes the envelope to its JSON wire form.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Enriched record forwarded downstream for every handled completion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRecord {
    pub task_id: String,
    pub task_type: String,
    pub worker_id: String,
    pub status: CompletionStatus,
    /// Terminal state the coordinator reached for this message.
    pub state: CoordinatorState,
    /// Files detected against the baseline snapshot.
    #[serde(default)]
    pub files: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git: Option<GitPipelineResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub output_file: Option<String>,
    pub duration: f64,
    pub forwarded_at: DateTime<Utc>,
}
