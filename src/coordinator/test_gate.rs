//! Test gate run before anything is committed.
//!
//! A timed-out run is a failed run: the child is killed and the report says
//! `passed: false`.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{info, warn};

/// Default bound on a single test run.
pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(300);

/// Output kept from a test run, from the end.
const MAX_OUTPUT_CHARS: usize = 4000;

/// Result of one test gate run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestReport {
    pub passed: bool,
    pub timed_out: bool,
    pub exit_code: Option<i32>,
    /// Tail of combined stdout/stderr.
    pub output: String,
    pub duration: Duration,
}

impl TestReport {
    /// Short reason suitable for a notification.
    pub fn reason(&self) -> String {
        if self.timed_out {
            format!("test run timed out after {:.0}s", self.duration.as_secs_f64())
        } else {
            match self.exit_code {
                Some(code) => format!("tests exited with code {}", code),
                None => "tests could not be run".to_string(),
            }
        }
    }
}

/// Runs the test suite scoped to a set of changed files.
#[async_trait]
pub trait TestRunner: Send + Sync {
    async fn run(&self, files: &[String]) -> TestReport;
}

/// Runs a shell command with the changed files appended as arguments.
#[derive(Debug, Clone)]
pub struct CommandTestRunner {
    command: String,
    working_dir: PathBuf,
    timeout: Duration,
}

impl CommandTestRunner {
    pub fn new(command: impl Into<String>, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            command: command.into(),
            working_dir: working_dir.into(),
            timeout: DEFAULT_TEST_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl TestRunner for CommandTestRunner {
    async fn run(&self, files: &[String]) -> TestReport {
        let start = Instant::now();
        info!(
            command = %self.command,
            files = files.len(),
            timeout_secs = self.timeout.as_secs(),
            "Running test gate"
        );

        // Files go in as positional parameters, never spliced into the script.
        let child = Command::new("sh")
            .arg("-c")
            .arg(format!("{} \"$@\"", self.command))
            .arg("fleet-forge-test")
            .args(files)
            .current_dir(&self.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();

        let child = match child {
            Ok(child) => child,
            Err(e) => {
                warn!(error = %e, "Failed to spawn test command");
                return TestReport {
                    passed: false,
                    timed_out: false,
                    exit_code: None,
                    output: e.to_string(),
                    duration: start.elapsed(),
                };
            }
        };

        match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => {
                let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
                combined.push_str(&String::from_utf8_lossy(&output.stderr));
                TestReport {
                    passed: output.status.success(),
                    timed_out: false,
                    exit_code: output.status.code(),
                    output: tail(&combined, MAX_OUTPUT_CHARS),
                    duration: start.elapsed(),
                }
            }
            Ok(Err(e)) => TestReport {
                passed: false,
                timed_out: false,
                exit_code: None,
                output: e.to_string(),
                duration: start.elapsed(),
            },
            Err(_) => {
                // Dropping the wait future kills the child (kill_on_drop).
                warn!(timeout_secs = self.timeout.as_secs(), "Test gate timed out");
                TestReport {
                    passed: false,
                    timed_out: true,
                    exit_code: None,
                    output: String::new(),
                    duration: start.elapsed(),
                }
            }
        }
    }
}

fn tail(text: &str, max_chars: usize) -> String {
    let count = text.chars().count();
    if count <= max_chars {
        return text.to_string();
    }
    text.chars().skip(count - max_chars).collect()
}
