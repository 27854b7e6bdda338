//! Version control operations used by the git pipeline.
//!
//! `GitCli` shells out to `git` and `gh`. Nothing here force-pushes, rewrites
//! history or deletes a branch.

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

/// A failed git or pull-request operation.
#[derive(Debug, Error)]
pub enum GitOperationError {
    #[error("Failed to run {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{command} failed: {stderr}")]
    CommandFailed { command: String, stderr: String },
}

/// Operations the pipeline needs from version control.
#[async_trait]
pub trait VersionControl: Send + Sync {
    async fn branch_exists(&self, branch: &str) -> Result<bool, GitOperationError>;

    /// Creates `branch` from the current HEAD and switches to it, carrying
    /// uncommitted changes along.
    async fn create_branch(&self, branch: &str) -> Result<(), GitOperationError>;

    async fn checkout(&self, branch: &str) -> Result<(), GitOperationError>;

    /// Stages exactly `files` and commits them; returns the new commit sha.
    async fn commit(&self, files: &[String], message: &str) -> Result<String, GitOperationError>;

    /// Shelves `files` (tracked or not) in a stash entry labelled `message`.
    async fn stash(&self, files: &[String], message: &str) -> Result<(), GitOperationError>;

    async fn push(&self, branch: &str) -> Result<(), GitOperationError>;

    /// Opens a pull request and returns its URL.
    async fn open_pull_request(
        &self,
        branch: &str,
        base: &str,
        title: &str,
        body: &str,
    ) -> Result<String, GitOperationError>;

    async fn merge_pull_request(&self, branch: &str) -> Result<(), GitOperationError>;
}

/// `git`/`gh` command-line implementation.
#[derive(Debug, Clone)]
pub struct GitCli {
    repo: PathBuf,
}

const REMOTE: &str = "origin";

impl GitCli {
    pub fn new(repo: impl Into<PathBuf>) -> Self {
        Self { repo: repo.into() }
    }

    async fn run(&self, program: &str, args: &[&str]) -> Result<String, GitOperationError> {
        let command = format!("{} {}", program, args.first().copied().unwrap_or_default());
        debug!(repo = %self.repo.display(), "Running {} {}", program, args.join(" "));

        let output = Command::new(program)
            .args(args)
            .current_dir(&self.repo)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|source| GitOperationError::Spawn {
                command: command.clone(),
                source,
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(GitOperationError::CommandFailed { command, stderr });
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    async fn git(&self, args: &[&str]) -> Result<String, GitOperationError> {
        self.run("git", args).await
    }

    async fn gh(&self, args: &[&str]) -> Result<String, GitOperationError> {
        self.run("gh", args).await
    }
}

fn with_paths<'a>(mut args: Vec<&'a str>, files: &'a [String]) -> Vec<&'a str> {
    args.push("--");
    args.extend(files.iter().map(String::as_str));
    args
}

#[async_trait]
impl VersionControl for GitCli {
    async fn branch_exists(&self, branch: &str) -> Result<bool, GitOperationError> {
        let reference = format!("refs/heads/{}", branch);
        match self
            .git(&["show-ref", "--verify", "--quiet", &reference])
            .await
        {
            Ok(_) => Ok(true),
            Err(GitOperationError::CommandFailed { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn create_branch(&self, branch: &str) -> Result<(), GitOperationError> {
        self.git(&["checkout", "-b", branch]).await.map(|_| ())
    }

    async fn checkout(&self, branch: &str) -> Result<(), GitOperationError> {
        self.git(&["checkout", branch]).await.map(|_| ())
    }

    async fn commit(&self, files: &[String], message: &str) -> Result<String, GitOperationError> {
        self.git(&with_paths(vec!["add"], files)).await?;
        self.git(&with_paths(vec!["commit", "-m", message], files))
            .await?;
        self.git(&["rev-parse", "HEAD"]).await
    }

    async fn stash(&self, files: &[String], message: &str) -> Result<(), GitOperationError> {
        self.git(&with_paths(
            vec!["stash", "push", "--include-untracked", "-m", message],
            files,
        ))
        .await
        .map(|_| ())
    }

    async fn push(&self, branch: &str) -> Result<(), GitOperationError> {
        self.git(&["push", "--set-upstream", REMOTE, branch])
            .await
            .map(|_| ())
    }

    async fn open_pull_request(
        &self,
        branch: &str,
        base: &str,
        title: &str,
        body: &str,
    ) -> Result<String, GitOperationError> {
        let output = self
            .gh(&[
                "pr", "create", "--head", branch, "--base", base, "--title", title, "--body", body,
            ])
            .await?;
        Ok(output.lines().last().unwrap_or_default().to_string())
    }

    async fn merge_pull_request(&self, branch: &str) -> Result<(), GitOperationError> {
        self.gh(&["pr", "merge", branch, "--merge"]).await.map(|_| ())
    }
}
