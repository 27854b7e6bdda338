//! Top-level error type for fleet-forge processes.
//!
//! Subsystems keep their own error enums; this one collects the failures
//! that end a process:
//! - Configuration that does not parse or validate
//! - A broker that stays unreachable past the retry ceiling
//! - Coordinator state that cannot be loaded or saved

use thiserror::Error;

use crate::config::ConfigError;
use crate::coordinator::CoordinatorError;
use crate::queue::QueueError;

/// Errors that stop the orchestrator.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Coordinator error: {0}")]
    Coordinator(#[from] CoordinatorError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errors_name_their_subsystem() {
        let direct = OrchestratorError::from(QueueError::RetriesExhausted {
            attempts: 3,
            last_error: "connection refused".into(),
        });
        assert!(direct.to_string().starts_with("Queue error:"));
        assert!(direct.to_string().contains("after 3 attempts"));

        let config = OrchestratorError::from(ConfigError::ValidationFailed("x".into()));
        assert!(config.to_string().starts_with("Configuration error:"));
    }
}
