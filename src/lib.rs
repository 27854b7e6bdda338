//! fleet-forge: worker fleet orchestrator.
//!
//! Consumes worker completions from a durable queue, lands produced files
//! through a test-gated git pipeline, keeps the worker pool healthy and sized
//! to the intake backlog, and routes operational notifications.

pub mod cli;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod health;
pub mod metrics;
pub mod notify;
pub mod orchestrator;
pub mod queue;

pub use config::{ConfigError, OrchestratorConfig};
pub use error::OrchestratorError;
pub use orchestrator::Orchestrator;
