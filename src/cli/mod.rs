//! Command-line interface for fleet-forge.
//!
//! Provides commands for running the coordinator and the health controller,
//! and for inspecting the broker.

mod commands;

pub use commands::{parse_cli, run_with_cli, Cli, Commands};
