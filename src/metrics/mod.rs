//! Metrics module for Prometheus-based monitoring.
//!
//! Metrics cover queue depth, message dispositions, git pipeline outcomes,
//! test gate duration, worker population, restarts, scaling decisions and
//! notification delivery. They are exported as a Prometheus textfile.
//!
//! # Example
//!
//! ```ignore
//! use fleet_forge::metrics::{init_metrics, export_metrics, MetricsCollector};
//!
//! init_metrics().expect("Failed to initialize metrics");
//! MetricsCollector::new().record_scaling("scale_up");
//! let text = export_metrics();
//! ```

pub mod collectors;
pub mod prometheus;

pub use collectors::MetricsCollector;
pub use prometheus::{export_metrics, init_metrics, write_textfile};
