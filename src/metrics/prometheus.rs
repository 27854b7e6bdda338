//! Prometheus metrics registration and export.
//!
//! This module defines all Prometheus metrics used by fleet-forge and provides
//! functions for initializing, registering, and exporting metrics.

use std::path::Path;
use std::sync::OnceLock;

use prometheus::{
    CounterVec, Encoder, Gauge, GaugeVec, Histogram, HistogramOpts, Opts, Registry, TextEncoder,
};

/// Global Prometheus registry for all fleet-forge metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Number of waiting messages, labeled by queue name.
pub static QUEUE_DEPTH: OnceLock<GaugeVec> = OnceLock::new();

/// Messages settled by consumers, labeled by queue and outcome.
pub static MESSAGES_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Git pipeline runs, labeled by outcome.
pub static PIPELINE_OUTCOMES_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Test gate duration in seconds.
pub static TEST_GATE_DURATION: OnceLock<Histogram> = OnceLock::new();

/// Number of worker processes seen in the last poll.
pub static ACTIVE_WORKERS: OnceLock<Gauge> = OnceLock::new();

/// Scaling decisions, labeled by action.
pub static SCALING_DECISIONS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Worker restarts, labeled by worker identity.
pub static WORKER_RESTARTS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Notifications, labeled by category and result (delivered/suppressed/dropped).
pub static NOTIFICATIONS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Initialize all metrics and register them with the registry.
///
/// Call once at startup. Calling it again is harmless: the first registry wins.
///
/// # Errors
///
/// Returns a `prometheus::Error` if metric registration fails.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    let registry = Registry::new();

    let queue_depth = GaugeVec::new(
        Opts::new("fleet_forge_queue_depth", "Number of messages waiting in queue"),
        &["queue_name"],
    )?;

    let messages_total = CounterVec::new(
        Opts::new("fleet_forge_messages_total", "Messages settled by consumers"),
        &["queue_name", "outcome"],
    )?;

    let pipeline_outcomes_total = CounterVec::new(
        Opts::new(
            "fleet_forge_pipeline_outcomes_total",
            "Git pipeline runs by outcome",
        ),
        &["outcome"],
    )?;

    let test_gate_duration = Histogram::with_opts(
        HistogramOpts::new(
            "fleet_forge_test_gate_duration_seconds",
            "Test gate duration in seconds",
        )
        .buckets(vec![1.0, 5.0, 15.0, 30.0, 60.0, 120.0, 300.0, 600.0]),
    )?;

    let active_workers = Gauge::new(
        "fleet_forge_active_workers",
        "Worker processes seen in the last poll",
    )?;

    let scaling_decisions_total = CounterVec::new(
        Opts::new(
            "fleet_forge_scaling_decisions_total",
            "Scaling decisions by action",
        ),
        &["action"],
    )?;

    let worker_restarts_total = CounterVec::new(
        Opts::new("fleet_forge_worker_restarts_total", "Worker restarts"),
        &["worker"],
    )?;

    let notifications_total = CounterVec::new(
        Opts::new(
            "fleet_forge_notifications_total",
            "Notifications by category and result",
        ),
        &["category", "result"],
    )?;

    registry.register(Box::new(queue_depth.clone()))?;
    registry.register(Box::new(messages_total.clone()))?;
    registry.register(Box::new(pipeline_outcomes_total.clone()))?;
    registry.register(Box::new(test_gate_duration.clone()))?;
    registry.register(Box::new(active_workers.clone()))?;
    registry.register(Box::new(scaling_decisions_total.clone()))?;
    registry.register(Box::new(worker_restarts_total.clone()))?;
    registry.register(Box::new(notifications_total.clone()))?;

    // If any of these fail, metrics were already initialized (idempotent)
    let _ = REGISTRY.set(registry);
    let _ = QUEUE_DEPTH.set(queue_depth);
    let _ = MESSAGES_TOTAL.set(messages_total);
    let _ = PIPELINE_OUTCOMES_TOTAL.set(pipeline_outcomes_total);
    let _ = TEST_GATE_DURATION.set(test_gate_duration);
    let _ = ACTIVE_WORKERS.set(active_workers);
    let _ = SCALING_DECISIONS_TOTAL.set(scaling_decisions_total);
    let _ = WORKER_RESTARTS_TOTAL.set(worker_restarts_total);
    let _ = NOTIFICATIONS_TOTAL.set(notifications_total);

    tracing::info!("Prometheus metrics initialized successfully");

    Ok(())
}

/// Export all registered metrics in Prometheus text format.
///
/// If the registry has not been initialized or encoding fails, returns a
/// comment line describing the problem.
pub fn export_metrics() -> String {
    let Some(registry) = REGISTRY.get() else {
        return "# Metrics not initialized. Call init_metrics() first.\n".to_string();
    };

    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return format!("# Error encoding metrics: {}\n", e);
    }

    String::from_utf8(buffer)
        .unwrap_or_else(|e| format!("# Error converting metrics to UTF-8: {}\n", e))
}

/// Writes the current metrics to a node-exporter textfile.
///
/// The file is written to a sibling temp path and renamed so scrapers never
/// read a half-written file.
pub async fn write_textfile(path: &Path) -> std::io::Result<()> {
    let tmp = path.with_extension("prom.tmp");
    tokio::fs::write(&tmp, export_metrics()).await?;
    tokio::fs::rename(&tmp, path).await
}
