//! High-level recording interface over the raw Prometheus metrics.
//!
//! Every method is a no-op until `init_metrics()` has run, so library code can
//! record unconditionally and tests need no setup.

use super::prometheus::{
    ACTIVE_WORKERS, MESSAGES_TOTAL, NOTIFICATIONS_TOTAL, PIPELINE_OUTCOMES_TOTAL, QUEUE_DEPTH,
    SCALING_DECISIONS_TOTAL, TEST_GATE_DURATION, WORKER_RESTARTS_TOTAL,
};

/// Metrics collector for recording orchestrator metrics.
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsCollector;

impl MetricsCollector {
    /// Create a new MetricsCollector instance.
    pub fn new() -> Self {
        Self
    }

    /// Record how a consumer settled a message.
    pub fn record_message(&self, queue: &str, outcome: &str) {
        if let Some(messages) = MESSAGES_TOTAL.get() {
            messages.with_label_values(&[queue, outcome]).inc();
        }
        tracing::trace!(queue = queue, outcome = outcome, "Recorded message metric");
    }

    /// Record the outcome of a git pipeline run.
    pub fn record_pipeline(&self, outcome: &str) {
        if let Some(outcomes) = PIPELINE_OUTCOMES_TOTAL.get() {
            outcomes.with_label_values(&[outcome]).inc();
        }
    }

    /// Record how long the test gate took.
    pub fn record_test_gate(&self, duration_secs: f64) {
        if let Some(duration) = TEST_GATE_DURATION.get() {
            duration.observe(duration_secs);
        }
    }

    /// Update the queue depth for a specific queue.
    pub fn set_queue_depth(&self, queue: &str, depth: usize) {
        if let Some(queue_depth) = QUEUE_DEPTH.get() {
            queue_depth.with_label_values(&[queue]).set(depth as f64);
        }
    }

    /// Update the number of worker processes.
    pub fn set_active_workers(&self, count: usize) {
        if let Some(active) = ACTIVE_WORKERS.get() {
            active.set(count as f64);
        }
    }

    /// Record a scaling decision.
    pub fn record_scaling(&self, action: &str) {
        if let Some(decisions) = SCALING_DECISIONS_TOTAL.get() {
            decisions.with_label_values(&[action]).inc();
        }
    }

    /// Record a worker restart.
    pub fn record_restart(&self, worker: &str) {
        if let Some(restarts) = WORKER_RESTARTS_TOTAL.get() {
            restarts.with_label_values(&[worker]).inc();
        }
        tracing::trace!(worker = worker, "Recorded restart metric");
    }

    /// Record a routed notification.
    pub fn record_notification(&self, category: &str, result: &str) {
        if let Some(notifications) = NOTIFICATIONS_TOTAL.get() {
            notifications.with_label_values(&[category, result]).inc();
        }
    }
}
