//! Scaling decisions.
//!
//! `evaluate_scaling` is a pure function of the worker snapshot, the number of
//! vanished workers already awaiting a restart, the queue depth, the time of
//! the last fleet change and how long the pool has been idle. `Autoscaler`
//! keeps those two timestamps between cycles.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use super::WorkerMetrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScalingAction {
    ScaleUp,
    ScaleDown,
    Maintain,
    /// A fleet change was warranted but the cooldown is still running.
    Wait,
}

impl ScalingAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScalingAction::ScaleUp => "scale_up",
            ScalingAction::ScaleDown => "scale_down",
            ScalingAction::Maintain => "maintain",
            ScalingAction::Wait => "wait",
        }
    }

    /// Whether carrying this out changes the fleet.
    pub fn changes_fleet(&self) -> bool {
        matches!(self, ScalingAction::ScaleUp | ScalingAction::ScaleDown)
    }
}

impl fmt::Display for ScalingAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScalingDecision {
    pub action: ScalingAction,
    pub current_workers: usize,
    pub target_workers: usize,
    pub reason: String,
    pub queue_length: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScalingPolicy {
    pub min_workers: usize,
    pub max_workers: usize,
    /// Queue depth per worker above which the pool grows.
    pub high_watermark: f64,
    /// Idle workers tolerated on an empty queue.
    pub idle_margin: usize,
    pub idle_grace: Duration,
    /// Below this CPU usage a worker counts as idle.
    pub idle_cpu_percent: f32,
    pub cooldown: Duration,
}

impl Default for ScalingPolicy {
    fn default() -> Self {
        Self {
            min_workers: 1,
            max_workers: 10,
            high_watermark: 20.0,
            idle_margin: 1,
            idle_grace: Duration::from_secs(300),
            idle_cpu_percent: 5.0,
            cooldown: Duration::from_secs(60),
        }
    }
}

impl ScalingPolicy {
    pub fn idle_workers(&self, metrics: &[WorkerMetrics]) -> usize {
        metrics
            .iter()
            .filter(|w| w.cpu_percent < self.idle_cpu_percent)
            .count()
    }
}

/// Timestamps carried between evaluations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScalingState {
    /// When the last scale_up/scale_down was decided.
    pub last_change_at: Option<Instant>,
    /// Since when the queue has been empty with surplus idle workers.
    pub idle_since: Option<Instant>,
}

/// Rules in priority order: below minimum, above watermark, idle surplus
/// past the grace period, otherwise maintain. A fleet change inside the
/// cooldown becomes `Wait`.
///
/// `pending` workers are missing from the process table but will be
/// restarted under their own identity; they count toward the fleet so a
/// crash is replaced once, not twice.
pub fn evaluate_scaling(
    metrics: &[WorkerMetrics],
    pending: usize,
    queue_depth: usize,
    state: &ScalingState,
    policy: &ScalingPolicy,
    now: Instant,
) -> ScalingDecision {
    let current = metrics.len() + pending;
    let decision = |action, target_workers, reason: String| ScalingDecision {
        action,
        current_workers: current,
        target_workers,
        reason,
        queue_length: queue_depth,
    };

    let proposed = if current < policy.min_workers {
        decision(
            ScalingAction::ScaleUp,
            policy.min_workers,
            format!("{} workers below minimum {}", current, policy.min_workers),
        )
    } else if current < policy.max_workers && load(queue_depth, current) > policy.high_watermark {
        let wanted = (queue_depth as f64 / policy.high_watermark).ceil() as usize;
        let target = wanted.max(current + 1).min(policy.max_workers);
        decision(
            ScalingAction::ScaleUp,
            target,
            format!(
                "{} queued across {} workers exceeds watermark {}",
                queue_depth, current, policy.high_watermark
            ),
        )
    } else if let Some(surplus) = idle_surplus(metrics, current, queue_depth, state, policy, now) {
        let target = current.saturating_sub(surplus).max(policy.min_workers);
        decision(
            ScalingAction::ScaleDown,
            target,
            format!(
                "queue empty with {} idle workers for over {}s",
                policy.idle_workers(metrics),
                policy.idle_grace.as_secs()
            ),
        )
    } else {
        decision(ScalingAction::Maintain, current, "within bounds".to_string())
    };

    if !proposed.action.changes_fleet() {
        return proposed;
    }

    match state.last_change_at {
        Some(at) if now.duration_since(at) < policy.cooldown => {
            let remaining = policy.cooldown - now.duration_since(at);
            decision(
                ScalingAction::Wait,
                current,
                format!(
                    "cooldown {}s remaining; wanted {} to {}",
                    remaining.as_secs(),
                    proposed.action,
                    proposed.target_workers
                ),
            )
        }
        _ => proposed,
    }
}

fn load(queue_depth: usize, current: usize) -> f64 {
    if current == 0 {
        if queue_depth == 0 {
            0.0
        } else {
            f64::INFINITY
        }
    } else {
        queue_depth as f64 / current as f64
    }
}

fn idle_surplus(
    metrics: &[WorkerMetrics],
    current: usize,
    queue_depth: usize,
    state: &ScalingState,
    policy: &ScalingPolicy,
    now: Instant,
) -> Option<usize> {
    if queue_depth != 0 || current <= policy.min_workers {
        return None;
    }
    let idle = policy.idle_workers(metrics);
    if idle <= policy.idle_margin {
        return None;
    }
    let since = state.idle_since?;
    (now.duration_since(since) >= policy.idle_grace).then_some(idle - policy.idle_margin)
}

/// Stateful wrapper that maintains `ScalingState` across cycles.
#[derive(Debug, Clone)]
pub struct Autoscaler {
    policy: ScalingPolicy,
    state: ScalingState,
}

impl Autoscaler {
    pub fn new(policy: ScalingPolicy) -> Self {
        Self {
            policy,
            state: ScalingState::default(),
        }
    }

    pub fn policy(&self) -> &ScalingPolicy {
        &self.policy
    }

    pub fn state(&self) -> &ScalingState {
        &self.state
    }

    pub fn evaluate(
        &mut self,
        metrics: &[WorkerMetrics],
        pending: usize,
        queue_depth: usize,
        now: Instant,
    ) -> ScalingDecision {
        let surplus_idle = queue_depth == 0 && self.policy.idle_workers(metrics) > self.policy.idle_margin;
        if surplus_idle {
            self.state.idle_since.get_or_insert(now);
        } else {
            self.state.idle_since = None;
        }

        let decision = evaluate_scaling(metrics, pending, queue_depth, &self.state, &self.policy, now);
        if decision.action.changes_fleet() {
            self.state.last_change_at = Some(now);
            self.state.idle_since = None;
        }
        decision
    }
}
