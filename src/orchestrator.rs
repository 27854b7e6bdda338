//! Process wiring: one broker, one notification router, the completion
//! coordinator and the health controller, all under a shared shutdown token.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::OrchestratorConfig;
use crate::coordinator::{CommandTestRunner, CompletionCoordinator, GitCli, GitPipeline};
use crate::error::OrchestratorError;
use crate::health::{
    Autoscaler, ControllerSettings, HealthController, HealthTracker, ProcessLauncher, ProcessProbe,
};
use crate::notify::NotificationRouter;
use crate::queue::{
    Broker, ConsumeOptions, Consumer, ConsumerStats, RedisBroker, TASK_COMPLETION,
    TASK_DEADLETTER, TASK_INTAKE, TASK_RESULTS,
};

/// Every queue the fleet uses.
pub const QUEUES: [&str; 4] = [TASK_INTAKE, TASK_COMPLETION, TASK_RESULTS, TASK_DEADLETTER];

/// Depth of one queue at the time it was read.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct QueueDepth {
    pub queue: String,
    pub depth: usize,
}

pub struct Orchestrator {
    config: OrchestratorConfig,
    broker: Arc<dyn Broker>,
    notifier: Arc<NotificationRouter>,
}

impl Orchestrator {
    /// Connects to the configured broker, retrying up to the ceiling.
    pub async fn connect(config: OrchestratorConfig) -> Result<Self, OrchestratorError> {
        let url = config.broker_url();
        let broker = config
            .broker_backoff()
            .retry("connect", || RedisBroker::connect(&url))
            .await?;
        Ok(Self::new(config, Arc::new(broker)))
    }

    /// Wires the orchestrator around an existing broker.
    pub fn new(config: OrchestratorConfig, broker: Arc<dyn Broker>) -> Self {
        let notifier = Arc::new(
            NotificationRouter::new(config.channels.clone()).with_window(config.dedup_window),
        );
        Self::with_notifier(config, broker, notifier)
    }

    pub fn with_notifier(
        config: OrchestratorConfig,
        broker: Arc<dyn Broker>,
        notifier: Arc<NotificationRouter>,
    ) -> Self {
        Self {
            config,
            broker,
            notifier,
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn broker(&self) -> Arc<dyn Broker> {
        Arc::clone(&self.broker)
    }

    /// Declares every fleet queue as durable.
    pub async fn declare_queues(&self) -> Result<(), OrchestratorError> {
        let backoff = self.config.broker_backoff();
        for queue in QUEUES {
            backoff
                .retry("declare", || self.broker.declare(queue, true))
                .await?;
        }
        Ok(())
    }

    /// Builds the coordinator against the configured repository.
    pub async fn completion_coordinator(&self) -> Result<CompletionCoordinator, OrchestratorError> {
        let vcs = Arc::new(GitCli::new(&self.config.repo_path));
        let tests = Arc::new(
            CommandTestRunner::new(&self.config.test_command, &self.config.repo_path)
                .with_timeout(self.config.test_timeout),
        );
        let pipeline = GitPipeline::new(vcs, tests, self.config.pipeline_settings());
        let coordinator = CompletionCoordinator::open(
            self.broker(),
            pipeline,
            Arc::clone(&self.notifier),
            self.config.coordinator_settings(),
        )
        .await?;
        Ok(coordinator)
    }

    /// Consumer for the completion queue: prefetch 1, stranded deliveries
    /// recovered on start.
    pub fn completion_consumer(&self) -> Consumer {
        let options = ConsumeOptions {
            prefetch: 1,
            max_retries: self.config.max_retries,
            recover_on_start: true,
            backoff: self.config.broker_backoff(),
            ..Default::default()
        };
        Consumer::new(self.broker(), TASK_COMPLETION, options).with_notifier(Arc::clone(&self.notifier))
    }

    /// Builds the health controller for locally spawned worker processes.
    pub fn health_controller(&self) -> Result<HealthController, OrchestratorError> {
        let probe = ProcessProbe::new(self.config.worker_regex()?).with_timeout(self.config.poll_timeout);
        let launcher = ProcessLauncher::new(&self.config.worker_command, &self.config.repo_path);
        let tracker = HealthTracker::new(
            self.config.health_failure_threshold,
            self.config.max_restart_attempts,
            self.config.restart_window,
            self.config.health_thresholds(),
        );
        let settings = ControllerSettings {
            interval: self.config.health_check_interval,
            queue: TASK_INTAKE.to_string(),
            metrics_file: self.config.metrics_file.clone(),
        };

        Ok(HealthController::new(
            Arc::new(probe),
            Arc::new(launcher),
            self.broker(),
            Arc::clone(&self.notifier),
            tracker,
            Autoscaler::new(self.config.scaling_policy()),
            settings,
        ))
    }

    /// Consumes completions until cancelled.
    pub async fn run_coordinator(
        &self,
        cancel: CancellationToken,
    ) -> Result<ConsumerStats, OrchestratorError> {
        self.declare_queues().await?;
        let mut coordinator = self.completion_coordinator().await?;
        let stats = self
            .completion_consumer()
            .run(&mut coordinator, cancel)
            .await;
        self.notifier.flush().await;
        Ok(stats?)
    }

    /// Runs the health and scaling loop until cancelled.
    pub async fn run_controller(&self, cancel: CancellationToken) -> Result<(), OrchestratorError> {
        self.declare_queues().await?;
        let mut controller = self.health_controller()?;
        controller.run(cancel).await;
        self.notifier.flush().await;
        Ok(())
    }

    /// Runs the coordinator and the controller together. A fatal error in
    /// either one cancels the other.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), OrchestratorError> {
        let coordinator_cancel = cancel.child_token();
        let controller_cancel = cancel.child_token();

        let coordinator = async {
            let result = self.run_coordinator(coordinator_cancel).await;
            if let Err(e) = &result {
                error!(error = %e, "Coordinator stopped");
                cancel.cancel();
            }
            result
        };
        let controller = async {
            let result = self.run_controller(controller_cancel).await;
            if let Err(e) = &result {
                error!(error = %e, "Health controller stopped");
                cancel.cancel();
            }
            result
        };

        let (coordinator, controller) = tokio::join!(coordinator, controller);
        let stats = coordinator?;
        controller?;
        info!(
            acked = stats.acked,
            dead_lettered = stats.dead_lettered,
            "Orchestrator stopped"
        );
        Ok(())
    }

    /// Current depth of every fleet queue.
    pub async fn queue_depths(&self) -> Result<Vec<QueueDepth>, OrchestratorError> {
        let backoff = self.config.broker_backoff();
        let mut depths = Vec::with_capacity(QUEUES.len());
        for queue in QUEUES {
            let depth = backoff.retry("depth", || self.broker.depth(queue)).await?;
            depths.push(QueueDepth {
                queue: queue.to_string(),
                depth,
            });
        }
        Ok(depths)
    }

    /// Up to `limit` dead-lettered payloads, oldest first, left in place.
    pub async fn dead_letters(&self, limit: usize) -> Result<Vec<String>, OrchestratorError> {
        let payloads = self
            .config
            .broker_backoff()
            .retry("peek", || self.broker.peek(TASK_DEADLETTER, limit))
            .await?;
        Ok(payloads)
    }
}

/// Cancels `cancel` on the first Ctrl-C.
pub fn cancel_on_ctrl_c(cancel: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::select! {
            _ = cancel.cancelled() => {}
            signal = tokio::signal::ctrl_c() => {
                match signal {
                    Ok(()) => info!("Shutdown requested"),
                    Err(e) => warn!(error = %e, "Could not listen for Ctrl-C, shutting down"),
                }
                cancel.cancel();
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::MemoryBroker;

    fn orchestrator(broker: Arc<MemoryBroker>) -> Orchestrator {
        let config = OrchestratorConfig::default().with_repo_path(std::env::temp_dir());
        Orchestrator::new(config, broker)
    }

    #[tokio::test]
    async fn test_declare_and_report_depths() {
        let broker = Arc::new(MemoryBroker::new());
        let orchestrator = orchestrator(Arc::clone(&broker));
        orchestrator.declare_queues().await.unwrap();
        broker.publish(TASK_INTAKE, "{}").await.unwrap();
        broker.publish(TASK_INTAKE, "{}").await.unwrap();

        let depths = orchestrator.queue_depths().await.unwrap();

        assert_eq!(depths.len(), 4);
        assert_eq!(
            depths[0],
            QueueDepth {
                queue: TASK_INTAKE.to_string(),
                depth: 2
            }
        );
        assert!(depths[1..].iter().all(|d| d.depth == 0));
    }

    #[tokio::test]
    async fn test_dead_letters_are_peeked_not_consumed() {
        let broker = Arc::new(MemoryBroker::new());
        let orchestrator = orchestrator(Arc::clone(&broker));
        orchestrator.declare_queues().await.unwrap();
        for n in 0..3 {
            broker
                .publish(TASK_DEADLETTER, &format!("{{\"n\":{n}}}"))
                .await
                .unwrap();
        }

        let peeked = orchestrator.dead_letters(2).await.unwrap();

        assert_eq!(peeked, vec!["{\"n\":0}".to_string(), "{\"n\":1}".to_string()]);
        assert_eq!(broker.depth(TASK_DEADLETTER).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_health_controller_builds_from_config() {
        let orchestrator = orchestrator(Arc::new(MemoryBroker::new()));
        assert!(orchestrator.health_controller().is_ok());
    }

    #[tokio::test]
    async fn test_completion_consumer_uses_prefetch_one() {
        let orchestrator = orchestrator(Arc::new(MemoryBroker::new()));
        assert_eq!(orchestrator.completion_consumer().queue(), TASK_COMPLETION);
    }
}
