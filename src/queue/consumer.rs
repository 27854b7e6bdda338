//! Queue consumer with bounded retries and dead-lettering.
//!
//! A handler is invoked once per delivery and returns a `Disposition`. Any
//! handler error (or an explicit requeue) counts as a failed attempt: the
//! message goes back to its queue with `retry_count` incremented, until the
//! count exceeds `max_retries`. At that point the message is published to the
//! dead-letter queue with `{retry_count, last_error}` and acknowledged off the
//! original queue. Messages are never silently dropped.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::backoff::Backoff;
use super::broker::{Broker, Delivery, QueueError, TASK_DEADLETTER};
use crate::metrics::MetricsCollector;
use crate::notify::{NotificationEvent, NotificationRouter};

/// Default number of retries before a message is dead-lettered.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Errors a handler can report for a single message.
#[derive(Debug, Error)]
pub enum ProcessingError {
    /// The body is not valid JSON.
    #[error("Malformed message: {0}")]
    Malformed(String),

    /// The body is JSON but does not match the expected schema.
    #[error("Unexpected schema: {0}")]
    Schema(String),

    /// A queue operation failed while handling the message.
    #[error("Queue operation failed: {0}")]
    Queue(#[from] QueueError),

    /// Any other handler failure.
    #[error("{0}")]
    Handler(String),
}

/// What the handler wants done with a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Fully processed.
    Ack,
    /// Rejected. `requeue: true` counts as a failed attempt.
    Nack { requeue: bool },
}

/// Final fate of one delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Acked,
    Rejected,
    Requeued { retry_count: u32 },
    DeadLettered { retry_count: u32 },
}

impl DeliveryOutcome {
    /// Label used for metrics.
    pub fn label(&self) -> &'static str {
        match self {
            DeliveryOutcome::Acked => "acked",
            DeliveryOutcome::Rejected => "rejected",
            DeliveryOutcome::Requeued { .. } => "requeued",
            DeliveryOutcome::DeadLettered { .. } => "dead_lettered",
        }
    }
}

/// Processes raw message bodies from one queue.
///
/// Handlers take `&mut self`: a consumer drives exactly one handler and never
/// runs two deliveries through it concurrently.
#[async_trait]
pub trait MessageHandler: Send {
    async fn handle(&mut self, payload: &str) -> Result<Disposition, ProcessingError>;
}

/// Consumer options.
#[derive(Debug, Clone)]
pub struct ConsumeOptions {
    /// Maximum number of unacknowledged deliveries held at once.
    pub prefetch: usize,
    /// Failed attempts tolerated before dead-lettering.
    pub max_retries: u32,
    /// How long a single fetch blocks waiting for a message.
    pub poll_interval: Duration,
    /// Return stranded unacknowledged messages to the queue on start.
    pub recover_on_start: bool,
    /// Backoff applied to broker operations.
    pub backoff: Backoff,
}

impl Default for ConsumeOptions {
    fn default() -> Self {
        Self {
            prefetch: 1,
            max_retries: DEFAULT_MAX_RETRIES,
            poll_interval: Duration::from_secs(1),
            recover_on_start: false,
            backoff: Backoff::default(),
        }
    }
}

/// Retry bookkeeping for one failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryAction {
    Requeue { retry_count: u32 },
    DeadLetter { retry_count: u32 },
}

/// Decides between requeue and dead-letter given the attempts so far.
pub fn on_failure(previous_retries: u32, max_retries: u32) -> RetryAction {
    let retry_count = previous_retries.saturating_add(1);
    if retry_count > max_retries {
        RetryAction::DeadLetter { retry_count }
    } else {
        RetryAction::Requeue { retry_count }
    }
}

/// Statistics collected over a consumer's lifetime.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsumerStats {
    pub acked: u64,
    pub rejected: u64,
    pub requeued: u64,
    pub dead_lettered: u64,
}

impl ConsumerStats {
    fn record(&mut self, outcome: &DeliveryOutcome) {
        match outcome {
            DeliveryOutcome::Acked => self.acked += 1,
            DeliveryOutcome::Rejected => self.rejected += 1,
            DeliveryOutcome::Requeued { .. } => self.requeued += 1,
            DeliveryOutcome::DeadLettered { .. } => self.dead_lettered += 1,
        }
    }
}

/// Consumes one queue on behalf of a single handler.
pub struct Consumer {
    broker: Arc<dyn Broker>,
    queue: String,
    options: ConsumeOptions,
    notifier: Option<Arc<NotificationRouter>>,
    metrics: MetricsCollector,
}

impl Consumer {
    /// Creates a consumer for `queue`.
    pub fn new(broker: Arc<dyn Broker>, queue: impl Into<String>, options: ConsumeOptions) -> Self {
        Self {
            broker,
            queue: queue.into(),
            options,
            notifier: None,
            metrics: MetricsCollector::new(),
        }
    }

    /// Routes dead-letter events through the notification router.
    pub fn with_notifier(mut self, notifier: Arc<NotificationRouter>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Returns the consumed queue's name.
    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Declares the consumed and dead-letter queues, retrying with backoff.
    pub async fn declare(&self) -> Result<(), QueueError> {
        for queue in [self.queue.as_str(), TASK_DEADLETTER] {
            self.options
                .backoff
                .retry("declare", || self.broker.declare(queue, true))
                .await?;
        }
        Ok(())
    }

    /// Runs until `cancel` fires or the broker stays unreachable past the
    /// backoff ceiling.
    pub async fn run<H: MessageHandler>(
        &self,
        handler: &mut H,
        cancel: CancellationToken,
    ) -> Result<ConsumerStats, QueueError> {
        self.declare().await?;

        if self.options.recover_on_start {
            let recovered = self
                .options
                .backoff
                .retry("recover", || self.broker.recover(&self.queue))
                .await?;
            if recovered > 0 {
                info!(queue = %self.queue, recovered, "Requeued stranded deliveries");
            }
        }

        info!(
            queue = %self.queue,
            prefetch = self.options.prefetch,
            max_retries = self.options.max_retries,
            "Consumer started"
        );

        let mut stats = ConsumerStats::default();
        let mut buffer: VecDeque<Delivery> = VecDeque::new();

        loop {
            if buffer.is_empty() {
                let fetched = tokio::select! {
                    _ = cancel.cancelled() => break,
                    fetched = self.options.backoff.retry("fetch", || {
                        self.broker.fetch(&self.queue, self.options.poll_interval)
                    }) => fetched?,
                };
                match fetched {
                    Some(delivery) => buffer.push_back(delivery),
                    None => {
                        debug!(queue = %self.queue, "No messages available");
                        continue;
                    }
                }
            }

            self.top_up(&mut buffer).await?;

            if let Some(delivery) = buffer.pop_front() {
                let outcome = self.process(handler, &delivery).await?;
                self.metrics.record_message(&self.queue, outcome.label());
                stats.record(&outcome);
            }

            if cancel.is_cancelled() {
                break;
            }
        }

        // Prefetched but unhandled deliveries go back untouched.
        for delivery in buffer.drain(..) {
            self.broker.nack(&delivery, true).await?;
        }

        info!(
            queue = %self.queue,
            acked = stats.acked,
            requeued = stats.requeued,
            dead_lettered = stats.dead_lettered,
            "Consumer stopped"
        );
        Ok(stats)
    }

    /// Fills the buffer up to `prefetch` without blocking on an empty queue.
    async fn top_up(&self, buffer: &mut VecDeque<Delivery>) -> Result<(), QueueError> {
        while buffer.len() < self.options.prefetch {
            let waiting = self.broker.depth(&self.queue).await?;
            if waiting == 0 {
                break;
            }
            match self
                .broker
                .fetch(&self.queue, self.options.poll_interval)
                .await?
            {
                Some(delivery) => buffer.push_back(delivery),
                None => break,
            }
        }
        Ok(())
    }

    /// Runs one delivery through the handler and settles it with the broker.
    pub async fn process<H: MessageHandler>(
        &self,
        handler: &mut H,
        delivery: &Delivery,
    ) -> Result<DeliveryOutcome, QueueError> {
        let parsed: Option<Map<String, Value>> = match serde_json::from_str(&delivery.payload) {
            Ok(Value::Object(map)) => Some(map),
            _ => None,
        };
        let previous_retries = parsed
            .as_ref()
            .and_then(|m| m.get("retry_count"))
            .and_then(Value::as_u64)
            .map(|n| n.min(u64::from(u32::MAX)) as u32)
            .unwrap_or(0);

        if previous_retries > self.options.max_retries {
            return self
                .dead_letter(
                    delivery,
                    parsed,
                    previous_retries,
                    "retry budget exhausted before delivery",
                )
                .await;
        }

        let failure = match handler.handle(&delivery.payload).await {
            Ok(Disposition::Ack) => {
                self.settle("ack", || self.broker.ack(delivery)).await?;
                return Ok(DeliveryOutcome::Acked);
            }
            Ok(Disposition::Nack { requeue: false }) => {
                self.settle("nack", || self.broker.nack(delivery, false))
                    .await?;
                return Ok(DeliveryOutcome::Rejected);
            }
            Ok(Disposition::Nack { requeue: true }) => "handler requested requeue".to_string(),
            Err(e) => e.to_string(),
        };

        let Some(mut body) = parsed else {
            // No object to carry a retry counter; it can never succeed.
            return self.dead_letter(delivery, None, 1, &failure).await;
        };

        match on_failure(previous_retries, self.options.max_retries) {
            RetryAction::Requeue { retry_count } => {
                warn!(
                    queue = %self.queue,
                    task_id = %task_id_of(&body),
                    retry_count,
                    error = %failure,
                    "Message processing failed, requeueing"
                );
                // Pin an id so redeliveries are recognisable as the same message.
                body.entry("message_id")
                    .or_insert_with(|| Value::from(Uuid::new_v4().to_string()));
                body.insert("retry_count".into(), Value::from(retry_count));
                body.insert("last_error".into(), Value::from(failure));
                let payload = serde_json::to_string(&body)?;
                self.settle("requeue", || self.broker.requeue(delivery, &payload))
                    .await?;
                Ok(DeliveryOutcome::Requeued { retry_count })
            }
            RetryAction::DeadLetter { retry_count } => {
                self.dead_letter(delivery, Some(body), retry_count, &failure)
                    .await
            }
        }
    }

    async fn dead_letter(
        &self,
        delivery: &Delivery,
        body: Option<Map<String, Value>>,
        retry_count: u32,
        last_error: &str,
    ) -> Result<DeliveryOutcome, QueueError> {
        let mut entry = body.unwrap_or_else(|| {
            let mut map = Map::new();
            map.insert("raw".into(), Value::from(delivery.payload.clone()));
            map
        });
        entry.insert("retry_count".into(), Value::from(retry_count));
        entry.insert("last_error".into(), Value::from(last_error));
        let task_id = task_id_of(&entry);
        let payload = serde_json::to_string(&entry)?;

        error!(
            queue = %self.queue,
            task_id = %task_id,
            retry_count,
            error = %last_error,
            "Moving message to dead letter queue"
        );

        // Publish before ack: a crash in between redelivers rather than loses.
        self.settle("dead-letter publish", || {
            self.broker.publish(TASK_DEADLETTER, &payload)
        })
        .await?;
        self.settle("ack", || self.broker.ack(delivery)).await?;

        if let Some(notifier) = &self.notifier {
            notifier
                .route(NotificationEvent::error(
                    format!("deadletter:{}", task_id),
                    format!("Message for task {} dead-lettered", task_id),
                    format!(
                        "Queue {} gave up after {} attempts: {}",
                        self.queue, retry_count, last_error
                    ),
                ));
        }

        Ok(DeliveryOutcome::DeadLettered { retry_count })
    }

    async fn settle<F, Fut>(&self, what: &str, op: F) -> Result<(), QueueError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<(), QueueError>>,
    {
        self.options.backoff.retry(what, op).await
    }
}

fn task_id_of(body: &Map<String, Value>) -> String {
    body.get("task_id")
        .and_then(Value::as_str)
        .unwrap_or("unknown")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::memory::MemoryBroker;

    struct AlwaysFails;

    #[async_trait]
    impl MessageHandler for AlwaysFails {
        async fn handle(&mut self, _payload: &str) -> Result<Disposition, ProcessingError> {
            Err(ProcessingError::Handler("boom".into()))
        }
    }

    struct Accepts(Vec<String>);

    #[async_trait]
    impl MessageHandler for Accepts {
        async fn handle(&mut self, payload: &str) -> Result<Disposition, ProcessingError> {
            self.0.push(payload.to_string());
            Ok(Disposition::Ack)
        }
    }

    async fn setup() -> (Arc<MemoryBroker>, Consumer) {
        let broker = Arc::new(MemoryBroker::new());
        let consumer = Consumer::new(
            broker.clone(),
            "task.completion",
            ConsumeOptions {
                poll_interval: Duration::from_millis(10),
                ..Default::default()
            },
        );
        consumer.declare().await.unwrap();
        (broker, consumer)
    }

    async fn deliver(broker: &MemoryBroker) -> Delivery {
        broker
            .fetch("task.completion", Duration::from_millis(10))
            .await
            .unwrap()
            .expect("message should be waiting")
    }

    #[test]
    fn test_on_failure_bounds() {
        assert_eq!(on_failure(0, 3), RetryAction::Requeue { retry_count: 1 });
        assert_eq!(on_failure(2, 3), RetryAction::Requeue { retry_count: 3 });
        assert_eq!(on_failure(3, 3), RetryAction::DeadLetter { retry_count: 4 });
        assert_eq!(on_failure(0, 0), RetryAction::DeadLetter { retry_count: 1 });
    }

    #[tokio::test]
    async fn test_ack_on_success() {
        let (broker, consumer) = setup().await;
        broker.publish("task.completion", r#"{"task_id":"t"}"#).await.unwrap();

        let mut handler = Accepts(Vec::new());
        let delivery = deliver(&broker).await;
        let outcome = consumer.process(&mut handler, &delivery).await.unwrap();

        assert_eq!(outcome, DeliveryOutcome::Acked);
        assert_eq!(handler.0.len(), 1);
        assert_eq!(broker.unacked("task.completion").await, 0);
    }

    #[tokio::test]
    async fn test_failure_requeues_with_counter() {
        let (broker, consumer) = setup().await;
        broker.publish("task.completion", r#"{"task_id":"t"}"#).await.unwrap();

        let delivery = deliver(&broker).await;
        let outcome = consumer.process(&mut AlwaysFails, &delivery).await.unwrap();
        assert_eq!(outcome, DeliveryOutcome::Requeued { retry_count: 1 });

        let requeued: Value =
            serde_json::from_str(&broker.peek("task.completion", 1).await.unwrap()[0]).unwrap();
        assert_eq!(requeued["retry_count"], 1);
        assert_eq!(requeued["last_error"], "boom");
        assert_eq!(requeued["task_id"], "t");
        assert!(requeued["message_id"].is_string());
    }

    #[tokio::test]
    async fn test_fourth_delivery_is_dead_lettered() {
        let (broker, consumer) = setup().await;
        broker.publish("task.completion", r#"{"task_id":"t-dl"}"#).await.unwrap();

        let mut outcomes = Vec::new();
        for _ in 0..4 {
            let delivery = deliver(&broker).await;
            outcomes.push(consumer.process(&mut AlwaysFails, &delivery).await.unwrap());
        }

        assert_eq!(outcomes[2], DeliveryOutcome::Requeued { retry_count: 3 });
        assert_eq!(outcomes[3], DeliveryOutcome::DeadLettered { retry_count: 4 });
        assert_eq!(broker.depth("task.completion").await.unwrap(), 0);
        assert_eq!(broker.unacked("task.completion").await, 0);

        let dead = broker.peek(TASK_DEADLETTER, 10).await.unwrap();
        assert_eq!(dead.len(), 1);
        let entry: Value = serde_json::from_str(&dead[0]).unwrap();
        assert_eq!(entry["retry_count"], 4);
        assert_eq!(entry["task_id"], "t-dl");
        assert_eq!(entry["last_error"], "boom");
    }

    #[tokio::test]
    async fn test_non_json_is_dead_lettered_with_raw_body() {
        let (broker, consumer) = setup().await;
        broker.publish("task.completion", "not json").await.unwrap();

        let delivery = deliver(&broker).await;
        let outcome = consumer.process(&mut AlwaysFails, &delivery).await.unwrap();
        assert_eq!(outcome, DeliveryOutcome::DeadLettered { retry_count: 1 });

        let entry: Value =
            serde_json::from_str(&broker.peek(TASK_DEADLETTER, 1).await.unwrap()[0]).unwrap();
        assert_eq!(entry["raw"], "not json");
    }

    #[tokio::test]
    async fn test_over_budget_message_skips_handler() {
        let (broker, consumer) = setup().await;
        broker
            .publish("task.completion", r#"{"task_id":"t","retry_count":9}"#)
            .await
            .unwrap();

        let mut handler = Accepts(Vec::new());
        let delivery = deliver(&broker).await;
        let outcome = consumer.process(&mut handler, &delivery).await.unwrap();

        assert_eq!(outcome, DeliveryOutcome::DeadLettered { retry_count: 9 });
        assert!(handler.0.is_empty());
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let (broker, consumer) = setup().await;
        broker.publish("task.completion", r#"{"task_id":"a"}"#).await.unwrap();
        broker.publish("task.completion", r#"{"task_id":"b"}"#).await.unwrap();

        let cancel = CancellationToken::new();
        let stopper = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            stopper.cancel();
        });

        let mut handler = Accepts(Vec::new());
        let stats = consumer.run(&mut handler, cancel).await.unwrap();

        assert_eq!(stats.acked, 2);
        assert_eq!(handler.0.len(), 2);
    }
}
