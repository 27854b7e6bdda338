//! Broker abstraction: durable named queues with manual acknowledgement.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

/// Intake queue consumed by the worker pool.
pub const TASK_INTAKE: &str = "task.intake";
/// Completion queue consumed by the coordinator with prefetch 1.
pub const TASK_COMPLETION: &str = "task.completion";
/// Terminal holding area for messages that exhausted their retries.
pub const TASK_DEADLETTER: &str = "task.deadletter";
/// Downstream channel for enriched result records.
pub const TASK_RESULTS: &str = "task.results";

/// Errors that can occur during queue operations.
#[derive(Debug, Error)]
pub enum QueueError {
    /// The broker could not be reached. Transient; retry with backoff.
    #[error("Broker unavailable: {0}")]
    BrokerUnavailable(String),

    /// The broker stayed unreachable past the retry ceiling.
    #[error("Broker unavailable after {attempts} attempts: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },

    /// Failed to serialize a message body.
    #[error("Serialization failed: {0}")]
    SerializationFailed(#[from] serde_json::Error),

    /// The queue was used before `declare`.
    #[error("Queue '{0}' has not been declared")]
    UndeclaredQueue(String),
}

impl From<redis::RedisError> for QueueError {
    fn from(err: redis::RedisError) -> Self {
        QueueError::BrokerUnavailable(err.to_string())
    }
}

impl QueueError {
    /// Returns whether the error is worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(self, QueueError::BrokerUnavailable(_))
    }
}

/// A message handed to a consumer and not yet acknowledged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Queue the message was taken from.
    pub queue: String,
    /// Raw JSON body exactly as stored by the broker.
    pub payload: String,
}

/// Durable named queues with at-least-once delivery and manual acks.
///
/// Publishing is fire-and-forget; once `publish` returns the broker owns the
/// message. A fetched message stays unacknowledged until `ack`, `nack` or
/// `requeue` is called for it.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Ensures a queue exists. Idempotent.
    async fn declare(&self, queue: &str, durable: bool) -> Result<(), QueueError>;

    /// Publishes a persistent message.
    async fn publish(&self, queue: &str, payload: &str) -> Result<(), QueueError>;

    /// Waits up to `wait` for the next message.
    async fn fetch(&self, queue: &str, wait: Duration) -> Result<Option<Delivery>, QueueError>;

    /// Marks a delivery as fully processed.
    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError>;

    /// Rejects a delivery, putting it back unchanged when `requeue` is set.
    async fn nack(&self, delivery: &Delivery, requeue: bool) -> Result<(), QueueError>;

    /// Atomically replaces an unacknowledged delivery with `payload` at the
    /// head of its queue. Used to carry an updated retry counter.
    async fn requeue(&self, delivery: &Delivery, payload: &str) -> Result<(), QueueError>;

    /// Number of messages waiting in a queue (unacknowledged excluded).
    async fn depth(&self, queue: &str) -> Result<usize, QueueError>;

    /// Returns up to `limit` waiting messages without consuming them.
    async fn peek(&self, queue: &str, limit: usize) -> Result<Vec<String>, QueueError>;

    /// Returns unacknowledged messages left behind by a dead consumer to the
    /// queue. Returns how many were recovered.
    async fn recover(&self, queue: &str) -> Result<usize, QueueError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_error_display() {
        let err = QueueError::BrokerUnavailable("connection refused".to_string());
        assert!(err.to_string().contains("connection refused"));
        assert!(err.is_transient());

        let err = QueueError::RetriesExhausted {
            attempts: 7,
            last_error: "timeout".to_string(),
        };
        assert!(err.to_string().contains('7'));
        assert!(!err.is_transient());

        let err = QueueError::UndeclaredQueue("task.nope".to_string());
        assert!(err.to_string().contains("task.nope"));
    }

    #[test]
    fn test_queue_names_are_distinct() {
        let names = [TASK_INTAKE, TASK_COMPLETION, TASK_DEADLETTER, TASK_RESULTS];
        for (i, a) in names.iter().enumerate() {
            for b in &names[i + 1..] {
                assert_ne!(a, b);
            }
        }
    }
}
