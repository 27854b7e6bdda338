//! Queue contract shared by the coordinator, the controller and the workers.
//!
//! Queues are durable and named (`task.intake`, `task.completion`,
//! `task.deadletter`, `task.results`). Delivery is at-least-once with manual
//! acknowledgement; a bounded retry counter carried in the message body sends
//! poison messages to the dead-letter queue.

pub mod backoff;
pub mod broker;
pub mod consumer;
pub mod memory;
pub mod message;
pub mod redis_broker;

pub use backoff::Backoff;
pub use broker::{
    Broker, Delivery, QueueError, TASK_COMPLETION, TASK_DEADLETTER, TASK_INTAKE, TASK_RESULTS,
};
pub use consumer::{
    ConsumeOptions, Consumer, ConsumerStats, DeliveryOutcome, Disposition, MessageHandler,
    ProcessingError, DEFAULT_MAX_RETRIES,
};
pub use memory::MemoryBroker;
pub use message::{CompletionMessage, CompletionStatus, Envelope, ResultRecord, TaskMessage};
pub use redis_broker::RedisBroker;
