//! In-process broker with the same delivery semantics as the Redis broker.
//!
//! Used by the test suite in place of Redis. Messages live only as long as
//! the process.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};

use super::broker::{Broker, Delivery, QueueError};

#[derive(Debug, Default)]
struct QueueState {
    /// Front is the next message to deliver.
    ready: VecDeque<String>,
    unacked: Vec<String>,
}

/// In-memory broker. Queues must be declared before use.
#[derive(Debug, Default)]
pub struct MemoryBroker {
    queues: Mutex<HashMap<String, QueueState>>,
    published: Notify,
}

impl MemoryBroker {
    /// Creates an empty broker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of delivered but unacknowledged messages on a queue.
    pub async fn unacked(&self, queue: &str) -> usize {
        let queues = self.queues.lock().await;
        queues.get(queue).map(|q| q.unacked.len()).unwrap_or(0)
    }

    /// Drains every waiting message from a queue.
    pub async fn drain(&self, queue: &str) -> Vec<String> {
        let mut queues = self.queues.lock().await;
        queues
            .get_mut(queue)
            .map(|q| q.ready.drain(..).collect())
            .unwrap_or_default()
    }

    fn remove_unacked(state: &mut QueueState, payload: &str) {
        if let Some(pos) = state.unacked.iter().position(|p| p == payload) {
            state.unacked.remove(pos);
        }
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn declare(&self, queue: &str, _durable: bool) -> Result<(), QueueError> {
        let mut queues = self.queues.lock().await;
        queues.entry(queue.to_string()).or_default();
        Ok(())
    }

    async fn publish(&self, queue: &str, payload: &str) -> Result<(), QueueError> {
        {
            let mut queues = self.queues.lock().await;
            let state = queues
                .get_mut(queue)
                .ok_or_else(|| QueueError::UndeclaredQueue(queue.to_string()))?;
            state.ready.push_back(payload.to_string());
        }
        self.published.notify_waiters();
        Ok(())
    }

    async fn fetch(&self, queue: &str, wait: Duration) -> Result<Option<Delivery>, QueueError> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            // Register interest before checking so a concurrent publish is not missed.
            let notified = self.published.notified();
            {
                let mut queues = self.queues.lock().await;
                let state = queues
                    .get_mut(queue)
                    .ok_or_else(|| QueueError::UndeclaredQueue(queue.to_string()))?;
                if let Some(payload) = state.ready.pop_front() {
                    state.unacked.push(payload.clone());
                    return Ok(Some(Delivery {
                        queue: queue.to_string(),
                        payload,
                    }));
                }
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        let mut queues = self.queues.lock().await;
        if let Some(state) = queues.get_mut(&delivery.queue) {
            Self::remove_unacked(state, &delivery.payload);
        }
        Ok(())
    }

    async fn nack(&self, delivery: &Delivery, requeue: bool) -> Result<(), QueueError> {
        if requeue {
            self.requeue(delivery, &delivery.payload).await
        } else {
            self.ack(delivery).await
        }
    }

    async fn requeue(&self, delivery: &Delivery, payload: &str) -> Result<(), QueueError> {
        {
            let mut queues = self.queues.lock().await;
            let state = queues
                .get_mut(&delivery.queue)
                .ok_or_else(|| QueueError::UndeclaredQueue(delivery.queue.clone()))?;
            Self::remove_unacked(state, &delivery.payload);
            state.ready.push_front(payload.to_string());
        }
        self.published.notify_waiters();
        Ok(())
    }

    async fn depth(&self, queue: &str) -> Result<usize, QueueError> {
        let queues = self.queues.lock().await;
        queues
            .get(queue)
            .map(|q| q.ready.len())
            .ok_or_else(|| QueueError::UndeclaredQueue(queue.to_string()))
    }

    async fn peek(&self, queue: &str, limit: usize) -> Result<Vec<String>, QueueError> {
        let queues = self.queues.lock().await;
        let state = queues
            .get(queue)
            .ok_or_else(|| QueueError::UndeclaredQueue(queue.to_string()))?;
        Ok(state.ready.iter().take(limit).cloned().collect())
    }

    async fn recover(&self, queue: &str) -> Result<usize, QueueError> {
        let recovered = {
            let mut queues = self.queues.lock().await;
            let state = queues
                .get_mut(queue)
                .ok_or_else(|| QueueError::UndeclaredQueue(queue.to_string()))?;
            let stranded: Vec<String> = state.unacked.drain(..).collect();
            let count = stranded.len();
            for payload in stranded.into_iter().rev() {
                state.ready.push_front(payload);
            }
            count
        };
        if recovered > 0 {
            self.published.notify_waiters();
        }
        Ok(recovered)
    }
}
