//! Redis-backed broker with reliable dequeue.
//!
//! Every named queue is stored as two Redis lists:
//!
//! - `{queue}`: messages waiting for a consumer
//! - `{queue}:processing`: delivered but unacknowledged messages
//!
//! Messages are published with LPUSH and fetched with BRPOPLPUSH, which moves
//! them atomically into the processing list. If a consumer dies, whatever it
//! held in the processing list is returned by `recover`.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tracing::{debug, info};

use super::broker::{Broker, Delivery, QueueError};

/// Set holding the names of every declared queue.
const DECLARED_QUEUES_KEY: &str = "fleet-forge:queues";

/// Redis broker (handles reconnection through `ConnectionManager`).
#[derive(Clone)]
pub struct RedisBroker {
    redis: ConnectionManager,
}

impl RedisBroker {
    /// Connects to Redis.
    ///
    /// # Arguments
    ///
    /// * `redis_url` - Redis connection URL (e.g., "redis://localhost:6379")
    ///
    /// # Errors
    ///
    /// Returns `QueueError::BrokerUnavailable` if the connection fails.
    pub async fn connect(redis_url: &str) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| QueueError::BrokerUnavailable(e.to_string()))?;

        let redis = ConnectionManager::new(client)
            .await
            .map_err(|e| QueueError::BrokerUnavailable(e.to_string()))?;

        info!(url = %redis_url, "Connected to Redis broker");
        Ok(Self { redis })
    }

    fn processing_key(queue: &str) -> String {
        format!("{}:processing", queue)
    }
}

#[async_trait]
impl Broker for RedisBroker {
    async fn declare(&self, queue: &str, durable: bool) -> Result<(), QueueError> {
        let mut conn = self.redis.clone();

        // Lists are created lazily; a PING proves reachability.
        redis::cmd("PING").query_async::<_, String>(&mut conn).await?;
        conn.sadd::<_, _, ()>(DECLARED_QUEUES_KEY, queue).await?;

        if !durable {
            debug!(queue = %queue, "Non-durable declare; Redis persistence is server-wide");
        }
        Ok(())
    }

    async fn publish(&self, queue: &str, payload: &str) -> Result<(), QueueError> {
        let mut conn = self.redis.clone();
        conn.lpush::<_, _, ()>(queue, payload).await?;
        Ok(())
    }

    async fn fetch(&self, queue: &str, wait: Duration) -> Result<Option<Delivery>, QueueError> {
        let mut conn = self.redis.clone();
        let timeout_secs = wait.as_secs().max(1) as usize;

        let result: Option<String> = redis::cmd("BRPOPLPUSH")
            .arg(queue)
            .arg(Self::processing_key(queue))
            .arg(timeout_secs)
            .query_async(&mut conn)
            .await?;

        Ok(result.map(|payload| Delivery {
            queue: queue.to_string(),
            payload,
        }))
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        let mut conn = self.redis.clone();
        conn.lrem::<_, _, ()>(Self::processing_key(&delivery.queue), 1, &delivery.payload)
            .await?;
        Ok(())
    }

    async fn nack(&self, delivery: &Delivery, requeue: bool) -> Result<(), QueueError> {
        if !requeue {
            return self.ack(delivery).await;
        }
        self.requeue(delivery, &delivery.payload).await
    }

    async fn requeue(&self, delivery: &Delivery, payload: &str) -> Result<(), QueueError> {
        let mut conn = self.redis.clone();

        // RPUSH puts the message at the consuming end for immediate retry.
        let mut pipe = redis::pipe();
        pipe.atomic()
            .lrem(Self::processing_key(&delivery.queue), 1, &delivery.payload)
            .rpush(&delivery.queue, payload);
        pipe.query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }

    async fn depth(&self, queue: &str) -> Result<usize, QueueError> {
        let mut conn = self.redis.clone();
        let len: usize = conn.llen(queue).await?;
        Ok(len)
    }

    async fn peek(&self, queue: &str, limit: usize) -> Result<Vec<String>, QueueError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.redis.clone();
        // Oldest messages sit at the right end of the list.
        let data: Vec<String> = conn.lrange(queue, -(limit as isize), -1).await?;
        Ok(data.into_iter().rev().collect())
    }

    async fn recover(&self, queue: &str) -> Result<usize, QueueError> {
        let mut conn = self.redis.clone();
        let processing = Self::processing_key(queue);
        let stranded: Vec<String> = conn.lrange(&processing, 0, -1).await?;

        let mut recovered = 0;
        for payload in stranded {
            let mut pipe = redis::pipe();
            pipe.atomic()
                .lrem(&processing, 1, &payload)
                .rpush(queue, &payload);
            pipe.query_async::<_, ()>(&mut conn).await?;
            recovered += 1;
        }

        if recovered > 0 {
            info!(queue = %queue, recovered, "Recovered unacknowledged messages");
        }
        Ok(recovered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::broker::TASK_COMPLETION;

    #[test]
    fn test_processing_key() {
        assert_eq!(
            RedisBroker::processing_key(TASK_COMPLETION),
            "task.completion:processing"
        );
    }

    #[tokio::test]
    #[ignore] // Run with: REDIS_URL=redis://localhost:6379 cargo test -- --ignored
    async fn test_fetch_ack_roundtrip_against_redis() {
        let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379".into());
        let broker = RedisBroker::connect(&url).await.expect("redis should be reachable");
        let queue = format!("test.{}", uuid::Uuid::new_v4());

        broker.declare(&queue, true).await.unwrap();
        broker.publish(&queue, r#"{"n":1}"#).await.unwrap();
        assert_eq!(broker.depth(&queue).await.unwrap(), 1);

        let delivery = broker
            .fetch(&queue, Duration::from_secs(1))
            .await
            .unwrap()
            .expect("message should be delivered");
        assert_eq!(broker.depth(&queue).await.unwrap(), 0);

        broker.ack(&delivery).await.unwrap();
        assert_eq!(broker.recover(&queue).await.unwrap(), 0);
    }
}
