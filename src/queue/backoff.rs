//! Exponential backoff for transient broker failures.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use super::broker::QueueError;

/// Backoff schedule: `initial`, doubling, capped at `max_delay`, giving up
/// after `max_attempts` consecutive failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub initial: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            max_attempts: 1000,
        }
    }
}

impl Backoff {
    /// Creates a schedule with the default delays and the given ceiling.
    pub fn with_max_attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Default::default()
        }
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.initial
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Runs `op` until it succeeds, fails permanently, or the ceiling is hit.
    ///
    /// Only `QueueError::BrokerUnavailable` is retried.
    pub async fn retry<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T, QueueError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, QueueError>>,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() => {
                    attempt += 1;
                    if attempt >= self.max_attempts {
                        return Err(QueueError::RetriesExhausted {
                            attempts: attempt,
                            last_error: e.to_string(),
                        });
                    }
                    let delay = self.delay(attempt);
                    warn!(
                        operation = %what,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Broker unavailable, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
