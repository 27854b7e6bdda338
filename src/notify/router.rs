//! Category routing with a time-boxed de-duplication cache.
//!
//! Delivery runs on a background task so a slow webhook never holds up the
//! caller; `flush` waits for whatever is still in flight.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

use super::sink::{ChannelSink, NotificationSink};
use super::{Category, ChannelMap, NotificationEvent};
use crate::metrics::MetricsCollector;

/// Identical events inside this window are coalesced.
pub const DEFAULT_DEDUP_WINDOW: Duration = Duration::from_secs(3600);

type SeenKeys = Arc<Mutex<HashMap<(Category, String), Instant>>>;

/// What happened to a routed event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Handed to the sink in the background.
    Dispatched,
    /// An identical event was dispatched inside the window.
    Suppressed,
    /// The category has no channel.
    Dropped,
}

impl RouteOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            RouteOutcome::Dispatched => "dispatched",
            RouteOutcome::Suppressed => "suppressed",
            RouteOutcome::Dropped => "dropped",
        }
    }
}

/// Stateless gateway apart from the short-lived de-duplication cache.
pub struct NotificationRouter {
    channels: ChannelMap,
    sink: Arc<dyn NotificationSink>,
    window: Duration,
    seen: SeenKeys,
    deliveries: TaskTracker,
    metrics: MetricsCollector,
}

impl NotificationRouter {
    pub fn new(channels: ChannelMap) -> Self {
        Self::with_sink(channels, Arc::new(ChannelSink::new()))
    }

    pub fn with_sink(channels: ChannelMap, sink: Arc<dyn NotificationSink>) -> Self {
        Self {
            channels,
            sink,
            window: DEFAULT_DEDUP_WINDOW,
            seen: Arc::new(Mutex::new(HashMap::new())),
            deliveries: TaskTracker::new(),
            metrics: MetricsCollector::new(),
        }
    }

    pub fn with_window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    /// Routes one event without waiting for delivery. Never fails; the
    /// outcome is informational. Must be called inside a Tokio runtime.
    pub fn route(&self, event: NotificationEvent) -> RouteOutcome {
        let channel = self.channels.channel(event.category);
        if channel.is_empty() {
            debug!(category = %event.category, key = %event.key, "No channel configured, dropping");
            return self.record(event.category, RouteOutcome::Dropped);
        }

        let dedup_key = (event.category, event.key.clone());
        if !self.claim(&dedup_key) {
            debug!(category = %event.category, key = %event.key, "Duplicate notification suppressed");
            return self.record(event.category, RouteOutcome::Suppressed);
        }

        let category = event.category;
        let sink = Arc::clone(&self.sink);
        let seen = Arc::clone(&self.seen);
        let channel = channel.to_string();
        let metrics = self.metrics;
        self.deliveries.spawn(async move {
            let result = match sink.deliver(&channel, &event).await {
                Ok(()) => "delivered",
                Err(e) => {
                    warn!(
                        category = %event.category,
                        key = %event.key,
                        title = %event.title,
                        error = %e,
                        "Notification delivery failed, dropping"
                    );
                    // Nothing was delivered, so a later identical event may try again.
                    if let Ok(mut seen) = seen.lock() {
                        seen.remove(&dedup_key);
                    }
                    "failed"
                }
            };
            metrics.record_notification(event.category.as_str(), result);
        });

        self.record(category, RouteOutcome::Dispatched)
    }

    /// Waits for every delivery dispatched so far.
    pub async fn flush(&self) {
        self.deliveries.close();
        self.deliveries.wait().await;
        self.deliveries.reopen();
    }

    fn record(&self, category: Category, outcome: RouteOutcome) -> RouteOutcome {
        self.metrics.record_notification(category.as_str(), outcome.label());
        outcome
    }

    /// Marks the key as dispatched unless it already is within the window.
    fn claim(&self, key: &(Category, String)) -> bool {
        let now = Instant::now();
        let Ok(mut seen) = self.seen.lock() else {
            return true;
        };
        seen.retain(|_, at| now.duration_since(*at) < self.window);
        if seen.contains_key(key) {
            return false;
        }
        seen.insert(key.clone(), now);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::NotifyError;
    use async_trait::async_trait;

    #[derive(Default)]
    struct Recording {
        delivered: Mutex<Vec<(String, NotificationEvent)>>,
        attempts: Mutex<usize>,
        fail: bool,
        delay: Option<Duration>,
    }

    #[async_trait]
    impl NotificationSink for Recording {
        async fn deliver(&self, channel: &str, event: &NotificationEvent) -> Result<(), NotifyError> {
            *self.attempts.lock().unwrap() += 1;
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if self.fail {
                return Err(NotifyError::Rejected {
                    channel: channel.to_string(),
                    status: 500,
                });
            }
            self.delivered
                .lock()
                .unwrap()
                .push((channel.to_string(), event.clone()));
            Ok(())
        }
    }

    fn router(sink: Arc<Recording>) -> NotificationRouter {
        NotificationRouter::with_sink(ChannelMap::default(), sink)
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicates_coalesced_within_window() {
        let sink = Arc::new(Recording::default());
        let router = router(sink.clone());

        let first = router.route(NotificationEvent::scaling("scale", "Scaled up", "3 -> 6"));
        let second = router.route(NotificationEvent::scaling("scale", "Scaled up", "3 -> 6"));
        router.flush().await;

        assert_eq!(first, RouteOutcome::Dispatched);
        assert_eq!(second, RouteOutcome::Suppressed);
        assert_eq!(sink.delivered.lock().unwrap().len(), 1);

        tokio::time::advance(DEFAULT_DEDUP_WINDOW + Duration::from_secs(1)).await;
        let third = router.route(NotificationEvent::scaling("scale", "Scaled up", "3 -> 6"));
        assert_eq!(third, RouteOutcome::Dispatched);
    }

    #[tokio::test]
    async fn test_same_key_different_category_not_coalesced() {
        let sink = Arc::new(Recording::default());
        let router = router(sink.clone());

        router.route(NotificationEvent::health("w1", "a", "b"));
        router.route(NotificationEvent::error("w1", "a", "b"));
        router.flush().await;

        let mut channels: Vec<String> = sink
            .delivered
            .lock()
            .unwrap()
            .iter()
            .map(|(channel, _)| channel.clone())
            .collect();
        channels.sort();
        assert_eq!(channels, vec!["errors", "health"]);
    }

    #[tokio::test]
    async fn test_failed_delivery_releases_the_key() {
        let sink = Arc::new(Recording {
            fail: true,
            ..Default::default()
        });
        let router = router(sink.clone());

        let first = router.route(NotificationEvent::error("k", "t", "b"));
        router.flush().await;
        let second = router.route(NotificationEvent::error("k", "t", "b"));
        router.flush().await;

        assert_eq!(first, RouteOutcome::Dispatched);
        assert_eq!(second, RouteOutcome::Dispatched);
        assert_eq!(*sink.attempts.lock().unwrap(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_sink_does_not_block_route() {
        let sink = Arc::new(Recording {
            delay: Some(Duration::from_secs(10)),
            ..Default::default()
        });
        let router = router(sink.clone());
        let started = Instant::now();

        let outcome = router.route(NotificationEvent::health("w1", "t", "b"));

        assert_eq!(outcome, RouteOutcome::Dispatched);
        assert_eq!(started.elapsed(), Duration::ZERO);
        assert!(sink.delivered.lock().unwrap().is_empty());

        router.flush().await;
        assert_eq!(sink.delivered.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_empty_channel_disables_category() {
        let sink = Arc::new(Recording::default());
        let channels = ChannelMap {
            scaling: String::new(),
            ..Default::default()
        };
        let router = NotificationRouter::with_sink(channels, sink.clone());

        let outcome = router.route(NotificationEvent::scaling("k", "t", "b"));
        router.flush().await;

        assert_eq!(outcome, RouteOutcome::Dropped);
        assert_eq!(*sink.attempts.lock().unwrap(), 0);
    }
}
