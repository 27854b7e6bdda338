//! Notification routing for orchestration events.
//!
//! Events are classified into four categories, each mapped to its own external
//! channel. Identical `(category, key)` events inside the de-duplication window
//! are coalesced, and a failed delivery is logged and dropped; notification
//! trouble never reaches the coordinator or the controller.

pub mod router;
pub mod sink;

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use router::{NotificationRouter, RouteOutcome, DEFAULT_DEDUP_WINDOW};
pub use sink::{ChannelSink, NotificationSink};

/// Event category. Each category has a distinct channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Scaling,
    Health,
    TaskCompletion,
    Error,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Scaling => "scaling",
            Category::Health => "health",
            Category::TaskCompletion => "task_completion",
            Category::Error => "error",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Channel-agnostic notification payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationEvent {
    pub category: Category,
    /// De-duplication key within the category.
    pub key: String,
    pub title: String,
    pub body: String,
    pub timestamp: DateTime<Utc>,
}

impl NotificationEvent {
    pub fn new(
        category: Category,
        key: impl Into<String>,
        title: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            category,
            key: key.into(),
            title: title.into(),
            body: body.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn scaling(key: impl Into<String>, title: impl Into<String>, body: impl Into<String>) -> Self {
        Self::new(Category::Scaling, key, title, body)
    }

    pub fn health(key: impl Into<String>, title: impl Into<String>, body: impl Into<String>) -> Self {
        Self::new(Category::Health, key, title, body)
    }

    pub fn task_completion(
        key: impl Into<String>,
        title: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self::new(Category::TaskCompletion, key, title, body)
    }

    pub fn error(key: impl Into<String>, title: impl Into<String>, body: impl Into<String>) -> Self {
        Self::new(Category::Error, key, title, body)
    }
}

/// Channel assignment per category.
///
/// A channel beginning with `http://` or `https://` is a webhook; anything else
/// names a log channel. An empty channel disables the category.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelMap {
    pub scaling: String,
    pub health: String,
    pub task_completion: String,
    pub error: String,
}

impl Default for ChannelMap {
    fn default() -> Self {
        Self {
            scaling: "scaling".to_string(),
            health: "health".to_string(),
            task_completion: "tasks".to_string(),
            error: "errors".to_string(),
        }
    }
}

impl ChannelMap {
    pub fn channel(&self, category: Category) -> &str {
        match category {
            Category::Scaling => &self.scaling,
            Category::Health => &self.health,
            Category::TaskCompletion => &self.task_completion,
            Category::Error => &self.error,
        }
    }
}

/// Errors from a single delivery attempt.
#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("Webhook request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Webhook {channel} rejected notification with status {status}")]
    Rejected { channel: String, status: u16 },
}
