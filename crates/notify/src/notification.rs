use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use thiserror::Error;
use tracing::debug;

use toolgate_policy::NotifyTrigger;

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("notification transport error: {0}")]
    Http(String),
    #[error("notification endpoint returned status {0}")]
    Status(u16),
}

/// Payload pushed to external listeners when a tool outcome matches one
/// of the tool's subscribed triggers.
#[derive(Debug, Clone, Serialize)]
pub struct Notification {
    pub tool: String,
    pub trigger: NotifyTrigger,
    pub summary: String,
    pub request_id: String,
    pub timestamp: String,
}

impl Notification {
    pub fn new(
        tool: impl Into<String>,
        trigger: NotifyTrigger,
        summary: impl Into<String>,
        request_id: impl Into<String>,
    ) -> Self {
        Self {
            tool: tool.into(),
            trigger,
            summary: summary.into(),
            request_id: request_id.into(),
            timestamp: Utc::now().to_rfc3339(),
        }
    }
}

/// Push channel for tool outcomes. Delivery is best effort; the engine
/// logs failures and moves on.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify(&self, notification: &Notification) -> Result<(), NotifyError>;
}

/// Sink used when no webhook is configured. Accepts everything.
pub struct NullNotifier;

#[async_trait]
impl NotificationSink for NullNotifier {
    async fn notify(&self, notification: &Notification) -> Result<(), NotifyError> {
        debug!(tool = %notification.tool, "no notification sink configured, dropping");
        Ok(())
    }
}
