use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::notification::{Notification, NotificationSink, NotifyError};

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// POSTs each notification as JSON to a fixed endpoint. The client
/// carries its own request timeout so a dead listener delays a request
/// by a bounded amount at most.
pub struct WebhookNotifier {
    client: reqwest::Client,
    endpoint: String,
}

impl WebhookNotifier {
    pub fn new(endpoint: impl Into<String>) -> Result<Self, NotifyError> {
        Self::with_timeout(endpoint, DEFAULT_REQUEST_TIMEOUT)
    }

    pub fn with_timeout(
        endpoint: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, NotifyError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| NotifyError::Http(e.to_string()))?;
        Ok(Self { client, endpoint: endpoint.into() })
    }
}

#[async_trait]
impl NotificationSink for WebhookNotifier {
    async fn notify(&self, notification: &Notification) -> Result<(), NotifyError> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(notification)
            .send()
            .await
            .map_err(|e| NotifyError::Http(e.to_string()))?;
        if !response.status().is_success() {
            return Err(NotifyError::Status(response.status().as_u16()));
        }
        debug!(tool = %notification.tool, endpoint = %self.endpoint, "notification delivered");
        Ok(())
    }
}
