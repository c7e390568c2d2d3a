use async_trait::async_trait;
use lever_core::{AlertPayload, ChannelType, Result};
use std::time::Duration;
use tracing::debug;

use crate::adapter::{ChannelAdapter, http_client, summary_line};
use crate::retry::{Attempt, RetryPolicy};

/// Slack incoming-webhook adapter.
///
/// Posts `{"text": ...}` with a one-line summary of the alert. Channel
/// routing is decided by the webhook URL itself.
pub struct SlackChannel {
    id: String,
    webhook_url: String,
    client: reqwest::Client,
    retry: RetryPolicy,
}

impl SlackChannel {
    pub fn new(
        id: impl Into<String>,
        webhook_url: impl Into<String>,
        timeout: Duration,
        retry: RetryPolicy,
    ) -> Result<Self> {
        Ok(Self {
            id: id.into(),
            webhook_url: webhook_url.into(),
            client: http_client(timeout)?,
            retry,
        })
    }
}

#[async_trait]
impl ChannelAdapter for SlackChannel {
    fn id(&self) -> &str {
        &self.id
    }

    fn channel_type(&self) -> ChannelType {
        ChannelType::Slack
    }

    async fn send(&self, payload: &AlertPayload) -> Result<()> {
        let body = serde_json::json!({ "text": summary_line(payload) });
        let body = &body;
        self.retry
            .run(ChannelType::Slack, move || async move {
                Attempt::from_response(self.client.post(&self.webhook_url).json(body).send().await)
            })
            .await?;
        debug!(channel = %self.id, run_id = %payload.run_id, "slack message posted");
        Ok(())
    }
}
