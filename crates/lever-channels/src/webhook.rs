use async_trait::async_trait;
use lever_core::{AlertPayload, ChannelType, Result};
use std::time::Duration;
use tracing::debug;

use crate::adapter::{ChannelAdapter, http_client};
use crate::retry::{Attempt, RetryPolicy};

/// Generic webhook: POSTs the alert payload as JSON, unmodified.
pub struct WebhookChannel {
    id: String,
    url: String,
    bearer_token: Option<String>,
    client: reqwest::Client,
    retry: RetryPolicy,
}

impl WebhookChannel {
    pub fn new(
        id: impl Into<String>,
        url: impl Into<String>,
        timeout: Duration,
        retry: RetryPolicy,
    ) -> Result<Self> {
        Ok(Self {
            id: id.into(),
            url: url.into(),
            bearer_token: None,
            client: http_client(timeout)?,
            retry,
        })
    }

    /// Send `Authorization: Bearer <token>` with every delivery.
    pub fn with_bearer_token(mut self, token: impl Into<String>) -> Self {
        self.bearer_token = Some(token.into());
        self
    }
}

#[async_trait]
impl ChannelAdapter for WebhookChannel {
    fn id(&self) -> &str {
        &self.id
    }

    fn channel_type(&self) -> ChannelType {
        ChannelType::Webhook
    }

    async fn send(&self, payload: &AlertPayload) -> Result<()> {
        self.retry
            .run(ChannelType::Webhook, move || async move {
                let mut req = self.client.post(&self.url).json(payload);
                if let Some(token) = &self.bearer_token {
                    req = req.bearer_auth(token);
                }
                Attempt::from_response(req.send().await)
            })
            .await?;
        debug!(channel = %self.id, run_id = %payload.run_id, "webhook delivered");
        Ok(())
    }
}
