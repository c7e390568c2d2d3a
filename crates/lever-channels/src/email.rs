use async_trait::async_trait;
use lever_core::{AlertPayload, ChannelType, Result};
use serde::Serialize;
use std::time::Duration;
use tracing::debug;

use crate::adapter::{ChannelAdapter, http_client, summary_line};
use crate::retry::{Attempt, RetryPolicy};

/// Message handed to the mail relay.
#[derive(Debug, Serialize)]
struct RelayMessage<'a> {
    to: &'a [String],
    from: &'a str,
    subject: String,
    text: String,
}

/// Email via an HTTP mail relay (any service accepting a JSON message).
pub struct EmailChannel {
    id: String,
    relay_url: String,
    from: String,
    to: Vec<String>,
    client: reqwest::Client,
    retry: RetryPolicy,
}

impl EmailChannel {
    pub fn new(
        id: impl Into<String>,
        relay_url: impl Into<String>,
        from: impl Into<String>,
        to: Vec<String>,
        timeout: Duration,
        retry: RetryPolicy,
    ) -> Result<Self> {
        Ok(Self {
            id: id.into(),
            relay_url: relay_url.into(),
            from: from.into(),
            to,
            client: http_client(timeout)?,
            retry,
        })
    }
}

fn subject(payload: &AlertPayload) -> String {
    format!(
        "[lever] {} {} on run {}",
        payload.metric,
        payload.signal_type.as_str().to_ascii_lowercase(),
        payload.run_id
    )
}

fn body_text(payload: &AlertPayload) -> String {
    format!(
        "{}\n\nRun:       {}\nPolicy:    {}\nMetric:    {}\nObserved:  {}\nThreshold: {}\nAt:        {}\n",
        summary_line(payload),
        payload.run_id,
        payload.policy_id,
        payload.metric,
        payload.observed,
        payload.threshold,
        payload.timestamp.to_rfc3339(),
    )
}

#[async_trait]
impl ChannelAdapter for EmailChannel {
    fn id(&self) -> &str {
        &self.id
    }

    fn channel_type(&self) -> ChannelType {
        ChannelType::Email
    }

    async fn send(&self, payload: &AlertPayload) -> Result<()> {
        let message = RelayMessage {
            to: &self.to,
            from: &self.from,
            subject: subject(payload),
            text: body_text(payload),
        };
        let message = &message;
        self.retry
            .run(ChannelType::Email, move || async move {
                Attempt::from_response(self.client.post(&self.relay_url).json(message).send().await)
            })
            .await?;
        debug!(channel = %self.id, recipients = self.to.len(), "alert email relayed");
        Ok(())
    }
}
