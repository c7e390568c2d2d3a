use async_trait::async_trait;
use lever_core::{AlertPayload, ChannelType, LeverError, Result};
use std::time::Duration;

/// Trait implemented by each alert channel adapter.
#[async_trait]
pub trait ChannelAdapter: Send + Sync {
    /// Instance name, e.g. the `[channels.<name>]` key.
    fn id(&self) -> &str;

    fn channel_type(&self) -> ChannelType;

    /// Deliver one alert. Retries happen inside; an `Err` is final.
    async fn send(&self, payload: &AlertPayload) -> Result<()>;
}

/// One-line human summary of an alert.
pub fn summary_line(payload: &AlertPayload) -> String {
    format!(
        "[{}] {} {} reached {} (threshold {}) on run {} under policy {}",
        payload.signal_type,
        payload.metric,
        if payload.signal_type == lever_core::SignalType::Breach {
            "breach:"
        } else {
            "near limit:"
        },
        trim_float(payload.observed),
        trim_float(payload.threshold),
        payload.run_id,
        payload.policy_id,
    )
}

fn trim_float(v: f64) -> String {
    let s = format!("{v:.4}");
    let s = s.trim_end_matches('0').trim_end_matches('.');
    s.to_string()
}

pub(crate) fn http_client(timeout: Duration) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| LeverError::Config(format!("failed to build HTTP client: {e}")))
}

pub(crate) fn dispatch_err(channel: ChannelType, reason: impl Into<String>) -> LeverError {
    LeverError::ChannelDispatch {
        channel: channel.to_string(),
        reason: reason.into(),
    }
}
