use lever_core::{ChannelType, Result};
use std::future::Future;
use std::time::Duration;
use tracing::warn;

use crate::adapter::dispatch_err;

/// Bounded exponential backoff for outbound deliveries.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    /// Delay before the first retry; doubles each time.
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(200),
        }
    }
}

/// Result of one delivery attempt.
#[derive(Debug)]
pub enum Attempt {
    Delivered,
    /// Worth trying again (5xx, 429, timeouts, connection errors).
    Transient(String),
    /// Will not succeed on retry (4xx, bad config).
    Permanent(String),
}

impl Attempt {
    /// Classify an HTTP exchange.
    pub fn from_response(result: std::result::Result<reqwest::Response, reqwest::Error>) -> Self {
        match result {
            Ok(resp) if resp.status().is_success() => Attempt::Delivered,
            Ok(resp) => {
                let status = resp.status();
                let reason = format!("HTTP {}", status.as_u16());
                if status.is_server_error() || status.as_u16() == 429 {
                    Attempt::Transient(reason)
                } else {
                    Attempt::Permanent(reason)
                }
            }
            Err(e) if e.is_timeout() || e.is_connect() || e.is_request() => {
                Attempt::Transient(e.to_string())
            }
            Err(e) => Attempt::Permanent(e.to_string()),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
        }
    }

    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(2u32.saturating_pow(attempt))
    }

    /// Run `op` until it delivers, fails permanently, or retries run out.
    pub async fn run<F, Fut>(&self, channel: ChannelType, mut op: F) -> Result<()>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Attempt>,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Attempt::Delivered => return Ok(()),
                Attempt::Permanent(reason) => return Err(dispatch_err(channel, reason)),
                Attempt::Transient(reason) if attempt < self.max_retries => {
                    let delay = self.delay_for(attempt);
                    warn!(
                        channel = %channel,
                        attempt = attempt + 1,
                        max = self.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %reason,
                        "retrying alert delivery"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Attempt::Transient(reason) => {
                    return Err(dispatch_err(
                        channel,
                        format!("gave up after {} retries: {reason}", self.max_retries),
                    ));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_delay_doubles() {
        let policy = RetryPolicy::new(3, Duration::from_millis(100));
        assert_eq!(policy.delay_for(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(400));
    }

    #[tokio::test]
    async fn test_transient_then_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::new(3, Duration::from_millis(1));
        let c = Arc::clone(&calls);
        let result = policy
            .run(ChannelType::Webhook, move || {
                let c = Arc::clone(&c);
                async move {
                    if c.fetch_add(1, Ordering::SeqCst) < 2 {
                        Attempt::Transient("HTTP 503".into())
                    } else {
                        Attempt::Delivered
                    }
                }
            })
            .await;
        assert!(result.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_retries() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::new(2, Duration::from_millis(1));
        let c = Arc::clone(&calls);
        let err = policy
            .run(ChannelType::Slack, move || {
                c.fetch_add(1, Ordering::SeqCst);
                async { Attempt::Transient("timeout".into()) }
            })
            .await
            .unwrap_err();
        assert_eq!(err.code(), "CHANNEL_DISPATCH_FAILED");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_is_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&calls);
        let result = RetryPolicy::default()
            .run(ChannelType::Email, move || {
                c.fetch_add(1, Ordering::SeqCst);
                async { Attempt::Permanent("HTTP 400".into()) }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
