#[cfg(test)]
mod tests {
    use axum::{Json, Router, extract::State, http::StatusCode, routing::post};
    use chrono::Utc;
    use lever_channels::*;
    use lever_config::{AlertsConfig, ChannelConfig};
    use lever_core::{AlertPayload, ChannelType, EventBus, LeverEvent, Metric, SignalType};
    use parking_lot::Mutex;
    use serde_json::Value;
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    /// Local HTTP endpoint recording every JSON body it receives. The first
    /// `failures` requests are answered with `fail_status`.
    #[derive(Clone)]
    struct Capture {
        bodies: Arc<Mutex<Vec<Value>>>,
        headers: Arc<Mutex<Vec<Option<String>>>>,
        failures: Arc<AtomicU32>,
        fail_status: StatusCode,
    }

    impl Capture {
        fn new(failures: u32, fail_status: StatusCode) -> Self {
            Self {
                bodies: Arc::new(Mutex::new(Vec::new())),
                headers: Arc::new(Mutex::new(Vec::new())),
                failures: Arc::new(AtomicU32::new(failures)),
                fail_status,
            }
        }

        fn hits(&self) -> usize {
            self.bodies.lock().len()
        }
    }

    async fn capture(
        State(cap): State<Capture>,
        headers: axum::http::HeaderMap,
        Json(body): Json<Value>,
    ) -> StatusCode {
        cap.bodies.lock().push(body);
        cap.headers.lock().push(
            headers
                .get("authorization")
                .and_then(|v| v.to_str().ok())
                .map(str::to_string),
        );
        let left = cap.failures.load(Ordering::SeqCst);
        if left > 0 {
            cap.failures.store(left - 1, Ordering::SeqCst);
            return cap.fail_status;
        }
        StatusCode::OK
    }

    async fn serve(cap: Capture) -> String {
        let app = Router::new().route("/hook", post(capture)).with_state(cap);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}/hook")
    }

    fn payload(signal_type: SignalType) -> AlertPayload {
        AlertPayload {
            run_id: uuid::Uuid::new_v4(),
            policy_id: "p-cost".into(),
            metric: Metric::Cost,
            observed: 2.1,
            threshold: 2.0,
            signal_type,
            timestamp: Utc::now(),
        }
    }

    fn fast_retry(max: u32) -> RetryPolicy {
        RetryPolicy::new(max, Duration::from_millis(5))
    }

    #[tokio::test]
    async fn test_webhook_posts_payload() {
        let cap = Capture::new(0, StatusCode::OK);
        let url = serve(cap.clone()).await;
        let hook = WebhookChannel::new("ops", url, Duration::from_secs(5), fast_retry(0))
            .unwrap()
            .with_bearer_token("s3cret");
        let p = payload(SignalType::Breach);
        hook.send(&p).await.unwrap();

        let bodies = cap.bodies.lock();
        assert_eq!(bodies.len(), 1);
        assert_eq!(bodies[0]["policy_id"], "p-cost");
        assert_eq!(bodies[0]["metric"], "cost");
        assert_eq!(bodies[0]["signal_type"], "BREACH");
        assert_eq!(bodies[0]["run_id"], p.run_id.to_string());
        assert_eq!(cap.headers.lock()[0].as_deref(), Some("Bearer s3cret"));
    }

    #[tokio::test]
    async fn test_slack_posts_summary_text() {
        let cap = Capture::new(0, StatusCode::OK);
        let url = serve(cap.clone()).await;
        let slack = SlackChannel::new("slack", url, Duration::from_secs(5), fast_retry(0)).unwrap();
        slack.send(&payload(SignalType::Near)).await.unwrap();

        let text = cap.bodies.lock()[0]["text"].as_str().unwrap().to_string();
        assert!(text.starts_with("[NEAR] cost near limit: reached 2.1"));
    }

    #[tokio::test]
    async fn test_email_relay_message() {
        let cap = Capture::new(0, StatusCode::OK);
        let url = serve(cap.clone()).await;
        let email = EmailChannel::new(
            "mail",
            url,
            "lever@example.com",
            vec!["oncall@example.com".into()],
            Duration::from_secs(5),
            fast_retry(0),
        )
        .unwrap();
        email.send(&payload(SignalType::Breach)).await.unwrap();

        let bodies = cap.bodies.lock();
        assert_eq!(bodies[0]["to"][0], "oncall@example.com");
        assert_eq!(bodies[0]["from"], "lever@example.com");
        assert!(bodies[0]["subject"].as_str().unwrap().contains("cost breach"));
    }

    #[tokio::test]
    async fn test_retries_server_errors_then_succeeds() {
        let cap = Capture::new(2, StatusCode::INTERNAL_SERVER_ERROR);
        let url = serve(cap.clone()).await;
        let hook = WebhookChannel::new("ops", url, Duration::from_secs(5), fast_retry(3)).unwrap();
        hook.send(&payload(SignalType::Breach)).await.unwrap();
        assert_eq!(cap.hits(), 3);
    }

    #[tokio::test]
    async fn test_client_error_is_not_retried() {
        let cap = Capture::new(5, StatusCode::BAD_REQUEST);
        let url = serve(cap.clone()).await;
        let hook = WebhookChannel::new("ops", url, Duration::from_secs(5), fast_retry(3)).unwrap();
        let err = hook.send(&payload(SignalType::Breach)).await.unwrap_err();
        assert_eq!(err.code(), "CHANNEL_DISPATCH_FAILED");
        assert!(err.to_string().contains("400"));
        assert_eq!(cap.hits(), 1);
    }

    #[tokio::test]
    async fn test_retries_exhausted() {
        let cap = Capture::new(10, StatusCode::SERVICE_UNAVAILABLE);
        let url = serve(cap.clone()).await;
        let slack = SlackChannel::new("slack", url, Duration::from_secs(5), fast_retry(2)).unwrap();
        assert!(slack.send(&payload(SignalType::Breach)).await.is_err());
        assert_eq!(cap.hits(), 3);
    }

    #[tokio::test]
    async fn test_ui_channel_publishes_alert_event() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();
        let ui = UiChannel::new("ui", bus);
        let p = payload(SignalType::Near);
        ui.send(&p).await.unwrap();
        match rx.recv().await.unwrap() {
            LeverEvent::Alert { payload } => assert_eq!(payload, p),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_ui_channel_without_subscribers() {
        let ui = UiChannel::new("ui", EventBus::new(4));
        assert!(ui.send(&payload(SignalType::Near)).await.is_ok());
    }

    fn channel(kind: &str, url: Option<&str>, extra: &[(&str, Value)]) -> ChannelConfig {
        ChannelConfig {
            channel_type: kind.into(),
            enabled: true,
            url: url.map(str::to_string),
            settings: extra
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect(),
        }
    }

    #[test]
    fn test_registry_from_config() {
        let mut channels = HashMap::new();
        channels.insert(
            "ops-hook".to_string(),
            channel("webhook", Some("http://127.0.0.1:9/hook"), &[]),
        );
        channels.insert(
            "mail".to_string(),
            channel(
                "email",
                Some("http://127.0.0.1:9/send"),
                &[("to", serde_json::json!(["a@example.com", "b@example.com"]))],
            ),
        );
        let mut off = channel("slack", Some("http://127.0.0.1:9/slack"), &[]);
        off.enabled = false;
        channels.insert("slack".to_string(), off);

        let registry =
            ChannelRegistry::from_config(&channels, &AlertsConfig::default(), EventBus::new(8))
                .unwrap();
        assert_eq!(
            registry.kinds(),
            vec![ChannelType::Ui, ChannelType::Webhook, ChannelType::Email]
        );
        assert_eq!(registry.get(ChannelType::Webhook).unwrap().id(), "ops-hook");
        assert!(!registry.contains(ChannelType::Slack));
    }

    #[test]
    fn test_registry_rejects_missing_url() {
        let mut channels = HashMap::new();
        channels.insert("hook".to_string(), channel("webhook", None, &[]));
        let err =
            ChannelRegistry::from_config(&channels, &AlertsConfig::default(), EventBus::new(8))
                .err()
                .unwrap();
        assert_eq!(err.code(), "CONFIG_ERROR");
        assert!(err.to_string().contains("channels.hook.url"));
    }

    #[test]
    fn test_registry_rejects_email_without_recipients() {
        let mut channels = HashMap::new();
        channels.insert(
            "mail".to_string(),
            channel("email", Some("http://127.0.0.1:9/send"), &[]),
        );
        assert!(
            ChannelRegistry::from_config(&channels, &AlertsConfig::default(), EventBus::new(8))
                .is_err()
        );
    }

    #[test]
    fn test_register_replaces_same_type() {
        let bus = EventBus::new(4);
        let mut registry = ChannelRegistry::new();
        registry.register(Arc::new(UiChannel::new("first", bus.clone())));
        registry.register(Arc::new(UiChannel::new("second", bus)));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get(ChannelType::Ui).unwrap().id(), "second");
    }
}
