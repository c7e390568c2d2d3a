use lever_config::{AlertsConfig, ChannelConfig};
use lever_core::{ChannelType, EventBus, LeverError, Result};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::adapter::ChannelAdapter;
use crate::email::EmailChannel;
use crate::retry::RetryPolicy;
use crate::slack::SlackChannel;
use crate::ui::UiChannel;
use crate::webhook::WebhookChannel;

/// One adapter per channel type. Policies name channel *types*; the
/// registry decides which concrete adapter serves each.
#[derive(Default, Clone)]
pub struct ChannelRegistry {
    adapters: HashMap<ChannelType, Arc<dyn ChannelAdapter>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an adapter, replacing any previous one of the same type.
    pub fn register(&mut self, adapter: Arc<dyn ChannelAdapter>) {
        let kind = adapter.channel_type();
        if let Some(prev) = self.adapters.insert(kind, adapter) {
            warn!(channel = %kind, replaced = prev.id(), "channel adapter replaced");
        }
    }

    pub fn get(&self, kind: ChannelType) -> Option<Arc<dyn ChannelAdapter>> {
        self.adapters.get(&kind).cloned()
    }

    pub fn contains(&self, kind: ChannelType) -> bool {
        self.adapters.contains_key(&kind)
    }

    pub fn kinds(&self) -> Vec<ChannelType> {
        let mut kinds: Vec<_> = self.adapters.keys().copied().collect();
        kinds.sort();
        kinds
    }

    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }

    /// Build adapters from `[channels.*]`. The UI channel is always present
    /// since it only needs the event bus.
    pub fn from_config(
        channels: &HashMap<String, ChannelConfig>,
        alerts: &AlertsConfig,
        bus: EventBus,
    ) -> Result<Self> {
        let timeout = Duration::from_secs(alerts.dispatch_timeout_secs);
        let retry = RetryPolicy::new(
            alerts.max_retries,
            Duration::from_millis(alerts.retry_base_delay_ms),
        );

        let mut registry = Self::new();
        registry.register(Arc::new(UiChannel::new("ui", bus.clone())));

        let mut names: Vec<_> = channels.keys().collect();
        names.sort();
        for name in names {
            let cfg = &channels[name];
            if !cfg.enabled {
                info!(channel = %name, "channel disabled, skipping");
                continue;
            }
            let kind = cfg.kind().ok_or_else(|| LeverError::ConfigValidation {
                field: format!("channels.{name}.type"),
                reason: format!("unknown channel type '{}'", cfg.channel_type),
            })?;
            let adapter: Arc<dyn ChannelAdapter> = match kind {
                ChannelType::Ui => Arc::new(UiChannel::new(name.clone(), bus.clone())),
                ChannelType::Webhook => {
                    let mut hook =
                        WebhookChannel::new(name.clone(), require_url(name, cfg)?, timeout, retry)?;
                    if let Some(token) = cfg.setting_str("bearer_token") {
                        hook = hook.with_bearer_token(token);
                    }
                    Arc::new(hook)
                }
                ChannelType::Slack => Arc::new(SlackChannel::new(
                    name.clone(),
                    require_url(name, cfg)?,
                    timeout,
                    retry,
                )?),
                ChannelType::Email => {
                    let from = cfg.setting_str("from").unwrap_or("lever@localhost");
                    let to = recipients(name, cfg)?;
                    Arc::new(EmailChannel::new(
                        name.clone(),
                        require_url(name, cfg)?,
                        from,
                        to,
                        timeout,
                        retry,
                    )?)
                }
            };
            info!(channel = %name, kind = %kind, "channel adapter configured");
            registry.register(adapter);
        }
        Ok(registry)
    }
}

fn require_url<'a>(name: &str, cfg: &'a ChannelConfig) -> Result<&'a str> {
    cfg.url
        .as_deref()
        .filter(|u| !u.is_empty())
        .ok_or_else(|| LeverError::ConfigValidation {
            field: format!("channels.{name}.url"),
            reason: "required for this channel type".into(),
        })
}

fn recipients(name: &str, cfg: &ChannelConfig) -> Result<Vec<String>> {
    let to: Vec<String> = match cfg.settings.get("to") {
        Some(serde_json::Value::String(one)) => vec![one.clone()],
        Some(serde_json::Value::Array(many)) => many
            .iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect(),
        _ => Vec::new(),
    };
    if to.is_empty() {
        return Err(LeverError::ConfigValidation {
            field: format!("channels.{name}.to"),
            reason: "email channel needs at least one recipient".into(),
        });
    }
    Ok(to)
}
