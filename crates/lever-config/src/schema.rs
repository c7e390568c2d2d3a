use chrono::{DateTime, Utc};
use lever_core::{
    AggregateWindow, AlertConfig, BindingMoment, ChannelType, ConflictStrategy, EnforcementAction,
    Limit, Metric, MonitorConfig, Policy, PolicyPrecedence, PolicyScope,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;

/// Id under which the configured fallback policy is reported.
pub const DEFAULT_POLICY_ID: &str = "__default__";

/// Root configuration, maps to `lever.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LeverConfig {
    pub store: StoreConfig,
    pub server: ServerConfig,
    pub logging: LoggingConfig,
    pub evaluator: EvaluatorConfig,
    pub audit: AuditConfig,
    pub alerts: AlertsConfig,
    pub default_policy: DefaultPolicyConfig,
    pub channels: HashMap<String, ChannelConfig>,
}

// ── Store ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Path to the SQLite database holding policies and the audit trail.
    pub db_path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("lever.db"),
        }
    }
}

// ── Server ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// HTTP listen address.
    pub listen: String,
    /// Optional bearer token required on `/api/v1/*`.
    pub api_key: Option<String>,
    /// Enable permissive CORS.
    pub cors: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:3710".into(),
            api_key: None,
            cors: false,
        }
    }
}

// ── Logging ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    pub level: String,
    /// Output format: "pretty", "json", "compact".
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "pretty".into(),
        }
    }
}

// ── Evaluator ──────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EvaluatorConfig {
    /// Near ratio applied to configured limits that do not set their own.
    pub default_near_ratio: f64,
}

impl Default for EvaluatorConfig {
    fn default() -> Self {
        Self {
            default_near_ratio: lever_core::policy::DEFAULT_NEAR_RATIO,
        }
    }
}

// ── Audit ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    /// Pending audit writes buffered before new ones are dropped.
    pub queue_capacity: usize,
    /// Attempts per record after the first failure.
    pub max_retries: u32,
    /// First backoff delay; doubles on each retry.
    pub base_delay_ms: u64,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 4096,
            max_retries: 5,
            base_delay_ms: 50,
        }
    }
}

// ── Alerts ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertsConfig {
    /// Channels used by the fallback policy.
    pub channels: BTreeSet<ChannelType>,
    pub max_alerts_per_run: u32,
    pub min_interval_secs: u64,
    /// Per-request timeout for outbound channel adapters.
    pub dispatch_timeout_secs: u64,
    /// Adapter-level retries before a dispatch is reported as failed.
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
}

impl Default for AlertsConfig {
    fn default() -> Self {
        let defaults = AlertConfig::default();
        Self {
            channels: defaults.channels,
            max_alerts_per_run: defaults.max_alerts_per_run,
            min_interval_secs: defaults.min_interval_secs,
            dispatch_timeout_secs: 10,
            max_retries: 3,
            retry_base_delay_ms: 200,
        }
    }
}

impl AlertsConfig {
    pub fn to_alert_config(&self) -> AlertConfig {
        AlertConfig {
            channels: self.channels.clone(),
            max_alerts_per_run: self.max_alerts_per_run,
            min_interval_secs: self.min_interval_secs,
        }
    }
}

// ── Default policy ─────────────────────────────────────────────

/// A limit as written in `lever.toml`. `near_ratio` falls back to
/// `[evaluator] default_near_ratio`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LimitConfig {
    pub metric: Metric,
    pub threshold: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub near_ratio: Option<f64>,
    #[serde(default = "default_action")]
    pub action: EnforcementAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aggregate: Option<AggregateWindow>,
}

impl LimitConfig {
    pub fn to_limit(&self, default_near_ratio: f64) -> Limit {
        Limit {
            metric: self.metric,
            threshold: self.threshold,
            near_ratio: self.near_ratio.unwrap_or(default_near_ratio),
            action: self.action,
            aggregate: self.aggregate,
        }
    }
}

fn default_action() -> EnforcementAction {
    EnforcementAction::Alert
}

/// The policy applied to runs no administrator policy matches.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DefaultPolicyConfig {
    /// When false, unmatched runs are refused at engine start-up.
    pub enabled: bool,
    pub name: String,
    pub priority: u32,
    pub strategy: ConflictStrategy,
    pub binding_moment: BindingMoment,
    pub monitor: MonitorConfig,
    pub limits: Vec<LimitConfig>,
}

impl Default for DefaultPolicyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            name: "default".into(),
            priority: u32::MAX,
            strategy: ConflictStrategy::MostRestrictive,
            binding_moment: BindingMoment::RunStart,
            monitor: MonitorConfig::default(),
            limits: vec![],
        }
    }
}

impl DefaultPolicyConfig {
    /// Materialize the fallback policy for one tenant.
    pub fn policy_for(
        &self,
        tenant: &str,
        default_near_ratio: f64,
        alerts: AlertConfig,
        created_at: DateTime<Utc>,
    ) -> Policy {
        Policy {
            id: DEFAULT_POLICY_ID.into(),
            version: 0,
            name: self.name.clone(),
            scope: PolicyScope::all_runs(tenant),
            precedence: PolicyPrecedence {
                priority: self.priority,
                strategy: self.strategy,
                binding_moment: self.binding_moment,
            },
            monitor: self.monitor.clone(),
            limits: self
                .limits
                .iter()
                .map(|l| l.to_limit(default_near_ratio))
                .collect(),
            alerts,
            created_at,
        }
    }
}

// ── Channels ───────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Adapter type: "ui", "webhook", "slack" or "email".
    #[serde(rename = "type")]
    pub channel_type: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Target endpoint for HTTP-based adapters.
    #[serde(default)]
    pub url: Option<String>,
    /// Adapter-specific settings (recipients, headers, etc.)
    #[serde(flatten)]
    pub settings: HashMap<String, serde_json::Value>,
}

impl ChannelConfig {
    pub fn kind(&self) -> Option<ChannelType> {
        match self.channel_type.to_ascii_lowercase().as_str() {
            "ui" => Some(ChannelType::Ui),
            "webhook" => Some(ChannelType::Webhook),
            "slack" => Some(ChannelType::Slack),
            "email" => Some(ChannelType::Email),
            _ => None,
        }
    }

    pub fn setting_str(&self, key: &str) -> Option<&str> {
        self.settings.get(key).and_then(|v| v.as_str())
    }
}

fn default_true() -> bool {
    true
}

// ── Validation ─────────────────────────────────────────────────

/// A single config validation issue.
#[derive(Debug)]
pub struct ConfigWarning {
    pub field: String,
    pub message: String,
    pub severity: WarningSeverity,
    pub hint: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WarningSeverity {
    Error,
    Warning,
}

impl std::fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tag = match self.severity {
            WarningSeverity::Error => "error",
            WarningSeverity::Warning => "warning",
        };
        write!(f, "{}: {}: {}", tag, self.field, self.message)?;
        if let Some(ref h) = self.hint {
            write!(f, " ({})", h)?;
        }
        Ok(())
    }
}

impl LeverConfig {
    /// The fallback policy for `tenant`, if one is configured.
    pub fn default_policy_for(&self, tenant: &str, created_at: DateTime<Utc>) -> Option<Policy> {
        self.default_policy.enabled.then(|| {
            self.default_policy.policy_for(
                tenant,
                self.evaluator.default_near_ratio,
                self.alerts.to_alert_config(),
                created_at,
            )
        })
    }

    /// Validate the config and return a list of warnings.
    /// Returns `Err` with all messages joined if any severity is Error.
    pub fn validate(&self) -> Result<Vec<ConfigWarning>, String> {
        let mut warnings = Vec::new();

        // ── Near ratio ───
        let ratio = self.evaluator.default_near_ratio;
        if !ratio.is_finite() || ratio <= 0.0 || ratio > 1.0 {
            warnings.push(ConfigWarning {
                field: "evaluator.default_near_ratio".into(),
                message: format!("near ratio {} is out of range", ratio),
                severity: WarningSeverity::Error,
                hint: Some("Must satisfy 0 < ratio <= 1, e.g. 0.8".into()),
            });
        }

        // ── Server listen address ───
        if self.server.listen.is_empty() {
            warnings.push(ConfigWarning {
                field: "server.listen".into(),
                message: "listen address is empty".into(),
                severity: WarningSeverity::Error,
                hint: Some("Set to e.g. '127.0.0.1:3710'".into()),
            });
        } else if self.server.listen.starts_with("0.0.0.0") && self.server.api_key.is_none() {
            warnings.push(ConfigWarning {
                field: "server.api_key".into(),
                message: "no API key set while server is network-accessible".into(),
                severity: WarningSeverity::Warning,
                hint: Some("Set server.api_key to protect the admin API".into()),
            });
        }

        // ── Default policy ───
        if !self.default_policy.enabled {
            warnings.push(ConfigWarning {
                field: "default_policy.enabled".into(),
                message: "no default policy: runs matching no policy would be unscoped".into(),
                severity: WarningSeverity::Error,
                hint: Some("Enable [default_policy] so every run has a binding policy".into()),
            });
        }
        let mut seen = BTreeSet::new();
        for limit in &self.default_policy.limits {
            let field = format!("default_policy.limits.{}", limit.metric);
            if !limit.threshold.is_finite() || limit.threshold <= 0.0 {
                warnings.push(ConfigWarning {
                    field: field.clone(),
                    message: format!("threshold {} must be positive", limit.threshold),
                    severity: WarningSeverity::Error,
                    hint: None,
                });
            }
            if let Some(r) = limit.near_ratio {
                if !r.is_finite() || r <= 0.0 || r > 1.0 {
                    warnings.push(ConfigWarning {
                        field: field.clone(),
                        message: format!("near ratio {} is out of range", r),
                        severity: WarningSeverity::Error,
                        hint: None,
                    });
                }
            }
            if !seen.insert(limit.metric) {
                warnings.push(ConfigWarning {
                    field,
                    message: "duplicate limit for metric".into(),
                    severity: WarningSeverity::Error,
                    hint: Some("A policy carries at most one limit per metric".into()),
                });
            }
        }
        if self.default_policy.enabled && self.default_policy.limits.is_empty() {
            warnings.push(ConfigWarning {
                field: "default_policy.limits".into(),
                message: "default policy has no limits; unmatched runs are only monitored".into(),
                severity: WarningSeverity::Warning,
                hint: None,
            });
        }

        // ── Audit ───
        if self.audit.queue_capacity == 0 {
            warnings.push(ConfigWarning {
                field: "audit.queue_capacity".into(),
                message: "queue capacity is 0".into(),
                severity: WarningSeverity::Error,
                hint: Some("Set to e.g. 4096".into()),
            });
        }

        // ── Logging ───
        let valid_formats = ["pretty", "json", "compact"];
        if !valid_formats.contains(&self.logging.format.as_str()) {
            warnings.push(ConfigWarning {
                field: "logging.format".into(),
                message: format!("unknown log format '{}'", self.logging.format),
                severity: WarningSeverity::Warning,
                hint: Some(format!("Valid values: {}", valid_formats.join(", "))),
            });
        }
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            warnings.push(ConfigWarning {
                field: "logging.level".into(),
                message: format!("unknown log level '{}'", self.logging.level),
                severity: WarningSeverity::Warning,
                hint: Some(format!("Valid values: {}", valid_levels.join(", "))),
            });
        }

        // ── Channels ───
        for (id, ch) in &self.channels {
            match ch.kind() {
                None => warnings.push(ConfigWarning {
                    field: format!("channels.{}.type", id),
                    message: format!("unknown channel type '{}'", ch.channel_type),
                    severity: WarningSeverity::Error,
                    hint: Some("Supported: ui, webhook, slack, email".into()),
                }),
                Some(ChannelType::Ui) => {}
                Some(_) if ch.enabled && ch.url.as_deref().map_or(true, str::is_empty) => {
                    warnings.push(ConfigWarning {
                        field: format!("channels.{}.url", id),
                        message: "enabled channel has no url".into(),
                        severity: WarningSeverity::Error,
                        hint: None,
                    })
                }
                Some(_) => {}
            }
        }

        let errors: Vec<String> = warnings
            .iter()
            .filter(|w| w.severity == WarningSeverity::Error)
            .map(|w| format!("{}: {}", w.field, w.message))
            .collect();

        if !errors.is_empty() {
            return Err(format!("Configuration errors:\n  • {}", errors.join("\n  • ")));
        }

        Ok(warnings)
    }
}
