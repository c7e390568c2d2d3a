use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::error::{LeverError, Result};
use crate::run::{PolicyId, RunIdentity, ScopeRef, TenantId};

/// Default Near boundary as a fraction of a limit's threshold.
pub const DEFAULT_NEAR_RATIO: f64 = 0.8;

// ── Scope ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ScopeType {
    AllRuns,
    Agent,
    ApiKey,
    HumanActor,
}

string_enum!(ScopeType {
    AllRuns => "ALL_RUNS",
    Agent => "AGENT",
    ApiKey => "API_KEY",
    HumanActor => "HUMAN_ACTOR",
});

/// WHO a policy (or an override grant) applies to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyScope {
    pub tenant: TenantId,
    pub scope_type: ScopeType,
    /// Matching identifiers. Empty only for `ALL_RUNS`.
    #[serde(default)]
    pub identifiers: BTreeSet<String>,
}

impl PolicyScope {
    pub fn all_runs(tenant: impl Into<String>) -> Self {
        Self {
            tenant: tenant.into(),
            scope_type: ScopeType::AllRuns,
            identifiers: BTreeSet::new(),
        }
    }

    pub fn of(
        tenant: impl Into<String>,
        scope_type: ScopeType,
        identifiers: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self {
            tenant: tenant.into(),
            scope_type,
            identifiers: identifiers.into_iter().map(Into::into).collect(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.tenant.trim().is_empty() {
            return Err(LeverError::invalid("scope.tenant", "tenant is empty"));
        }
        match (self.scope_type, self.identifiers.is_empty()) {
            (ScopeType::AllRuns, true) => Ok(()),
            (ScopeType::AllRuns, false) => Err(LeverError::invalid(
                "scope.identifiers",
                "ALL_RUNS scope must not list identifiers",
            )),
            (other, true) => Err(LeverError::invalid(
                "scope.identifiers",
                format!("{other} scope requires at least one identifier"),
            )),
            (_, false) => {
                if self.identifiers.iter().any(|id| id.trim().is_empty()) {
                    return Err(LeverError::invalid(
                        "scope.identifiers",
                        "identifiers must not be blank",
                    ));
                }
                Ok(())
            }
        }
    }

    /// Whether a run matches this scope on at least one present identifier.
    pub fn matches(&self, identity: &RunIdentity) -> bool {
        if self.tenant != identity.tenant {
            return false;
        }
        match self.scope_type {
            ScopeType::AllRuns => true,
            other => identity
                .identifier_for(other)
                .is_some_and(|id| self.identifiers.contains(id)),
        }
    }

    /// Whether a concrete scope lies inside this one (used for override grants).
    pub fn covers(&self, scope: &ScopeRef) -> bool {
        match self.scope_type {
            ScopeType::AllRuns => true,
            own => {
                own == scope.scope_type
                    && scope
                        .identifier
                        .as_ref()
                        .is_some_and(|id| self.identifiers.contains(id))
            }
        }
    }

    /// Two scopes of the same type in one tenant that share a target.
    pub fn overlaps(&self, other: &PolicyScope) -> bool {
        self.tenant == other.tenant
            && self.scope_type == other.scope_type
            && (self.scope_type == ScopeType::AllRuns
                || !self.identifiers.is_disjoint(&other.identifiers))
    }
}

// ── Precedence ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConflictStrategy {
    MostRestrictive,
    ExplicitPriority,
    FailClosed,
}

string_enum!(ConflictStrategy {
    MostRestrictive => "MOST_RESTRICTIVE",
    ExplicitPriority => "EXPLICIT_PRIORITY",
    FailClosed => "FAIL_CLOSED",
});

/// When a run's snapshot becomes authoritative.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BindingMoment {
    RunStart,
    FirstToken,
    EachStep,
}

string_enum!(BindingMoment {
    RunStart => "RUN_START",
    FirstToken => "FIRST_TOKEN",
    EachStep => "EACH_STEP",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyPrecedence {
    /// Lower value = higher precedence.
    pub priority: u32,
    pub strategy: ConflictStrategy,
    pub binding_moment: BindingMoment,
}

impl Default for PolicyPrecedence {
    fn default() -> Self {
        Self {
            priority: 100,
            strategy: ConflictStrategy::MostRestrictive,
            binding_moment: BindingMoment::RunStart,
        }
    }
}

// ── Monitoring ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    Tokens,
    Cost,
    BurnRate,
    Latency,
}

string_enum!(Metric {
    Tokens => "tokens",
    Cost => "cost",
    BurnRate => "burn_rate",
    Latency => "latency",
});

/// Things an evaluator is forbidden to inspect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NegativeCapability {
    PromptLogging,
    PiiCapture,
}

string_enum!(NegativeCapability {
    PromptLogging => "prompt_logging",
    PiiCapture => "pii_capture",
});

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Signals collected for runs under this policy.
    pub signals: BTreeSet<Metric>,
    /// Capabilities the evaluators must not use.
    pub forbid: BTreeSet<NegativeCapability>,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            signals: Metric::ALL.iter().copied().collect(),
            forbid: BTreeSet::new(),
        }
    }
}

impl MonitorConfig {
    pub fn collects(&self, metric: Metric) -> bool {
        self.signals.contains(&metric)
    }

    pub fn permits(&self, capability: NegativeCapability) -> bool {
        !self.forbid.contains(&capability)
    }

    /// Union of collected signals and of forbidden capabilities.
    pub fn merge(&self, other: &MonitorConfig) -> MonitorConfig {
        MonitorConfig {
            signals: self.signals.union(&other.signals).copied().collect(),
            forbid: self.forbid.union(&other.forbid).copied().collect(),
        }
    }
}

// ── Limits & actions ───────────────────────────────────────────

/// Graduated enforcement actions, ordered by severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EnforcementAction {
    Alert,
    Pause,
    Stop,
    Kill,
}

string_enum!(EnforcementAction {
    Alert => "ALERT",
    Pause => "PAUSE",
    Stop => "STOP",
    Kill => "KILL",
});

/// Window over which a shared (cross-run) budget accumulates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregateWindow {
    Lifetime,
    Daily,
}

string_enum!(AggregateWindow {
    Lifetime => "lifetime",
    Daily => "daily",
});

impl AggregateWindow {
    /// Storage key of the window containing `at`.
    pub fn key(&self, at: DateTime<Utc>) -> String {
        match self {
            Self::Lifetime => "lifetime".into(),
            Self::Daily => at.format("%Y-%m-%d").to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Limit {
    pub metric: Metric,
    pub threshold: f64,
    #[serde(default = "default_near_ratio")]
    pub near_ratio: f64,
    #[serde(default = "default_action")]
    pub action: EnforcementAction,
    /// When set, the threshold applies to the sum across all runs in scope.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aggregate: Option<AggregateWindow>,
}

fn default_near_ratio() -> f64 {
    DEFAULT_NEAR_RATIO
}

fn default_action() -> EnforcementAction {
    EnforcementAction::Alert
}

impl Limit {
    pub fn new(metric: Metric, threshold: f64) -> Self {
        Self {
            metric,
            threshold,
            near_ratio: DEFAULT_NEAR_RATIO,
            action: EnforcementAction::Alert,
            aggregate: None,
        }
    }

    pub fn with_action(mut self, action: EnforcementAction) -> Self {
        self.action = action;
        self
    }

    pub fn with_near_ratio(mut self, near_ratio: f64) -> Self {
        self.near_ratio = near_ratio;
        self
    }

    pub fn with_aggregate(mut self, window: AggregateWindow) -> Self {
        self.aggregate = Some(window);
        self
    }

    /// Value at which a Near signal starts.
    pub fn near_boundary(&self) -> f64 {
        self.threshold * self.near_ratio
    }

    pub fn validate(&self) -> Result<()> {
        let field = format!("limits.{}", self.metric);
        if !self.threshold.is_finite() || self.threshold <= 0.0 {
            return Err(LeverError::invalid(
                field,
                format!("threshold {} must be a positive number", self.threshold),
            ));
        }
        if !self.near_ratio.is_finite() || self.near_ratio <= 0.0 || self.near_ratio > 1.0 {
            return Err(LeverError::invalid(
                field,
                format!("near_ratio {} must be in (0, 1]", self.near_ratio),
            ));
        }
        Ok(())
    }
}

// ── Alerts ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChannelType {
    Ui,
    Webhook,
    Slack,
    Email,
}

string_enum!(ChannelType {
    Ui => "UI",
    Webhook => "WEBHOOK",
    Slack => "SLACK",
    Email => "EMAIL",
});

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertConfig {
    pub channels: BTreeSet<ChannelType>,
    /// Alerts sent per run and channel before further alerts are suppressed.
    pub max_alerts_per_run: u32,
    /// Minimum seconds between alerts for the same (run, metric) on a channel.
    pub min_interval_secs: u64,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            channels: [ChannelType::Ui].into_iter().collect(),
            max_alerts_per_run: 10,
            min_interval_secs: 60,
        }
    }
}

// ── Policy ─────────────────────────────────────────────────────

/// One version of an administrator-authored policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Policy {
    pub id: PolicyId,
    pub version: u32,
    pub name: String,
    pub scope: PolicyScope,
    pub precedence: PolicyPrecedence,
    pub monitor: MonitorConfig,
    pub limits: Vec<Limit>,
    pub alerts: AlertConfig,
    pub created_at: DateTime<Utc>,
}

impl Policy {
    pub fn tenant(&self) -> &str {
        &self.scope.tenant
    }

    pub fn limit_for(&self, metric: Metric) -> Option<&Limit> {
        self.limits.iter().find(|l| l.metric == metric)
    }

    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(LeverError::invalid("id", "policy id is empty"));
        }
        self.scope.validate()?;
        validate_limits(&self.limits)
    }
}

pub fn validate_limits(limits: &[Limit]) -> Result<()> {
    let mut seen = BTreeMap::new();
    for limit in limits {
        limit.validate()?;
        if seen.insert(limit.metric, ()).is_some() {
            return Err(LeverError::invalid(
                format!("limits.{}", limit.metric),
                "a policy may carry only one limit per metric",
            ));
        }
    }
    Ok(())
}

/// Administrator input for a new policy (the store assigns version and timestamps).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyDraft {
    #[serde(default)]
    pub id: Option<PolicyId>,
    pub name: String,
    pub scope: PolicyScope,
    #[serde(default)]
    pub precedence: PolicyPrecedence,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub limits: Vec<Limit>,
    #[serde(default)]
    pub alerts: AlertConfig,
}

impl PolicyDraft {
    pub fn new(name: impl Into<String>, scope: PolicyScope) -> Self {
        Self {
            id: None,
            name: name.into(),
            scope,
            precedence: PolicyPrecedence::default(),
            monitor: MonitorConfig::default(),
            limits: Vec::new(),
            alerts: AlertConfig::default(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_precedence(
        mut self,
        priority: u32,
        strategy: ConflictStrategy,
        binding_moment: BindingMoment,
    ) -> Self {
        self.precedence = PolicyPrecedence {
            priority,
            strategy,
            binding_moment,
        };
        self
    }

    pub fn with_limit(mut self, limit: Limit) -> Self {
        self.limits.push(limit);
        self
    }

    pub fn with_monitor(mut self, monitor: MonitorConfig) -> Self {
        self.monitor = monitor;
        self
    }

    pub fn with_alerts(mut self, alerts: AlertConfig) -> Self {
        self.alerts = alerts;
        self
    }
}

// ── Overrides ──────────────────────────────────────────────────

/// A grant naming who may suspend enforcement, where, and for how long.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverrideAuthority {
    pub id: String,
    pub scope: PolicyScope,
    pub actors: BTreeSet<String>,
    pub max_duration_secs: u64,
    pub created_at: DateTime<Utc>,
}

impl OverrideAuthority {
    pub fn validate(&self) -> Result<()> {
        self.scope.validate()?;
        if self.actors.is_empty() {
            return Err(LeverError::invalid(
                "actors",
                "an override authority must name at least one actor",
            ));
        }
        if self.max_duration_secs == 0 {
            return Err(LeverError::invalid(
                "max_duration_secs",
                "duration ceiling must be positive",
            ));
        }
        Ok(())
    }

    pub fn permits(&self, actor: &str, scope: &ScopeRef) -> bool {
        self.actors.contains(actor) && self.scope.covers(scope)
    }
}
