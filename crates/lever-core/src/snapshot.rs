use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::policy::{
    AlertConfig, BindingMoment, ConflictStrategy, Limit, Metric, MonitorConfig,
};
use crate::run::{PolicyId, RunId, RunIdentity};
use crate::signal::ThresholdSignal;

/// A policy version that took part in arbitration.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PolicyRef {
    pub id: PolicyId,
    pub version: u32,
}

/// A resolved limit, tagged with the policy that supplied its threshold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundLimit {
    #[serde(flatten)]
    pub limit: Limit,
    pub source_policy: PolicyId,
}

/// The binding artifact for one run. Created once, never mutated: later
/// policy edits do not reach an in-flight run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicySnapshot {
    pub run_id: RunId,
    pub identity: RunIdentity,
    /// Winning (highest-precedence) policy.
    pub policy_id: PolicyId,
    pub policy_version: u32,
    pub contributing: Vec<PolicyRef>,
    pub limits: Vec<BoundLimit>,
    pub monitor: MonitorConfig,
    pub alerts: AlertConfig,
    pub strategy: ConflictStrategy,
    pub binding_moment: BindingMoment,
    pub bound_at: DateTime<Utc>,
    /// True while a deferred binding moment has not yet been reached.
    #[serde(default)]
    pub provisional: bool,
}

impl PolicySnapshot {
    pub fn tenant(&self) -> &str {
        &self.identity.tenant
    }

    /// First limit on `metric`; per-run limits precede shared budgets.
    pub fn limit_for(&self, metric: Metric) -> Option<&BoundLimit> {
        self.limits_for(metric).next()
    }

    pub fn limits_for(&self, metric: Metric) -> impl Iterator<Item = &BoundLimit> {
        self.limits.iter().filter(move |l| l.limit.metric == metric)
    }

    /// The limit a signal was raised against.
    pub fn limit_for_signal(&self, signal: &ThresholdSignal) -> Option<&BoundLimit> {
        self.limits_for(signal.metric).find(|l| {
            l.source_policy == signal.policy_id && l.limit.threshold == signal.threshold
        })
    }
}
