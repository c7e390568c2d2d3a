use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::policy::{EnforcementAction, Metric};
use crate::run::{BreachId, OverrideId, PolicyId, RunId, RunIdentity, ScopeRef, TenantId};
use crate::snapshot::PolicyRef;

/// Execution state of a run as seen by the enforcement side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunState {
    Running,
    Paused,
    Stopped,
    Killed,
}

impl RunState {
    /// STOP and KILL cannot be cancelled once issued.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped | Self::Killed)
    }
}

string_enum!(RunState {
    Running => "RUNNING",
    Paused => "PAUSED",
    Stopped => "STOPPED",
    Killed => "KILLED",
});

/// Audit entry for an enforcement decision taken on a breach.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnforcementRecord {
    pub id: Uuid,
    pub breach_id: BreachId,
    pub run_id: RunId,
    pub tenant: TenantId,
    pub policy_id: PolicyId,
    pub metric: Metric,
    /// Action configured on the breached limit.
    pub requested: EnforcementAction,
    /// Action actually applied after override checks.
    pub applied: EnforcementAction,
    /// Set when an active override downgraded the action.
    pub downgraded_by_override: Option<OverrideId>,
    pub resulting_state: RunState,
    pub created_at: DateTime<Utc>,
}

impl EnforcementRecord {
    pub fn was_downgraded(&self) -> bool {
        self.downgraded_by_override.is_some()
    }
}

/// Audit entry for a run refused at admission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdmissionDenial {
    pub id: Uuid,
    pub identity: RunIdentity,
    pub reason_code: String,
    pub reason: String,
    pub candidates: Vec<PolicyRef>,
    pub created_at: DateTime<Utc>,
}

/// Immutable audit entry for an exercised override.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverrideRecord {
    pub id: OverrideId,
    pub tenant: TenantId,
    pub authority_id: String,
    pub actor: String,
    pub scope: ScopeRef,
    pub justification: String,
    pub starts_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl OverrideRecord {
    /// Half-open validity window `[starts_at, expires_at)`.
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.starts_at <= now && now < self.expires_at
    }

    pub fn covers(&self, identity: &RunIdentity, now: DateTime<Utc>) -> bool {
        self.tenant == identity.tenant && self.is_active(now) && self.scope.covers(identity)
    }
}
