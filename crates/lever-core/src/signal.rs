use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::policy::Metric;
use crate::run::{BreachId, PolicyId, RunId, TenantId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SignalType {
    Near,
    Breach,
}

string_enum!(SignalType {
    Near => "NEAR",
    Breach => "BREACH",
});

/// Immutable record of a Near or Breach crossing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThresholdSignal {
    /// For Breach signals this is also the breach id.
    pub id: Uuid,
    pub run_id: RunId,
    pub tenant: TenantId,
    pub policy_id: PolicyId,
    pub metric: Metric,
    pub observed: f64,
    pub threshold: f64,
    pub signal_type: SignalType,
    pub created_at: DateTime<Utc>,
}

impl ThresholdSignal {
    pub fn breach_id(&self) -> Option<BreachId> {
        (self.signal_type == SignalType::Breach).then_some(self.id)
    }

    pub fn is_breach(&self) -> bool {
        self.signal_type == SignalType::Breach
    }
}

/// What the engine hands to a channel adapter. Nothing else leaves the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertPayload {
    pub run_id: RunId,
    pub policy_id: PolicyId,
    pub metric: Metric,
    pub observed: f64,
    pub threshold: f64,
    pub signal_type: SignalType,
    pub timestamp: DateTime<Utc>,
}

impl From<&ThresholdSignal> for AlertPayload {
    fn from(signal: &ThresholdSignal) -> Self {
        Self {
            run_id: signal.run_id,
            policy_id: signal.policy_id.clone(),
            metric: signal.metric,
            observed: signal.observed,
            threshold: signal.threshold,
            signal_type: signal.signal_type,
            timestamp: signal.created_at,
        }
    }
}
