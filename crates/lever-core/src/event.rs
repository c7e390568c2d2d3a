use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use std::sync::Arc;
use tokio::sync::broadcast;

use crate::audit::RunState;
use crate::policy::{ChannelType, EnforcementAction, Metric};
use crate::run::{BreachId, OverrideId, PolicyId, RunId, ScopeRef, TenantId};
use crate::signal::{AlertPayload, SignalType};

/// Everything the engine reports about itself. Subscribers include the SSE
/// feed and the UI alert channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LeverEvent {
    // ── Admission ──────────────────────────────────────────────
    RunAdmitted {
        run_id: RunId,
        tenant: TenantId,
        policy_id: PolicyId,
        policy_version: u32,
    },
    RunDenied {
        tenant: TenantId,
        reason_code: String,
        reason: String,
    },
    SnapshotBound {
        run_id: RunId,
        policy_id: PolicyId,
        policy_version: u32,
        provisional: bool,
    },
    RunEnded {
        run_id: RunId,
    },

    // ── Evaluation & enforcement ───────────────────────────────
    SignalEmitted {
        signal_id: Uuid,
        run_id: RunId,
        metric: Metric,
        signal_type: SignalType,
        observed: f64,
        threshold: f64,
    },
    ActionApplied {
        breach_id: BreachId,
        run_id: RunId,
        action: EnforcementAction,
        state: RunState,
        downgraded_by_override: Option<OverrideId>,
    },
    RunResumed {
        run_id: RunId,
    },

    // ── Alerts ─────────────────────────────────────────────────
    Alert {
        payload: AlertPayload,
    },
    AlertDispatched {
        run_id: RunId,
        channel: ChannelType,
    },
    AlertSuppressed {
        run_id: RunId,
        channel: ChannelType,
        reason: String,
    },
    AlertFailed {
        run_id: RunId,
        channel: ChannelType,
        error: String,
    },

    // ── Overrides ──────────────────────────────────────────────
    OverrideAuthorized {
        override_id: OverrideId,
        tenant: TenantId,
        actor: String,
        scope: ScopeRef,
        expires_at: DateTime<Utc>,
    },
}

/// A broadcast-based event bus for engine-wide pub/sub.
#[derive(Clone)]
pub struct EventBus {
    sender: Arc<broadcast::Sender<LeverEvent>>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender: Arc::new(sender),
        }
    }

    pub fn publish(&self, event: LeverEvent) {
        // No subscribers is fine.
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LeverEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(4096)
    }
}
