use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use lever_core::{
    BreachId, Clock, EnforcementAction, EnforcementRecord, EventBus, LeverError, LeverEvent,
    OverrideId, PolicySnapshot, Result, RunId, RunState, ThresholdSignal,
};
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::audit::{AuditRecord, AuditWriter};
use crate::metrics::EngineMetrics;
use crate::overrides::OverrideService;
use crate::runtime::ExecutionRuntime;

/// What `enforce` decided for one breach.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActionOutcome {
    pub breach_id: BreachId,
    pub run_id: RunId,
    pub requested: EnforcementAction,
    pub applied: EnforcementAction,
    pub state: RunState,
    pub downgraded_by_override: Option<OverrideId>,
    /// True when the breach id had already been enforced.
    pub duplicate: bool,
}

/// Maps breaches to graduated actions and tracks each run's state.
pub struct EnforcementActuator {
    overrides: Arc<OverrideService>,
    runtime: Arc<dyn ExecutionRuntime>,
    audit: AuditWriter,
    clock: Arc<dyn Clock>,
    metrics: EngineMetrics,
    bus: EventBus,
    outcomes: DashMap<BreachId, ActionOutcome>,
    states: DashMap<RunId, RunState>,
}

/// State after applying `action` to `current`. Terminal states never regress
/// and nothing leaves `KILLED`.
pub fn transition(current: RunState, action: EnforcementAction) -> RunState {
    match (current, action) {
        (RunState::Killed, _) => RunState::Killed,
        (_, EnforcementAction::Kill) => RunState::Killed,
        (state, EnforcementAction::Alert) => state,
        (RunState::Stopped, _) => RunState::Stopped,
        (_, EnforcementAction::Stop) => RunState::Stopped,
        (_, EnforcementAction::Pause) => RunState::Paused,
    }
}

impl EnforcementActuator {
    pub fn new(
        overrides: Arc<OverrideService>,
        runtime: Arc<dyn ExecutionRuntime>,
        audit: AuditWriter,
        clock: Arc<dyn Clock>,
        metrics: EngineMetrics,
        bus: EventBus,
    ) -> Self {
        Self {
            overrides,
            runtime,
            audit,
            clock,
            metrics,
            bus,
            outcomes: DashMap::new(),
            states: DashMap::new(),
        }
    }

    pub fn register_run(&self, run_id: RunId) {
        self.states.entry(run_id).or_insert(RunState::Running);
    }

    pub fn state(&self, run_id: RunId) -> Option<RunState> {
        self.states.get(&run_id).map(|s| *s)
    }

    /// Apply the breached limit's action. A breach id is enforced once;
    /// repeats return the first outcome flagged as duplicate.
    pub fn enforce(&self, breach: &ThresholdSignal, snapshot: &PolicySnapshot) -> Result<ActionOutcome> {
        let breach_id = breach
            .breach_id()
            .ok_or_else(|| LeverError::invalid("signal_type", "only Breach signals are enforced"))?;

        let (outcome, previous) = match self.outcomes.entry(breach_id) {
            Entry::Occupied(known) => {
                self.metrics.inc_actions_duplicate();
                let mut outcome = known.get().clone();
                outcome.duplicate = true;
                return Ok(outcome);
            }
            Entry::Vacant(slot) => {
                let requested = snapshot
                    .limit_for_signal(breach)
                    .map(|b| b.limit.action)
                    .unwrap_or(EnforcementAction::Alert);

                let now = self.clock.now();
                let covering = (requested > EnforcementAction::Alert)
                    .then(|| self.overrides.covering(&snapshot.identity, now))
                    .flatten();
                let applied = if covering.is_some() {
                    EnforcementAction::Alert
                } else {
                    requested
                };

                let mut state = self.states.entry(breach.run_id).or_insert(RunState::Running);
                let previous = *state;
                *state = transition(previous, applied);

                let outcome = ActionOutcome {
                    breach_id,
                    run_id: breach.run_id,
                    requested,
                    applied,
                    state: *state,
                    downgraded_by_override: covering.map(|o| o.id),
                    duplicate: false,
                };
                slot.insert(outcome.clone());
                (outcome, previous)
            }
        };

        if outcome.state != previous {
            self.runtime.notify_action(outcome.run_id, outcome.applied);
        }

        self.metrics.inc_actions_applied();
        if let Some(override_id) = outcome.downgraded_by_override {
            self.metrics.inc_actions_downgraded();
            warn!(
                run_id = %outcome.run_id,
                breach_id = %breach_id,
                requested = %outcome.requested,
                override_id = %override_id,
                "enforcement downgraded to ALERT by override"
            );
        } else {
            info!(
                run_id = %outcome.run_id,
                breach_id = %breach_id,
                action = %outcome.applied,
                state = %outcome.state,
                "enforcement applied"
            );
        }

        self.audit.record(AuditRecord::Enforcement(EnforcementRecord {
            id: Uuid::new_v4(),
            breach_id,
            run_id: outcome.run_id,
            tenant: breach.tenant.clone(),
            policy_id: breach.policy_id.clone(),
            metric: breach.metric,
            requested: outcome.requested,
            applied: outcome.applied,
            downgraded_by_override: outcome.downgraded_by_override,
            resulting_state: outcome.state,
            created_at: self.clock.now(),
        }));
        self.bus.publish(LeverEvent::ActionApplied {
            breach_id,
            run_id: outcome.run_id,
            action: outcome.applied,
            state: outcome.state,
            downgraded_by_override: outcome.downgraded_by_override,
        });
        Ok(outcome)
    }

    /// Lift a PAUSE. Resuming a running run is a no-op; terminal runs refuse.
    pub fn resume(&self, run_id: RunId) -> Result<RunState> {
        let mut state = self
            .states
            .get_mut(&run_id)
            .ok_or(LeverError::RunNotFound(run_id))?;
        let current = *state;
        match current {
            RunState::Running => Ok(RunState::Running),
            RunState::Paused => {
                *state = RunState::Running;
                drop(state);
                self.runtime.notify_resume(run_id);
                self.bus.publish(LeverEvent::RunResumed { run_id });
                info!(run_id = %run_id, "run resumed");
                Ok(RunState::Running)
            }
            terminal => Err(LeverError::InvalidRunState {
                run_id,
                state: terminal.to_string(),
                reason: "terminal runs cannot be resumed".into(),
            }),
        }
    }

    pub fn forget_run(&self, run_id: RunId) {
        self.states.remove(&run_id);
        self.outcomes.retain(|_, o| o.run_id != run_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transitions() {
        use EnforcementAction::*;
        assert_eq!(transition(RunState::Running, Alert), RunState::Running);
        assert_eq!(transition(RunState::Running, Pause), RunState::Paused);
        assert_eq!(transition(RunState::Paused, Pause), RunState::Paused);
        assert_eq!(transition(RunState::Paused, Stop), RunState::Stopped);
        assert_eq!(transition(RunState::Stopped, Pause), RunState::Stopped);
        assert_eq!(transition(RunState::Stopped, Kill), RunState::Killed);
        assert_eq!(transition(RunState::Killed, Pause), RunState::Killed);
        assert_eq!(transition(RunState::Killed, Alert), RunState::Killed);
    }
}
