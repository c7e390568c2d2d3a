use lever_core::{EnforcementAction, RunId};
use tracing::{info, warn};

/// The execution platform's side of enforcement. Called after the engine has
/// decided; implementations should hand off and return quickly.
pub trait ExecutionRuntime: Send + Sync {
    fn notify_action(&self, run_id: RunId, action: EnforcementAction);

    fn notify_resume(&self, run_id: RunId);
}

/// Runtime that only logs. Used when the platform polls run state over HTTP
/// instead of receiving callbacks.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingRuntime;

impl ExecutionRuntime for TracingRuntime {
    fn notify_action(&self, run_id: RunId, action: EnforcementAction) {
        match action {
            EnforcementAction::Alert => info!(run_id = %run_id, "alert-only enforcement"),
            other => warn!(run_id = %run_id, action = %other, "enforcement action issued"),
        }
    }

    fn notify_resume(&self, run_id: RunId) {
        info!(run_id = %run_id, "run resumed");
    }
}
