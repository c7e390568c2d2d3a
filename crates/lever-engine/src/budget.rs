use dashmap::DashMap;
use lever_core::{AggregateWindow, BoundLimit, Clock, Metric, PolicyId, Result, RunId};
use lever_store::PolicyStore;
use std::sync::Arc;
use tracing::debug;

/// Shared budgets across runs.
///
/// Runs report cumulative values; the ledger turns each report into the
/// increase since the run's previous report and adds that to the store's
/// counter for the limit's window, returning the window total.
pub struct BudgetLedger {
    store: PolicyStore,
    clock: Arc<dyn Clock>,
    last_seen: DashMap<(RunId, PolicyId, Metric, AggregateWindow), f64>,
}

impl BudgetLedger {
    pub fn new(store: PolicyStore, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            last_seen: DashMap::new(),
        }
    }

    /// Record a run's cumulative observation against an aggregate limit.
    /// Returns the observation unchanged for per-run limits.
    pub fn record(
        &self,
        run_id: RunId,
        tenant: &str,
        bound: &BoundLimit,
        observed: f64,
    ) -> Result<f64> {
        let Some(window) = bound.limit.aggregate else {
            return Ok(observed);
        };
        let metric = bound.limit.metric;

        let delta = {
            let mut last = self
                .last_seen
                .entry((run_id, bound.source_policy.clone(), metric, window))
                .or_insert(0.0);
            let delta = (observed - *last).max(0.0);
            *last = last.max(observed);
            delta
        };

        let now = self.clock.now();
        let key = window.key(now);
        let total = if delta > 0.0 {
            self.store
                .add_to_budget(tenant, &bound.source_policy, metric, &key, delta, now)?
        } else {
            self.store
                .budget_total(tenant, &bound.source_policy, metric, &key)?
        };
        debug!(
            run_id = %run_id,
            metric = %metric,
            window = %key,
            delta,
            total,
            "shared budget updated"
        );
        Ok(total)
    }

    pub fn forget_run(&self, run_id: RunId) {
        self.last_seen.retain(|(run, ..), _| *run != run_id);
    }
}
