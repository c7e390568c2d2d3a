use lever_config::LeverConfig;
use lever_core::{Clock, LeverError, Policy, Result, RunIdentity};
use lever_store::PolicyStore;
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::debug;

/// Finds the policies that apply to a run.
///
/// Reads the versioned store on every call; nothing is cached, so an edit is
/// visible to the next run admitted after it commits.
pub struct ScopeResolver {
    store: PolicyStore,
    config: Arc<RwLock<LeverConfig>>,
    clock: Arc<dyn Clock>,
}

impl ScopeResolver {
    pub fn new(store: PolicyStore, config: Arc<RwLock<LeverConfig>>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            config,
            clock,
        }
    }

    /// Every active policy of the run's tenant whose scope matches one of the
    /// run's identifiers, plus the tenant's `ALL_RUNS` policies, ordered by
    /// `(priority, policy id)`. Falls back to the configured default policy
    /// when nothing matches.
    pub fn resolve(&self, identity: &RunIdentity) -> Result<Vec<Policy>> {
        let mut candidates: Vec<Policy> = self
            .store
            .load_active_policies(&identity.tenant)?
            .into_iter()
            .filter(|p| p.scope.matches(identity))
            .collect();

        if candidates.is_empty() {
            let fallback = self
                .config
                .read()
                .default_policy_for(&identity.tenant, self.clock.now());
            return match fallback {
                Some(policy) => {
                    debug!(tenant = %identity.tenant, "no scoped policy matched, using default");
                    Ok(vec![policy])
                }
                None => Err(LeverError::UnscopedRun {
                    tenant: identity.tenant.clone(),
                }),
            };
        }

        sort_candidates(&mut candidates);
        debug!(
            tenant = %identity.tenant,
            candidates = candidates.len(),
            "resolved candidate policies"
        );
        Ok(candidates)
    }
}

/// Priority ascending (lower wins), ties broken by policy id.
pub fn sort_candidates(candidates: &mut [Policy]) {
    candidates.sort_by(|a, b| {
        a.precedence
            .priority
            .cmp(&b.precedence.priority)
            .then_with(|| a.id.cmp(&b.id))
    });
}
