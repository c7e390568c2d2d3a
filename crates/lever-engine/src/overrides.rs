use chrono::{DateTime, Duration, Utc};
use lever_core::{
    Clock, EventBus, LeverError, LeverEvent, OverrideRecord, Result, RunIdentity, ScopeRef,
};
use lever_store::PolicyStore;
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::metrics::EngineMetrics;

/// Grants and looks up time-boxed enforcement overrides.
///
/// Authorization is checked against the tenant's `OverrideAuthority` grants.
/// Unexpired records are mirrored in memory so the enforcement path never
/// touches the store.
pub struct OverrideService {
    store: PolicyStore,
    clock: Arc<dyn Clock>,
    metrics: EngineMetrics,
    bus: EventBus,
    active: RwLock<Vec<OverrideRecord>>,
}

impl OverrideService {
    pub fn new(
        store: PolicyStore,
        clock: Arc<dyn Clock>,
        metrics: EngineMetrics,
        bus: EventBus,
    ) -> Result<Self> {
        let active = store.unexpired_overrides(clock.now())?;
        if !active.is_empty() {
            info!(count = active.len(), "loaded unexpired overrides");
        }
        Ok(Self {
            store,
            clock,
            metrics,
            bus,
            active: RwLock::new(active),
        })
    }

    /// Open an override window of `duration` starting now. Nothing is written
    /// unless every check passes.
    pub fn authorize(
        &self,
        tenant: &str,
        actor: &str,
        scope: ScopeRef,
        duration: Duration,
        justification: &str,
    ) -> Result<OverrideRecord> {
        match self.check_and_build(tenant, actor, scope, duration, justification) {
            Ok(record) => {
                self.store.insert_override_record(&record)?;
                self.metrics.inc_overrides_authorized();
                info!(
                    override_id = %record.id,
                    tenant,
                    actor,
                    scope = %record.scope,
                    expires_at = %record.expires_at,
                    "override authorized"
                );
                self.bus.publish(LeverEvent::OverrideAuthorized {
                    override_id: record.id,
                    tenant: record.tenant.clone(),
                    actor: record.actor.clone(),
                    scope: record.scope.clone(),
                    expires_at: record.expires_at,
                });
                let now = record.starts_at;
                let mut active = self.active.write();
                active.retain(|r| r.expires_at > now);
                active.push(record.clone());
                Ok(record)
            }
            Err(e) => {
                self.metrics.inc_overrides_denied();
                warn!(tenant, actor, error = %e, "override denied");
                Err(e)
            }
        }
    }

    fn check_and_build(
        &self,
        tenant: &str,
        actor: &str,
        scope: ScopeRef,
        duration: Duration,
        justification: &str,
    ) -> Result<OverrideRecord> {
        if justification.trim().is_empty() {
            return Err(LeverError::OverrideDenied("justification is required".into()));
        }
        if duration <= Duration::zero() {
            return Err(LeverError::OverrideDenied("duration must be positive".into()));
        }

        let grants: Vec<_> = self
            .store
            .override_authorities(Some(tenant))?
            .into_iter()
            .filter(|a| a.permits(actor, &scope))
            .collect();
        if grants.is_empty() {
            return Err(LeverError::OverrideDenied(format!(
                "actor '{actor}' holds no override authority over {scope} in tenant {tenant}"
            )));
        }
        let secs = duration.num_seconds().max(1) as u64;
        let Some(grant) = grants.iter().find(|a| secs <= a.max_duration_secs) else {
            let ceiling = grants.iter().map(|a| a.max_duration_secs).max().unwrap_or(0);
            return Err(LeverError::OverrideDenied(format!(
                "duration {secs}s exceeds the {ceiling}s ceiling"
            )));
        };

        let now = self.clock.now();
        let Some(expires_at) = now.checked_add_signed(duration) else {
            return Err(LeverError::OverrideDenied(format!(
                "duration {secs}s ends past the supported date range"
            )));
        };
        Ok(OverrideRecord {
            id: Uuid::new_v4(),
            tenant: tenant.to_string(),
            authority_id: grant.id.clone(),
            actor: actor.to_string(),
            scope,
            justification: justification.trim().to_string(),
            starts_at: now,
            expires_at,
        })
    }

    /// Whether an override over exactly this scope is open at `now`.
    pub fn is_active(&self, tenant: &str, scope: &ScopeRef, now: DateTime<Utc>) -> bool {
        self.active
            .read()
            .iter()
            .any(|r| r.tenant == tenant && &r.scope == scope && r.is_active(now))
    }

    /// The open override covering a run, if any.
    pub fn covering(&self, identity: &RunIdentity, now: DateTime<Utc>) -> Option<OverrideRecord> {
        self.active
            .read()
            .iter()
            .find(|r| r.covers(identity, now))
            .cloned()
    }

    /// Unexpired overrides of a tenant.
    pub fn active_for(&self, tenant: &str, now: DateTime<Utc>) -> Vec<OverrideRecord> {
        self.active
            .read()
            .iter()
            .filter(|r| r.tenant == tenant && r.is_active(now))
            .cloned()
            .collect()
    }
}
