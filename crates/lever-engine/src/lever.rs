use dashmap::DashMap;
use lever_channels::ChannelRegistry;
use lever_config::LeverConfig;
use lever_core::{
    AdmissionDenial, BindingMoment, BoundLimit, Clock, EventBus, LeverError, LeverEvent, Metric,
    Policy, PolicyRef, PolicySnapshot, Result, RunId, RunIdentity, RunState, SystemClock,
    ThresholdSignal,
};
use lever_store::PolicyStore;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::actuator::EnforcementActuator;
use crate::alerts::AlertEmitter;
use crate::arbitrator::arbitrate;
use crate::audit::{AuditRecord, AuditSettings, AuditWriter};
use crate::budget::BudgetLedger;
use crate::evaluator::ThresholdEvaluator;
use crate::metrics::EngineMetrics;
use crate::overrides::OverrideService;
use crate::resolver::ScopeResolver;
use crate::runtime::{ExecutionRuntime, TracingRuntime};

struct RunEntry {
    snapshot: PolicySnapshot,
    bound: bool,
}

/// Public view of a run for the runtime and administrators.
#[derive(Debug, Clone, Serialize)]
pub struct RunStatus {
    pub run_id: RunId,
    /// False once the run has ended.
    pub active: bool,
    pub bound: bool,
    pub state: Option<RunState>,
    pub snapshot: PolicySnapshot,
}

/// The engine's entry point for the execution runtime.
pub struct PolicyLever {
    store: PolicyStore,
    config: Arc<RwLock<LeverConfig>>,
    clock: Arc<dyn Clock>,
    metrics: EngineMetrics,
    bus: EventBus,
    resolver: ScopeResolver,
    evaluator: ThresholdEvaluator,
    actuator: EnforcementActuator,
    alerts: Arc<AlertEmitter>,
    overrides: Arc<OverrideService>,
    budget: BudgetLedger,
    audit: AuditWriter,
    runs: DashMap<RunId, Arc<Mutex<RunEntry>>>,
}

/// Assembles a [`PolicyLever`]. Everything but the store and config has a
/// default.
pub struct LeverBuilder {
    store: PolicyStore,
    config: Arc<RwLock<LeverConfig>>,
    clock: Arc<dyn Clock>,
    runtime: Arc<dyn ExecutionRuntime>,
    channels: Option<ChannelRegistry>,
    bus: EventBus,
    metrics: EngineMetrics,
}

impl LeverBuilder {
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn runtime(mut self, runtime: Arc<dyn ExecutionRuntime>) -> Self {
        self.runtime = runtime;
        self
    }

    /// Channel adapters. Built from `[channels.*]` when not given.
    pub fn channels(mut self, channels: ChannelRegistry) -> Self {
        self.channels = Some(channels);
        self
    }

    pub fn bus(mut self, bus: EventBus) -> Self {
        self.bus = bus;
        self
    }

    pub fn metrics(mut self, metrics: EngineMetrics) -> Self {
        self.metrics = metrics;
        self
    }

    /// Must be called from within a tokio runtime (the audit writer is spawned).
    pub fn build(self) -> Result<PolicyLever> {
        let cfg = self.config.read().clone();
        if !cfg.default_policy.enabled {
            return Err(LeverError::UnscopedRun {
                tenant: "*".into(),
            });
        }

        let channels = match self.channels {
            Some(registry) => registry,
            None => ChannelRegistry::from_config(&cfg.channels, &cfg.alerts, self.bus.clone())?,
        };
        let audit = AuditWriter::spawn(
            self.store.clone(),
            AuditSettings::from(&cfg.audit),
            self.metrics.clone(),
        );
        let overrides = Arc::new(OverrideService::new(
            self.store.clone(),
            Arc::clone(&self.clock),
            self.metrics.clone(),
            self.bus.clone(),
        )?);

        info!(
            channels = ?channels.kinds(),
            default_policy = %cfg.default_policy.name,
            "policy lever ready"
        );

        Ok(PolicyLever {
            resolver: ScopeResolver::new(
                self.store.clone(),
                Arc::clone(&self.config),
                Arc::clone(&self.clock),
            ),
            evaluator: ThresholdEvaluator::new(Arc::clone(&self.clock), self.metrics.clone()),
            actuator: EnforcementActuator::new(
                Arc::clone(&overrides),
                self.runtime,
                audit.clone(),
                Arc::clone(&self.clock),
                self.metrics.clone(),
                self.bus.clone(),
            ),
            alerts: Arc::new(AlertEmitter::new(
                channels,
                Arc::clone(&self.clock),
                self.metrics.clone(),
                self.bus.clone(),
            )),
            budget: BudgetLedger::new(self.store.clone(), Arc::clone(&self.clock)),
            overrides,
            audit,
            store: self.store,
            config: self.config,
            clock: self.clock,
            metrics: self.metrics,
            bus: self.bus,
            runs: DashMap::new(),
        })
    }
}

/// Whether a deferred snapshot binds on this report.
fn binds_at(moment: BindingMoment, metric: Metric) -> bool {
    match moment {
        BindingMoment::RunStart => false,
        BindingMoment::FirstToken => metric == Metric::Tokens,
        BindingMoment::EachStep => true,
    }
}

impl PolicyLever {
    pub fn builder(store: PolicyStore, config: Arc<RwLock<LeverConfig>>) -> LeverBuilder {
        LeverBuilder {
            store,
            config,
            clock: Arc::new(SystemClock),
            runtime: Arc::new(TracingRuntime),
            channels: None,
            bus: EventBus::default(),
            metrics: EngineMetrics::new(),
        }
    }

    /// Admit a run: resolve, arbitrate and bind (or provisionally hold) its
    /// snapshot. A `FAIL_CLOSED` conflict denies the run and records why.
    pub fn on_run_start(&self, identity: RunIdentity) -> Result<PolicySnapshot> {
        if identity.tenant.trim().is_empty() {
            return Err(LeverError::invalid("tenant", "run identity has no tenant"));
        }

        let candidates = match self.resolver.resolve(&identity) {
            Ok(c) => c,
            Err(e @ LeverError::UnscopedRun { .. }) => {
                self.deny(&identity, &[], &e);
                return Err(e);
            }
            Err(e) => return Err(e),
        };
        let arbitration = match arbitrate(&candidates) {
            Ok(a) => a,
            Err(e) => {
                self.deny(&identity, &candidates, &e);
                return Err(e);
            }
        };

        let run_id = Uuid::new_v4();
        let deferred = arbitration.binding_moment != BindingMoment::RunStart;
        let snapshot = arbitration.into_snapshot(run_id, identity, self.clock.now(), deferred);

        self.actuator.register_run(run_id);
        if !deferred {
            self.persist_binding(&snapshot);
        }
        self.runs.insert(
            run_id,
            Arc::new(Mutex::new(RunEntry {
                snapshot: snapshot.clone(),
                bound: !deferred,
            })),
        );

        self.metrics.inc_runs_admitted();
        self.bus.publish(LeverEvent::RunAdmitted {
            run_id,
            tenant: snapshot.tenant().to_string(),
            policy_id: snapshot.policy_id.clone(),
            policy_version: snapshot.policy_version,
        });
        info!(
            run_id = %run_id,
            tenant = %snapshot.tenant(),
            policy_id = %snapshot.policy_id,
            strategy = %snapshot.strategy,
            binding = %snapshot.binding_moment,
            "run admitted"
        );
        Ok(snapshot)
    }

    /// Feed one observation. Returns the Near/Breach decision at once;
    /// persistence, enforcement side effects and alert delivery follow.
    pub fn on_step_metric(
        &self,
        run_id: RunId,
        metric: Metric,
        value: f64,
    ) -> Result<Option<ThresholdSignal>> {
        let entry = self
            .runs
            .get(&run_id)
            .map(|e| Arc::clone(e.value()))
            .ok_or(LeverError::RunNotFound(run_id))?;
        if !value.is_finite() {
            warn!(run_id = %run_id, metric = %metric, value, "ignoring non-finite metric");
            return Ok(None);
        }

        let (signal, snapshot) = {
            let mut run = entry.lock();
            if !run.bound && binds_at(run.snapshot.binding_moment, metric) {
                self.bind_deferred(&mut run);
            }
            let signal = self.evaluator.evaluate_with(&run.snapshot, metric, |bound| {
                self.observed_value(&run.snapshot, bound, value)
            });
            let snapshot = signal.as_ref().map(|_| run.snapshot.clone());
            (signal, snapshot)
        };
        let (Some(signal), Some(snapshot)) = (signal, snapshot) else {
            return Ok(None);
        };

        self.audit.record(AuditRecord::Signal(signal.clone()));
        if signal.is_breach() {
            self.metrics.inc_breach_signals();
        } else {
            self.metrics.inc_near_signals();
        }
        self.bus.publish(LeverEvent::SignalEmitted {
            signal_id: signal.id,
            run_id,
            metric,
            signal_type: signal.signal_type,
            observed: signal.observed,
            threshold: signal.threshold,
        });
        debug!(
            run_id = %run_id,
            metric = %metric,
            signal = %signal.signal_type,
            observed = signal.observed,
            threshold = signal.threshold,
            policy_id = %signal.policy_id,
            "threshold signal"
        );

        if signal.is_breach() {
            if let Err(e) = self.actuator.enforce(&signal, &snapshot) {
                warn!(run_id = %run_id, error = %e, "enforcement failed");
            }
        }
        self.alerts.spawn_emit(signal.clone(), snapshot.alerts);
        Ok(Some(signal))
    }

    /// Per-run limits see the run's value, shared budgets their window total.
    fn observed_value(&self, snapshot: &PolicySnapshot, bound: &BoundLimit, value: f64) -> f64 {
        if bound.limit.aggregate.is_none() {
            return value;
        }
        match self
            .budget
            .record(snapshot.run_id, snapshot.tenant(), bound, value)
        {
            Ok(total) => total,
            Err(e) => {
                warn!(
                    run_id = %snapshot.run_id,
                    metric = %bound.limit.metric,
                    policy_id = %bound.source_policy,
                    error = %e,
                    "shared budget unavailable, evaluating run value"
                );
                value
            }
        }
    }

    /// Re-resolve at the binding moment. An in-flight run cannot be
    /// un-admitted, so a failed re-arbitration binds the admission-time policy.
    fn bind_deferred(&self, run: &mut RunEntry) {
        let now = self.clock.now();
        let identity = run.snapshot.identity.clone();
        let run_id = run.snapshot.run_id;
        let rebound = self
            .resolver
            .resolve(&identity)
            .and_then(|candidates| arbitrate(&candidates));
        run.snapshot = match rebound {
            Ok(arbitration) => arbitration.into_snapshot(run_id, identity, now, false),
            Err(e) => {
                warn!(
                    run_id = %run_id,
                    code = e.code(),
                    error = %e,
                    "re-arbitration failed at binding moment, keeping admission-time policy"
                );
                let mut kept = run.snapshot.clone();
                kept.provisional = false;
                kept.bound_at = now;
                kept
            }
        };
        run.bound = true;
        self.persist_binding(&run.snapshot);
    }

    fn persist_binding(&self, snapshot: &PolicySnapshot) {
        self.audit.record(AuditRecord::Snapshot(snapshot.clone()));
        self.bus.publish(LeverEvent::SnapshotBound {
            run_id: snapshot.run_id,
            policy_id: snapshot.policy_id.clone(),
            policy_version: snapshot.policy_version,
            provisional: snapshot.provisional,
        });
    }

    fn deny(&self, identity: &RunIdentity, candidates: &[Policy], error: &LeverError) {
        self.audit.record(AuditRecord::Denial(AdmissionDenial {
            id: Uuid::new_v4(),
            identity: identity.clone(),
            reason_code: error.code().to_string(),
            reason: error.to_string(),
            candidates: candidates
                .iter()
                .map(|p| PolicyRef {
                    id: p.id.clone(),
                    version: p.version,
                })
                .collect(),
            created_at: self.clock.now(),
        }));
        self.metrics.inc_runs_denied();
        self.bus.publish(LeverEvent::RunDenied {
            tenant: identity.tenant.clone(),
            reason_code: error.code().to_string(),
            reason: error.to_string(),
        });
        warn!(tenant = %identity.tenant, code = error.code(), reason = %error, "run denied");
    }

    /// Finish a run. A snapshot still waiting for its binding moment is
    /// bound as-is so every admitted run leaves exactly one.
    pub fn end_run(&self, run_id: RunId) -> Result<()> {
        let (_, entry) = self
            .runs
            .remove(&run_id)
            .ok_or(LeverError::RunNotFound(run_id))?;
        {
            let run = entry.lock();
            if !run.bound {
                self.persist_binding(&run.snapshot);
            }
        }
        self.evaluator.clear_run(run_id);
        self.budget.forget_run(run_id);
        self.alerts.forget_run(run_id);
        self.actuator.forget_run(run_id);
        self.bus.publish(LeverEvent::RunEnded { run_id });
        info!(run_id = %run_id, "run ended");
        Ok(())
    }

    pub fn resume(&self, run_id: RunId) -> Result<RunState> {
        if !self.runs.contains_key(&run_id) {
            return Err(LeverError::RunNotFound(run_id));
        }
        self.actuator.resume(run_id)
    }

    /// Re-arm Near signals for one metric of a live run.
    pub fn reset_signals(&self, run_id: RunId, metric: Metric) -> Result<()> {
        if !self.runs.contains_key(&run_id) {
            return Err(LeverError::RunNotFound(run_id));
        }
        self.evaluator.reset(run_id, metric);
        Ok(())
    }

    /// Live snapshot of a run (provisional until bound).
    pub fn snapshot(&self, run_id: RunId) -> Option<PolicySnapshot> {
        self.runs
            .get(&run_id)
            .map(|e| e.value().lock().snapshot.clone())
    }

    pub fn run_state(&self, run_id: RunId) -> Option<RunState> {
        self.actuator.state(run_id)
    }

    /// Status of a live run, or of an ended one from its persisted snapshot.
    pub fn run_status(&self, run_id: RunId) -> Result<RunStatus> {
        let live = self.runs.get(&run_id).map(|e| Arc::clone(e.value()));
        if let Some(entry) = live {
            let run = entry.lock();
            return Ok(RunStatus {
                run_id,
                active: true,
                bound: run.bound,
                state: self.actuator.state(run_id),
                snapshot: run.snapshot.clone(),
            });
        }
        match self.store.snapshot_for_run(run_id)? {
            Some(snapshot) => Ok(RunStatus {
                run_id,
                active: false,
                bound: true,
                state: None,
                snapshot,
            }),
            None => Err(LeverError::RunNotFound(run_id)),
        }
    }

    pub fn active_runs(&self) -> usize {
        self.runs.len()
    }

    /// Wait for queued alert dispatches and audit writes.
    pub async fn flush(&self) {
        self.alerts.wait_idle().await;
        self.audit.flush().await;
    }

    pub fn store(&self) -> &PolicyStore {
        &self.store
    }

    pub fn actuator(&self) -> &EnforcementActuator {
        &self.actuator
    }

    pub fn overrides(&self) -> &OverrideService {
        &self.overrides
    }

    pub fn metrics(&self) -> &EngineMetrics {
        &self.metrics
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn config(&self) -> LeverConfig {
        self.config.read().clone()
    }
}
