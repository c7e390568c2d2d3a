use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use lever_core::{
    BoundLimit, Clock, Metric, PolicySnapshot, RunId, SignalType, ThresholdSignal,
};
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::metrics::EngineMetrics;

/// Compares observations against a snapshot's limits and decides Near/Breach.
///
/// Remembers the strongest signal emitted per `(run, metric)`: a repeated
/// Near is suppressed once any signal went out for the pair, a Breach always
/// goes out.
pub struct ThresholdEvaluator {
    emitted: DashMap<(RunId, Metric), SignalType>,
    clock: Arc<dyn Clock>,
    metrics: EngineMetrics,
}

impl ThresholdEvaluator {
    pub fn new(clock: Arc<dyn Clock>, metrics: EngineMetrics) -> Self {
        Self {
            emitted: DashMap::new(),
            clock,
            metrics,
        }
    }

    /// Evaluate every limit on `metric` against the same observation.
    pub fn evaluate(
        &self,
        snapshot: &PolicySnapshot,
        metric: Metric,
        observed: f64,
    ) -> Option<ThresholdSignal> {
        self.evaluate_with(snapshot, metric, |_| observed)
    }

    /// Evaluate every limit on `metric`, each against the value `observe`
    /// returns for it (the run's own value, or a shared window total).
    /// The strongest crossing wins: Breach over Near, then the larger
    /// overshoot of its threshold.
    pub fn evaluate_with<F>(
        &self,
        snapshot: &PolicySnapshot,
        metric: Metric,
        mut observe: F,
    ) -> Option<ThresholdSignal>
    where
        F: FnMut(&BoundLimit) -> f64,
    {
        if !snapshot.monitor.collects(metric) {
            debug!(run_id = %snapshot.run_id, metric = %metric, "metric not collected");
            return None;
        }

        let mut strongest: Option<(SignalType, f64, &BoundLimit, f64)> = None;
        for bound in snapshot.limits_for(metric) {
            let observed = observe(bound);
            if !observed.is_finite() {
                warn!(run_id = %snapshot.run_id, metric = %metric, observed, "ignoring non-finite observation");
                continue;
            }
            let limit = &bound.limit;
            let signal_type = if observed >= limit.threshold {
                SignalType::Breach
            } else if observed >= limit.near_boundary() {
                SignalType::Near
            } else {
                continue;
            };
            let overshoot = observed / limit.threshold;
            let stronger = match strongest {
                None => true,
                Some((kind, ratio, _, _)) => {
                    signal_type > kind || (signal_type == kind && overshoot > ratio)
                }
            };
            if stronger {
                strongest = Some((signal_type, overshoot, bound, observed));
            }
        }
        let (signal_type, _, bound, observed) = strongest?;

        let key = (snapshot.run_id, metric);
        match (signal_type, self.emitted.entry(key)) {
            (SignalType::Near, Entry::Occupied(_)) => {
                self.metrics.inc_near_suppressed();
                debug!(run_id = %snapshot.run_id, metric = %metric, observed, "near signal suppressed");
                return None;
            }
            (SignalType::Near, Entry::Vacant(slot)) => {
                slot.insert(SignalType::Near);
            }
            (SignalType::Breach, entry) => {
                entry.insert(SignalType::Breach);
            }
        }

        Some(ThresholdSignal {
            id: Uuid::new_v4(),
            run_id: snapshot.run_id,
            tenant: snapshot.tenant().to_string(),
            policy_id: bound.source_policy.clone(),
            metric,
            observed,
            threshold: bound.limit.threshold,
            signal_type,
            created_at: self.clock.now(),
        })
    }

    /// Strongest signal emitted so far for the pair.
    pub fn last_signal(&self, run_id: RunId, metric: Metric) -> Option<SignalType> {
        self.emitted.get(&(run_id, metric)).map(|s| *s)
    }

    /// Re-arm Near signals for one metric of a run.
    pub fn reset(&self, run_id: RunId, metric: Metric) {
        self.emitted.remove(&(run_id, metric));
    }

    pub fn clear_run(&self, run_id: RunId) {
        self.emitted.retain(|(run, _), _| *run != run_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use lever_core::{
        AggregateWindow, AlertConfig, BindingMoment, ConflictStrategy, EnforcementAction, Limit,
        MonitorConfig, RunIdentity, SystemClock,
    };

    fn snapshot(limits: Vec<Limit>, monitor: MonitorConfig) -> PolicySnapshot {
        PolicySnapshot {
            run_id: Uuid::new_v4(),
            identity: RunIdentity::new("t1"),
            policy_id: "p1".into(),
            policy_version: 1,
            contributing: vec![],
            limits: limits
                .into_iter()
                .map(|limit| BoundLimit {
                    limit,
                    source_policy: "p1".into(),
                })
                .collect(),
            monitor,
            alerts: AlertConfig::default(),
            strategy: ConflictStrategy::MostRestrictive,
            binding_moment: BindingMoment::RunStart,
            bound_at: Utc::now(),
            provisional: false,
        }
    }

    fn evaluator() -> ThresholdEvaluator {
        ThresholdEvaluator::new(Arc::new(SystemClock), EngineMetrics::new())
    }

    #[test]
    fn test_boundaries() {
        let ev = evaluator();
        let snap = snapshot(vec![Limit::new(Metric::Tokens, 100.0)], MonitorConfig::default());
        assert!(ev.evaluate(&snap, Metric::Tokens, 79.9).is_none());
        let near = ev.evaluate(&snap, Metric::Tokens, 80.0).unwrap();
        assert_eq!(near.signal_type, SignalType::Near);
        let breach = ev.evaluate(&snap, Metric::Tokens, 100.0).unwrap();
        assert_eq!(breach.signal_type, SignalType::Breach);
        assert_eq!(breach.threshold, 100.0);
    }

    #[test]
    fn test_second_near_suppressed_breach_not() {
        let ev = evaluator();
        let snap = snapshot(vec![Limit::new(Metric::Cost, 10.0)], MonitorConfig::default());
        assert!(ev.evaluate(&snap, Metric::Cost, 8.5).is_some());
        assert!(ev.evaluate(&snap, Metric::Cost, 9.0).is_none());
        assert!(ev.evaluate(&snap, Metric::Cost, 10.5).is_some());
        assert!(ev.evaluate(&snap, Metric::Cost, 9.5).is_none());
        assert!(ev.evaluate(&snap, Metric::Cost, 11.0).is_some());
        assert_eq!(ev.metrics.get("near_suppressed_total"), Some(2));
    }

    #[test]
    fn test_reset_rearms() {
        let ev = evaluator();
        let snap = snapshot(vec![Limit::new(Metric::Latency, 2.0)], MonitorConfig::default());
        assert!(ev.evaluate(&snap, Metric::Latency, 1.8).is_some());
        ev.reset(snap.run_id, Metric::Latency);
        assert_eq!(ev.last_signal(snap.run_id, Metric::Latency), None);
        assert!(ev.evaluate(&snap, Metric::Latency, 1.9).is_some());
        ev.clear_run(snap.run_id);
        assert!(ev.evaluate(&snap, Metric::Latency, 1.9).is_some());
    }

    fn shared_total(total: f64, run: f64) -> impl Fn(&BoundLimit) -> f64 {
        move |b| if b.limit.aggregate.is_some() { total } else { run }
    }

    #[test]
    fn test_each_limit_uses_its_own_value() {
        let ev = evaluator();
        let mut snap = snapshot(
            vec![Limit::new(Metric::Cost, 2.0).with_action(EnforcementAction::Kill)],
            MonitorConfig::default(),
        );
        snap.limits.push(BoundLimit {
            limit: Limit::new(Metric::Cost, 5.0).with_aggregate(AggregateWindow::Lifetime),
            source_policy: "shared".into(),
        });

        assert!(ev.evaluate_with(&snap, Metric::Cost, shared_total(2.5, 1.0)).is_none());

        let shared = ev
            .evaluate_with(&snap, Metric::Cost, shared_total(5.2, 1.0))
            .unwrap();
        assert_eq!(shared.signal_type, SignalType::Breach);
        assert_eq!(shared.policy_id, "shared");
        assert_eq!(shared.observed, 5.2);

        let per_run = ev
            .evaluate_with(&snap, Metric::Cost, shared_total(5.5, 2.5))
            .unwrap();
        assert_eq!(per_run.policy_id, "p1");
        assert_eq!(per_run.threshold, 2.0);
        assert_eq!(
            snap.limit_for_signal(&per_run).unwrap().limit.action,
            EnforcementAction::Kill
        );
    }

    #[test]
    fn test_ignored_inputs() {
        let ev = evaluator();
        let monitor = MonitorConfig {
            signals: [Metric::Tokens].into_iter().collect(),
            ..MonitorConfig::default()
        };
        let snap = snapshot(
            vec![Limit::new(Metric::Tokens, 10.0), Limit::new(Metric::Cost, 1.0)],
            monitor,
        );
        assert!(ev.evaluate(&snap, Metric::Tokens, f64::NAN).is_none());
        assert!(ev.evaluate(&snap, Metric::Tokens, f64::INFINITY).is_none());
        assert!(ev.evaluate(&snap, Metric::Cost, 50.0).is_none());
        assert!(ev.evaluate(&snap, Metric::BurnRate, 50.0).is_none());
    }
}
