//! Precedence and conflict resolution over a run's candidate policies.

use chrono::{DateTime, Utc};
use lever_core::{
    AggregateWindow, AlertConfig, BindingMoment, BoundLimit, ConflictStrategy, LeverError, Limit,
    Metric, MonitorConfig, Policy, PolicyId, PolicyRef, PolicySnapshot, Result, RunId,
    RunIdentity,
};
use std::collections::BTreeMap;

use crate::resolver::sort_candidates;

/// Outcome of a successful arbitration, ready to become a snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct Arbitration {
    pub winner: PolicyRef,
    pub contributing: Vec<PolicyRef>,
    /// Strategy in force: `FAIL_CLOSED` when any candidate declares it.
    pub strategy: ConflictStrategy,
    /// Strategy whose merge rule produced `limits`.
    pub resolved_by: ConflictStrategy,
    pub limits: Vec<BoundLimit>,
    pub monitor: MonitorConfig,
    pub alerts: AlertConfig,
    pub binding_moment: BindingMoment,
}

impl Arbitration {
    pub fn into_snapshot(
        self,
        run_id: RunId,
        identity: RunIdentity,
        bound_at: DateTime<Utc>,
        provisional: bool,
    ) -> PolicySnapshot {
        PolicySnapshot {
            run_id,
            identity,
            policy_id: self.winner.id,
            policy_version: self.winner.version,
            contributing: self.contributing,
            limits: self.limits,
            monitor: self.monitor,
            alerts: self.alerts,
            strategy: self.strategy,
            binding_moment: self.binding_moment,
            bound_at,
            provisional,
        }
    }
}

/// Reduce the candidate set to one binding policy. All-or-nothing: either a
/// complete arbitration or `AmbiguousPolicy`.
///
/// Under `FAIL_CLOSED` the declaring policies only gate admission; the settled
/// strategy is applied to the remaining candidates, or to all of them when
/// every candidate is fail-closed.
pub fn arbitrate(candidates: &[Policy]) -> Result<Arbitration> {
    let mut sorted = candidates.to_vec();
    sort_candidates(&mut sorted);

    let fail_closed = sorted
        .iter()
        .any(|p| p.precedence.strategy == ConflictStrategy::FailClosed);
    let (strategy, resolved_by, governing) = if fail_closed {
        let others: Vec<&Policy> = sorted
            .iter()
            .filter(|p| p.precedence.strategy != ConflictStrategy::FailClosed)
            .collect();
        let resolved_by = fail_closed_strategy(&others)?;
        let governing = if others.is_empty() {
            sorted.iter().collect()
        } else {
            others
        };
        (ConflictStrategy::FailClosed, resolved_by, governing)
    } else {
        let declared = sorted
            .first()
            .map(|p| p.precedence.strategy)
            .unwrap_or(ConflictStrategy::MostRestrictive);
        (declared, declared, sorted.iter().collect::<Vec<_>>())
    };

    let Some(&winner) = governing.first() else {
        return Err(LeverError::AmbiguousPolicy {
            reason: "no candidate policies".into(),
        });
    };

    let (limits, monitor) = match resolved_by {
        ConflictStrategy::ExplicitPriority => (
            winner
                .limits
                .iter()
                .map(|l| BoundLimit {
                    limit: l.clone(),
                    source_policy: winner.id.clone(),
                })
                .collect(),
            winner.monitor.clone(),
        ),
        _ => (
            most_restrictive(&governing),
            governing
                .iter()
                .skip(1)
                .fold(winner.monitor.clone(), |acc, p| acc.merge(&p.monitor)),
        ),
    };

    Ok(Arbitration {
        winner: policy_ref(winner),
        contributing: sorted.iter().map(policy_ref).collect(),
        strategy,
        resolved_by,
        limits,
        monitor,
        alerts: winner.alerts.clone(),
        binding_moment: winner.precedence.binding_moment,
    })
}

/// The non-fail-closed candidates must agree on a strategy and explicit
/// priorities must not tie.
fn fail_closed_strategy(others: &[&Policy]) -> Result<ConflictStrategy> {
    let Some(first) = others.first() else {
        return Ok(ConflictStrategy::MostRestrictive);
    };
    let unanimous = first.precedence.strategy;
    if let Some(dissent) = others.iter().find(|p| p.precedence.strategy != unanimous) {
        return Err(LeverError::AmbiguousPolicy {
            reason: format!(
                "policies {} ({}) and {} ({}) declare conflicting strategies under FAIL_CLOSED",
                first.id, unanimous, dissent.id, dissent.precedence.strategy
            ),
        });
    }

    if unanimous == ConflictStrategy::ExplicitPriority {
        for pair in others.windows(2) {
            if pair[0].precedence.priority == pair[1].precedence.priority {
                return Err(LeverError::AmbiguousPolicy {
                    reason: format!(
                        "EXPLICIT_PRIORITY policies {} and {} tie at priority {}",
                        pair[0].id, pair[1].id, pair[0].precedence.priority
                    ),
                });
            }
        }
    }
    Ok(unanimous)
}

/// Per-run limits of a metric collapse into one: lowest threshold (attributed
/// to the policy that set it), most severe action, smallest near ratio.
/// A shared budget is counted under its own policy and window, so it only
/// merges with that policy's limits on the same window.
fn most_restrictive(policies: &[&Policy]) -> Vec<BoundLimit> {
    let mut merged: BTreeMap<(Metric, Option<(AggregateWindow, PolicyId)>), BoundLimit> =
        BTreeMap::new();
    for policy in policies {
        for limit in &policy.limits {
            let key = (
                limit.metric,
                limit.aggregate.map(|window| (window, policy.id.clone())),
            );
            match merged.get_mut(&key) {
                None => {
                    merged.insert(
                        key,
                        BoundLimit {
                            limit: limit.clone(),
                            source_policy: policy.id.clone(),
                        },
                    );
                }
                Some(bound) => tighten(bound, limit, &policy.id),
            }
        }
    }
    merged.into_values().collect()
}

fn tighten(bound: &mut BoundLimit, limit: &Limit, policy_id: &str) {
    if limit.threshold < bound.limit.threshold {
        bound.limit.threshold = limit.threshold;
        bound.source_policy = policy_id.to_string();
    }
    bound.limit.action = bound.limit.action.max(limit.action);
    bound.limit.near_ratio = bound.limit.near_ratio.min(limit.near_ratio);
}

fn policy_ref(policy: &Policy) -> PolicyRef {
    PolicyRef {
        id: policy.id.clone(),
        version: policy.version,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lever_core::{
        EnforcementAction, NegativeCapability, PolicyPrecedence, PolicyScope, ScopeType,
    };

    fn policy(id: &str, priority: u32, strategy: ConflictStrategy, limits: Vec<Limit>) -> Policy {
        Policy {
            id: id.into(),
            version: 1,
            name: id.into(),
            scope: PolicyScope::all_runs("t1"),
            precedence: PolicyPrecedence {
                priority,
                strategy,
                binding_moment: BindingMoment::RunStart,
            },
            monitor: MonitorConfig::default(),
            limits,
            alerts: AlertConfig::default(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_most_restrictive_takes_minimum() {
        let p1 = policy(
            "p1",
            10,
            ConflictStrategy::MostRestrictive,
            vec![Limit::new(Metric::Cost, 5.0).with_action(EnforcementAction::Kill)],
        );
        let mut p2 = policy(
            "p2",
            20,
            ConflictStrategy::MostRestrictive,
            vec![Limit::new(Metric::Cost, 2.0).with_near_ratio(0.9)],
        );
        p2.scope = PolicyScope::of("t1", ScopeType::Agent, ["a1"]);

        let arb = arbitrate(&[p2, p1]).unwrap();
        assert_eq!(arb.winner.id, "p1");
        let cost = &arb.limits[0];
        assert_eq!(cost.limit.threshold, 2.0);
        assert_eq!(cost.source_policy, "p2");
        assert_eq!(cost.limit.action, EnforcementAction::Kill);
        assert_eq!(cost.limit.near_ratio, 0.8);
    }

    #[test]
    fn test_explicit_priority_winner_only() {
        let p1 = policy(
            "p1",
            1,
            ConflictStrategy::ExplicitPriority,
            vec![Limit::new(Metric::Tokens, 1000.0)],
        );
        let p2 = policy(
            "p2",
            2,
            ConflictStrategy::MostRestrictive,
            vec![Limit::new(Metric::Tokens, 10.0), Limit::new(Metric::Cost, 1.0)],
        );
        let arb = arbitrate(&[p1, p2]).unwrap();
        assert_eq!(arb.resolved_by, ConflictStrategy::ExplicitPriority);
        assert_eq!(arb.limits.len(), 1);
        assert_eq!(arb.limits[0].limit.threshold, 1000.0);
    }

    #[test]
    fn test_shared_budgets_stay_separate() {
        let p1 = policy(
            "p1",
            1,
            ConflictStrategy::MostRestrictive,
            vec![Limit::new(Metric::Cost, 5.0).with_aggregate(AggregateWindow::Lifetime)],
        );
        let p2 = policy(
            "p2",
            2,
            ConflictStrategy::MostRestrictive,
            vec![
                Limit::new(Metric::Cost, 2.0).with_action(EnforcementAction::Kill),
                Limit::new(Metric::Cost, 8.0).with_aggregate(AggregateWindow::Daily),
            ],
        );
        let p3 = policy(
            "p3",
            3,
            ConflictStrategy::MostRestrictive,
            vec![Limit::new(Metric::Cost, 3.0).with_aggregate(AggregateWindow::Lifetime)],
        );
        let arb = arbitrate(&[p1, p2, p3]).unwrap();
        assert_eq!(arb.limits.len(), 4);

        let per_run = &arb.limits[0];
        assert_eq!(per_run.limit.aggregate, None);
        assert_eq!(per_run.limit.threshold, 2.0);
        assert_eq!(per_run.limit.action, EnforcementAction::Kill);
        assert_eq!(per_run.source_policy, "p2");

        let shared = |id: &str, window| {
            arb.limits
                .iter()
                .find(|b| b.source_policy == id && b.limit.aggregate == Some(window))
                .map(|b| b.limit.threshold)
        };
        assert_eq!(shared("p1", AggregateWindow::Lifetime), Some(5.0));
        assert_eq!(shared("p2", AggregateWindow::Daily), Some(8.0));
        assert_eq!(shared("p3", AggregateWindow::Lifetime), Some(3.0));
    }

    #[test]
    fn test_fail_closed_guard_does_not_win() {
        let guard = policy("guard", 1, ConflictStrategy::FailClosed, vec![]);
        let mut ep = policy(
            "agent-ep",
            5,
            ConflictStrategy::ExplicitPriority,
            vec![Limit::new(Metric::Cost, 3.0).with_action(EnforcementAction::Kill)],
        );
        ep.precedence.binding_moment = BindingMoment::FirstToken;
        let arb = arbitrate(&[guard, ep]).unwrap();
        assert_eq!(arb.strategy, ConflictStrategy::FailClosed);
        assert_eq!(arb.resolved_by, ConflictStrategy::ExplicitPriority);
        assert_eq!(arb.winner.id, "agent-ep");
        assert_eq!(arb.contributing.len(), 2);
        assert_eq!(arb.limits.len(), 1);
        assert_eq!(arb.limits[0].limit.threshold, 3.0);
        assert_eq!(arb.binding_moment, BindingMoment::FirstToken);
    }

    #[test]
    fn test_fail_closed_most_restrictive_merges_others() {
        let guard = policy("guard", 1, ConflictStrategy::FailClosed, vec![]);
        let p2 = policy(
            "p2",
            2,
            ConflictStrategy::MostRestrictive,
            vec![Limit::new(Metric::Cost, 4.0)],
        );
        let p3 = policy(
            "p3",
            3,
            ConflictStrategy::MostRestrictive,
            vec![Limit::new(Metric::Cost, 6.0).with_action(EnforcementAction::Stop)],
        );
        let arb = arbitrate(&[guard, p2, p3]).unwrap();
        assert_eq!(arb.resolved_by, ConflictStrategy::MostRestrictive);
        assert_eq!(arb.winner.id, "p2");
        assert_eq!(arb.limits[0].limit.threshold, 4.0);
        assert_eq!(arb.limits[0].limit.action, EnforcementAction::Stop);
    }

    #[test]
    fn test_explicit_priority_ignores_lower_monitors() {
        let mut p1 = policy(
            "p1",
            1,
            ConflictStrategy::ExplicitPriority,
            vec![Limit::new(Metric::Tokens, 1000.0)],
        );
        p1.monitor.signals = [Metric::Tokens].into_iter().collect();
        let mut p2 = policy("p2", 2, ConflictStrategy::MostRestrictive, vec![]);
        p2.monitor.signals = [Metric::Cost].into_iter().collect();
        p2.monitor.forbid.insert(NegativeCapability::PromptLogging);

        let arb = arbitrate(&[p1.clone(), p2.clone()]).unwrap();
        assert_eq!(arb.monitor, p1.monitor);

        p1.precedence.strategy = ConflictStrategy::MostRestrictive;
        let merged = arbitrate(&[p1, p2]).unwrap();
        assert!(merged.monitor.signals.contains(&Metric::Cost));
        assert!(!merged.monitor.permits(NegativeCapability::PromptLogging));
    }

    #[test]
    fn test_fail_closed_conflicting_strategies() {
        let p1 = policy("p1", 1, ConflictStrategy::FailClosed, vec![]);
        let p2 = policy("p2", 2, ConflictStrategy::MostRestrictive, vec![]);
        let p3 = policy("p3", 3, ConflictStrategy::ExplicitPriority, vec![]);
        let err = arbitrate(&[p1, p2, p3]).unwrap_err();
        assert_eq!(err.code(), "AMBIGUOUS_POLICY");
    }

    #[test]
    fn test_fail_closed_priority_tie() {
        let p1 = policy("p1", 1, ConflictStrategy::FailClosed, vec![]);
        let p2 = policy("p2", 5, ConflictStrategy::ExplicitPriority, vec![]);
        let p3 = policy("p3", 5, ConflictStrategy::ExplicitPriority, vec![]);
        assert!(matches!(
            arbitrate(&[p1, p2, p3]),
            Err(LeverError::AmbiguousPolicy { .. })
        ));
    }

    #[test]
    fn test_fail_closed_unanimous() {
        let p1 = policy("p1", 9, ConflictStrategy::FailClosed, vec![Limit::new(Metric::Cost, 3.0)]);
        let p2 = policy(
            "p2",
            1,
            ConflictStrategy::ExplicitPriority,
            vec![Limit::new(Metric::Cost, 7.0)],
        );
        let arb = arbitrate(&[p1, p2]).unwrap();
        assert_eq!(arb.strategy, ConflictStrategy::FailClosed);
        assert_eq!(arb.resolved_by, ConflictStrategy::ExplicitPriority);
        assert_eq!(arb.winner.id, "p2");
        assert_eq!(arb.limits[0].limit.threshold, 7.0);

        let only = arbitrate(&[policy("p9", 1, ConflictStrategy::FailClosed, vec![])]).unwrap();
        assert_eq!(only.resolved_by, ConflictStrategy::MostRestrictive);
    }

    #[test]
    fn test_empty_candidates() {
        assert!(arbitrate(&[]).is_err());
    }
}
