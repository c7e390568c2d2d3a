//! # lever-engine
//!
//! The runtime side of the policy control lever. A run is admitted through
//! [`PolicyLever::on_run_start`]: the [`ScopeResolver`] finds candidate
//! policies, [`arbitrate`] reduces them to one snapshot. Each reported
//! metric then goes through the [`ThresholdEvaluator`]; breaches reach the
//! [`EnforcementActuator`], which consults the [`OverrideService`], and every
//! signal is handed to the [`AlertEmitter`]. Audit rows are written by a
//! background [`AuditWriter`].

pub mod actuator;
pub mod alerts;
pub mod arbitrator;
pub mod audit;
pub mod budget;
pub mod evaluator;
pub mod lever;
pub mod metrics;
pub mod overrides;
pub mod resolver;
pub mod runtime;

pub use actuator::{ActionOutcome, EnforcementActuator, transition};
pub use alerts::{AlertEmitter, ChannelOutcome};
pub use arbitrator::{Arbitration, arbitrate};
pub use audit::{AuditRecord, AuditSettings, AuditWriter};
pub use budget::BudgetLedger;
pub use evaluator::ThresholdEvaluator;
pub use lever::{LeverBuilder, PolicyLever, RunStatus};
pub use metrics::EngineMetrics;
pub use overrides::OverrideService;
pub use resolver::{ScopeResolver, sort_candidates};
pub use runtime::{ExecutionRuntime, TracingRuntime};
