//! # lever-core
//!
//! Shared vocabulary of the policy control lever: policies and their parts,
//! run identities, snapshots, threshold signals, audit records, events and
//! the workspace error type.

#[macro_use]
mod macros;

pub mod audit;
pub mod clock;
pub mod error;
pub mod event;
pub mod policy;
pub mod run;
pub mod signal;
pub mod snapshot;

pub use audit::{AdmissionDenial, EnforcementRecord, OverrideRecord, RunState};
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{LeverError, Result};
pub use event::{EventBus, LeverEvent};
pub use policy::*;
pub use run::*;
pub use signal::{AlertPayload, SignalType, ThresholdSignal};
pub use snapshot::{BoundLimit, PolicyRef, PolicySnapshot};
