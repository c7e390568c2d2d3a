//! # lever-store
//!
//! SQLite persistence for the policy control lever: versioned policy
//! components behind a movable head pointer, override grants, the
//! append-only audit tables and shared budget counters.

pub mod audit;
pub mod budget;
pub mod overrides;
pub mod policies;
mod schema;
pub mod store;

pub use audit::IntegrityViolation;
pub use schema::{APPEND_ONLY_TABLES, VERSIONED_TABLES};
pub use store::PolicyStore;
