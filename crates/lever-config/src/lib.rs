//! # lever-config
//!
//! Configuration for the policy control lever. Reads `lever.toml`, then
//! applies environment variable overrides on top.

pub mod loader;
pub mod schema;

pub use loader::ConfigLoader;
pub use schema::LeverConfig;
pub use schema::{
    AlertsConfig, AuditConfig, ChannelConfig, ConfigWarning, DefaultPolicyConfig,
    EvaluatorConfig, LimitConfig, LoggingConfig, ServerConfig, StoreConfig, WarningSeverity,
    DEFAULT_POLICY_ID,
};
