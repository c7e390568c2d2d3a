use thiserror::Error;

use crate::run::RunId;

/// Unified error type for the policy control lever.
#[derive(Error, Debug)]
pub enum LeverError {
    // ── Admission errors ───────────────────────────────────────
    #[error("ambiguous policy: {reason}")]
    AmbiguousPolicy { reason: String },

    #[error("run is unscoped: no fallback policy configured for tenant {tenant}")]
    UnscopedRun { tenant: String },

    // ── Policy errors ──────────────────────────────────────────
    #[error("invalid policy: {field}: {reason}")]
    InvalidPolicy { field: String, reason: String },

    #[error("policy not found: {0}")]
    PolicyNotFound(String),

    #[error("run not found: {0}")]
    RunNotFound(RunId),

    #[error("run {run_id} is {state}: {reason}")]
    InvalidRunState {
        run_id: RunId,
        state: String,
        reason: String,
    },

    // ── Override errors ────────────────────────────────────────
    #[error("override denied: {0}")]
    OverrideDenied(String),

    // ── Channel errors ─────────────────────────────────────────
    #[error("channel dispatch failed: {channel}: {reason}")]
    ChannelDispatch { channel: String, reason: String },

    // ── Storage errors ─────────────────────────────────────────
    #[error("store error: {0}")]
    Store(String),

    // ── Config errors ──────────────────────────────────────────
    #[error("config error: {0}")]
    Config(String),

    #[error("config validation failed: {field}: {reason}")]
    ConfigValidation { field: String, reason: String },

    // ── Generic wrappers ───────────────────────────────────────
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl LeverError {
    /// Stable reason code surfaced to administrators and API clients.
    pub fn code(&self) -> &'static str {
        match self {
            Self::AmbiguousPolicy { .. } => "AMBIGUOUS_POLICY",
            Self::UnscopedRun { .. } => "UNSCOPED_RUN",
            Self::InvalidPolicy { .. } => "INVALID_POLICY",
            Self::PolicyNotFound(_) => "POLICY_NOT_FOUND",
            Self::RunNotFound(_) => "RUN_NOT_FOUND",
            Self::InvalidRunState { .. } => "INVALID_RUN_STATE",
            Self::OverrideDenied(_) => "OVERRIDE_DENIED",
            Self::ChannelDispatch { .. } => "CHANNEL_DISPATCH_FAILED",
            Self::Store(_) => "STORE_ERROR",
            Self::Config(_) | Self::ConfigValidation { .. } => "CONFIG_ERROR",
            Self::Io(_) => "IO_ERROR",
            Self::Serialization(_) => "SERIALIZATION_ERROR",
            Self::Other(_) => "INTERNAL_ERROR",
        }
    }

    pub fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidPolicy {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, LeverError>;
