use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::policy::ScopeType;

/// Unique identifier for a run.
pub type RunId = Uuid;

/// Unique identifier for a breach (the id of the Breach signal that raised it).
pub type BreachId = Uuid;

/// Unique identifier for an exercised override.
pub type OverrideId = Uuid;

/// Tenant identifier.
pub type TenantId = String;

/// Policy identifier. Stable across versions.
pub type PolicyId = String;

/// Who is submitting a run. Any identifier except the tenant may be absent,
/// e.g. a machine-to-machine run has no human actor.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunIdentity {
    pub tenant: TenantId,
    #[serde(default)]
    pub agent_id: Option<String>,
    #[serde(default)]
    pub api_key_id: Option<String>,
    #[serde(default)]
    pub human_actor_id: Option<String>,
}

impl RunIdentity {
    pub fn new(tenant: impl Into<String>) -> Self {
        Self {
            tenant: tenant.into(),
            agent_id: None,
            api_key_id: None,
            human_actor_id: None,
        }
    }

    pub fn with_agent(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = Some(agent_id.into());
        self
    }

    pub fn with_api_key(mut self, api_key_id: impl Into<String>) -> Self {
        self.api_key_id = Some(api_key_id.into());
        self
    }

    pub fn with_human_actor(mut self, actor: impl Into<String>) -> Self {
        self.human_actor_id = Some(actor.into());
        self
    }

    /// The identifier this run presents for a given scope type, if any.
    pub fn identifier_for(&self, scope_type: ScopeType) -> Option<&str> {
        match scope_type {
            ScopeType::AllRuns => None,
            ScopeType::Agent => self.agent_id.as_deref(),
            ScopeType::ApiKey => self.api_key_id.as_deref(),
            ScopeType::HumanActor => self.human_actor_id.as_deref(),
        }
    }
}

/// A single concrete scope, written `ALL_RUNS` or `TYPE:identifier`
/// (e.g. `AGENT:a1`). Used by overrides.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ScopeRef {
    pub scope_type: ScopeType,
    pub identifier: Option<String>,
}

impl ScopeRef {
    pub fn all_runs() -> Self {
        Self {
            scope_type: ScopeType::AllRuns,
            identifier: None,
        }
    }

    pub fn agent(id: impl Into<String>) -> Self {
        Self {
            scope_type: ScopeType::Agent,
            identifier: Some(id.into()),
        }
    }

    pub fn api_key(id: impl Into<String>) -> Self {
        Self {
            scope_type: ScopeType::ApiKey,
            identifier: Some(id.into()),
        }
    }

    pub fn human_actor(id: impl Into<String>) -> Self {
        Self {
            scope_type: ScopeType::HumanActor,
            identifier: Some(id.into()),
        }
    }

    /// Whether a run with this identity falls inside the scope.
    /// Tenant checks are the caller's responsibility.
    pub fn covers(&self, identity: &RunIdentity) -> bool {
        match self.scope_type {
            ScopeType::AllRuns => true,
            other => match (identity.identifier_for(other), self.identifier.as_deref()) {
                (Some(have), Some(want)) => have == want,
                _ => false,
            },
        }
    }
}

impl fmt::Display for ScopeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.identifier {
            Some(id) => write!(f, "{}:{}", self.scope_type, id),
            None => write!(f, "{}", self.scope_type),
        }
    }
}

impl FromStr for ScopeRef {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, id) = match s.split_once(':') {
            Some((k, id)) => (k, Some(id.trim())),
            None => (s, None),
        };
        let scope_type: ScopeType = kind.trim().parse()?;
        match (scope_type, id) {
            (ScopeType::AllRuns, None) => Ok(Self::all_runs()),
            (ScopeType::AllRuns, Some(_)) => Err("ALL_RUNS scope takes no identifier".into()),
            (_, Some(id)) if !id.is_empty() => Ok(Self {
                scope_type,
                identifier: Some(id.to_string()),
            }),
            _ => Err(format!("{scope_type} scope requires an identifier")),
        }
    }
}

impl TryFrom<String> for ScopeRef {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ScopeRef> for String {
    fn from(value: ScopeRef) -> Self {
        value.to_string()
    }
}
