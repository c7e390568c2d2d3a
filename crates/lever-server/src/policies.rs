use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
};
use serde::Deserialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use lever_core::{
    AlertConfig, Limit, LeverError, MonitorConfig, OverrideAuthority, OverrideRecord, Policy,
    PolicyDraft, PolicyPrecedence, PolicyScope, ScopeRef,
};

use crate::AppState;
use crate::error::{ApiError, ApiResult};

#[derive(Deserialize)]
pub(crate) struct TenantFilter {
    tenant: Option<String>,
}

#[derive(Deserialize)]
pub(crate) struct VersionParam {
    version: Option<u32>,
}

// ── Policies ───────────────────────────────────────────────────

pub(crate) async fn list_policies(
    State(state): State<Arc<AppState>>,
    Query(filter): Query<TenantFilter>,
) -> ApiResult<Json<Vec<Policy>>> {
    Ok(Json(
        state.lever.store().list_policies(filter.tenant.as_deref())?,
    ))
}

pub(crate) async fn create_policy(
    State(state): State<Arc<AppState>>,
    Json(draft): Json<PolicyDraft>,
) -> ApiResult<(StatusCode, Json<Policy>)> {
    let now = state.lever.clock().now();
    let policy = state.lever.store().create_policy(draft, now)?;
    Ok((StatusCode::CREATED, Json(policy)))
}

/// Current version, or a specific one with `?version=`.
pub(crate) async fn get_policy(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(param): Query<VersionParam>,
) -> ApiResult<Json<Policy>> {
    let store = state.lever.store();
    let policy = match param.version {
        Some(version) => store.get_policy_version(&id, version)?,
        None => store.get_policy(&id)?,
    };
    policy
        .map(Json)
        .ok_or_else(|| LeverError::PolicyNotFound(id).into())
}

pub(crate) async fn policy_history(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Vec<Policy>>> {
    let history = state.lever.store().policy_history(&id)?;
    if history.is_empty() {
        return Err(LeverError::PolicyNotFound(id).into());
    }
    Ok(Json(history))
}

pub(crate) async fn retire_policy(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    let now = state.lever.clock().now();
    state.lever.store().retire_policy(&id, now)?;
    Ok(StatusCode::NO_CONTENT)
}

pub(crate) async fn update_scope(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(scope): Json<PolicyScope>,
) -> ApiResult<Json<Policy>> {
    let now = state.lever.clock().now();
    Ok(Json(state.lever.store().update_scope(&id, scope, now)?))
}

pub(crate) async fn update_precedence(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(precedence): Json<PolicyPrecedence>,
) -> ApiResult<Json<Policy>> {
    let now = state.lever.clock().now();
    Ok(Json(
        state.lever.store().update_precedence(&id, precedence, now)?,
    ))
}

pub(crate) async fn update_monitor(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(monitor): Json<MonitorConfig>,
) -> ApiResult<Json<Policy>> {
    let now = state.lever.clock().now();
    Ok(Json(state.lever.store().update_monitor(&id, monitor, now)?))
}

pub(crate) async fn update_limits(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(limits): Json<Vec<Limit>>,
) -> ApiResult<Json<Policy>> {
    let now = state.lever.clock().now();
    Ok(Json(state.lever.store().update_limits(&id, limits, now)?))
}

pub(crate) async fn update_alerts(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(alerts): Json<AlertConfig>,
) -> ApiResult<Json<Policy>> {
    let now = state.lever.clock().now();
    Ok(Json(state.lever.store().update_alerts(&id, alerts, now)?))
}

// ── Override authorities ───────────────────────────────────────

#[derive(Deserialize)]
pub(crate) struct AuthorityRequest {
    id: Option<String>,
    scope: PolicyScope,
    actors: BTreeSet<String>,
    max_duration_secs: u64,
}

pub(crate) async fn list_authorities(
    State(state): State<Arc<AppState>>,
    Query(filter): Query<TenantFilter>,
) -> ApiResult<Json<Vec<OverrideAuthority>>> {
    Ok(Json(
        state
            .lever
            .store()
            .override_authorities(filter.tenant.as_deref())?,
    ))
}

pub(crate) async fn create_authority(
    State(state): State<Arc<AppState>>,
    Json(req): Json<AuthorityRequest>,
) -> ApiResult<(StatusCode, Json<OverrideAuthority>)> {
    let authority = OverrideAuthority {
        id: req.id.unwrap_or_else(|| Uuid::new_v4().to_string()),
        scope: req.scope,
        actors: req.actors,
        max_duration_secs: req.max_duration_secs,
        created_at: state.lever.clock().now(),
    };
    state.lever.store().insert_override_authority(&authority)?;
    info!(
        authority_id = %authority.id,
        tenant = %authority.scope.tenant,
        "override authority granted"
    );
    Ok((StatusCode::CREATED, Json(authority)))
}

// ── Overrides ──────────────────────────────────────────────────

#[derive(Deserialize)]
pub(crate) struct OverrideRequest {
    tenant: String,
    actor: String,
    scope: ScopeRef,
    duration_secs: i64,
    justification: String,
}

#[derive(Deserialize)]
pub(crate) struct OverrideQuery {
    tenant: Option<String>,
    #[serde(default)]
    active: bool,
}

pub(crate) async fn authorize_override(
    State(state): State<Arc<AppState>>,
    Json(req): Json<OverrideRequest>,
) -> ApiResult<(StatusCode, Json<OverrideRecord>)> {
    let duration = chrono::Duration::try_seconds(req.duration_secs).ok_or_else(|| {
        ApiError::bad_request(format!("duration_secs {} is out of range", req.duration_secs))
    })?;
    let record = state.lever.overrides().authorize(
        &req.tenant,
        &req.actor,
        req.scope,
        duration,
        &req.justification,
    )?;
    Ok((StatusCode::CREATED, Json(record)))
}

/// Override records of one tenant; `?active=true` keeps the open windows only.
pub(crate) async fn list_overrides(
    State(state): State<Arc<AppState>>,
    Query(query): Query<OverrideQuery>,
) -> ApiResult<Json<Vec<OverrideRecord>>> {
    let tenant = query
        .tenant
        .ok_or_else(|| ApiError::bad_request("the tenant query parameter is required"))?;
    if query.active {
        let now = state.lever.clock().now();
        return Ok(Json(state.lever.overrides().active_for(&tenant, now)));
    }
    Ok(Json(state.lever.store().override_records(&tenant)?))
}
