use axum::{
    Json,
    extract::{Query, State},
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use lever_core::{AdmissionDenial, EnforcementRecord, RunId, ThresholdSignal};

use crate::AppState;
use crate::error::{ApiError, ApiResult};

#[derive(Deserialize)]
pub(crate) struct RecordQuery {
    run_id: Option<RunId>,
    tenant: Option<String>,
}

#[derive(Serialize)]
pub(crate) struct IntegrityReport {
    ok: bool,
    violations: Vec<Violation>,
}

#[derive(Serialize)]
struct Violation {
    table: &'static str,
    id: String,
}

pub(crate) async fn threshold_signals(
    State(state): State<Arc<AppState>>,
    Query(query): Query<RecordQuery>,
) -> ApiResult<Json<Vec<ThresholdSignal>>> {
    let store = state.lever.store();
    let signals = match (query.run_id, query.tenant) {
        (Some(run_id), _) => store.signals_for_run(run_id)?,
        (None, Some(tenant)) => store.signals_for_tenant(&tenant)?,
        (None, None) => return Err(ApiError::bad_request("run_id or tenant is required")),
    };
    Ok(Json(signals))
}

pub(crate) async fn enforcement_actions(
    State(state): State<Arc<AppState>>,
    Query(query): Query<RecordQuery>,
) -> ApiResult<Json<Vec<EnforcementRecord>>> {
    let run_id = query
        .run_id
        .ok_or_else(|| ApiError::bad_request("run_id is required"))?;
    Ok(Json(state.lever.store().enforcement_for_run(run_id)?))
}

pub(crate) async fn denials(
    State(state): State<Arc<AppState>>,
    Query(query): Query<RecordQuery>,
) -> ApiResult<Json<Vec<AdmissionDenial>>> {
    let tenant = query
        .tenant
        .ok_or_else(|| ApiError::bad_request("tenant is required"))?;
    Ok(Json(state.lever.store().denials_for_tenant(&tenant)?))
}

/// Recheck every audit row against its stored checksum.
pub(crate) async fn integrity(
    State(state): State<Arc<AppState>>,
) -> ApiResult<Json<IntegrityReport>> {
    let violations: Vec<Violation> = state
        .lever
        .store()
        .verify_integrity()?
        .into_iter()
        .map(|v| Violation {
            table: v.table,
            id: v.id,
        })
        .collect();
    Ok(Json(IntegrityReport {
        ok: violations.is_empty(),
        violations,
    }))
}
