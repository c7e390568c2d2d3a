use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use lever_core::{Metric, PolicySnapshot, RunId, RunIdentity, RunState, ThresholdSignal};
use lever_engine::RunStatus;

use crate::AppState;
use crate::error::ApiResult;

#[derive(Deserialize)]
pub(crate) struct MetricReport {
    metric: Metric,
    value: f64,
}

#[derive(Serialize)]
pub(crate) struct MetricResponse {
    signal: Option<ThresholdSignal>,
    state: Option<RunState>,
}

#[derive(Serialize)]
pub(crate) struct StateResponse {
    run_id: RunId,
    state: RunState,
}

/// Admit a run. Denials come back as 403 with the reason code.
pub(crate) async fn start_run(
    State(state): State<Arc<AppState>>,
    Json(identity): Json<RunIdentity>,
) -> ApiResult<(StatusCode, Json<PolicySnapshot>)> {
    let snapshot = state.lever.on_run_start(identity)?;
    Ok((StatusCode::CREATED, Json(snapshot)))
}

pub(crate) async fn run_status(
    State(state): State<Arc<AppState>>,
    Path(run_id): Path<RunId>,
) -> ApiResult<Json<RunStatus>> {
    Ok(Json(state.lever.run_status(run_id)?))
}

pub(crate) async fn report_metric(
    State(state): State<Arc<AppState>>,
    Path(run_id): Path<RunId>,
    Json(report): Json<MetricReport>,
) -> ApiResult<Json<MetricResponse>> {
    let signal = state
        .lever
        .on_step_metric(run_id, report.metric, report.value)?;
    Ok(Json(MetricResponse {
        signal,
        state: state.lever.run_state(run_id),
    }))
}

pub(crate) async fn resume_run(
    State(state): State<Arc<AppState>>,
    Path(run_id): Path<RunId>,
) -> ApiResult<Json<StateResponse>> {
    let resumed = state.lever.resume(run_id)?;
    Ok(Json(StateResponse {
        run_id,
        state: resumed,
    }))
}

pub(crate) async fn end_run(
    State(state): State<Arc<AppState>>,
    Path(run_id): Path<RunId>,
) -> ApiResult<StatusCode> {
    state.lever.end_run(run_id)?;
    Ok(StatusCode::NO_CONTENT)
}
