//! # lever-server
//!
//! HTTP surface of the policy control lever. Provides:
//!
//! - Policy administration (versioned edits, retirement, history)
//! - Override authorities and time-boxed overrides
//! - Read access to the audit tables
//! - The runtime bridge (`/api/v1/runs`) for admitting runs and reporting metrics
//! - A Server-Sent Events feed of engine events

pub mod error;
mod policies;
mod records;
mod runs;

use axum::{
    Router,
    extract::{Request, State},
    http::{HeaderMap, StatusCode, header},
    middleware::{self, Next},
    response::{Json, Response, Sse, sse::Event as SseEvent, sse::KeepAlive},
    routing::{get, post, put},
};
use futures::stream::Stream;
use serde::Serialize;
use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use lever_config::schema::ServerConfig;
use lever_core::{LeverError, Result};
use lever_engine::PolicyLever;

pub use error::{ApiError, ApiResult};

/// Shared server state.
pub struct AppState {
    pub config: ServerConfig,
    pub lever: Arc<PolicyLever>,
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
    uptime_secs: u64,
    active_runs: usize,
}

/// Build the Axum router.
pub fn build_router(config: ServerConfig, lever: Arc<PolicyLever>) -> Router {
    let state = Arc::new(AppState {
        config: config.clone(),
        lever,
    });

    let api_routes = Router::new()
        .route(
            "/api/v1/policies",
            get(policies::list_policies).post(policies::create_policy),
        )
        .route(
            "/api/v1/policies/{id}",
            get(policies::get_policy).delete(policies::retire_policy),
        )
        .route("/api/v1/policies/{id}/history", get(policies::policy_history))
        .route("/api/v1/policies/{id}/scope", put(policies::update_scope))
        .route(
            "/api/v1/policies/{id}/precedence",
            put(policies::update_precedence),
        )
        .route("/api/v1/policies/{id}/monitor", put(policies::update_monitor))
        .route("/api/v1/policies/{id}/limits", put(policies::update_limits))
        .route("/api/v1/policies/{id}/alerts", put(policies::update_alerts))
        .route(
            "/api/v1/override-authorities",
            get(policies::list_authorities).post(policies::create_authority),
        )
        .route(
            "/api/v1/overrides",
            get(policies::list_overrides).post(policies::authorize_override),
        )
        .route("/api/v1/threshold-signals", get(records::threshold_signals))
        .route("/api/v1/enforcement-actions", get(records::enforcement_actions))
        .route("/api/v1/denials", get(records::denials))
        .route("/api/v1/integrity", get(records::integrity))
        .route("/api/v1/runs", post(runs::start_run))
        .route("/api/v1/runs/{id}", get(runs::run_status))
        .route("/api/v1/runs/{id}/metrics", post(runs::report_metric))
        .route("/api/v1/runs/{id}/resume", post(runs::resume_run))
        .route("/api/v1/runs/{id}/end", post(runs::end_run))
        .route("/api/v1/events", get(events_handler));

    let api_routes = if config.api_key.is_some() {
        api_routes.layer(middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ))
    } else {
        api_routes
    };

    let mut router = Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .merge(api_routes)
        .layer(middleware::from_fn_with_state(state.clone(), track_requests))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    if config.cors {
        router = router.layer(CorsLayer::permissive());
    }

    router
}

/// Checks the Authorization header against the configured API key.
async fn auth_middleware(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    request: Request,
    next: Next,
) -> std::result::Result<Response, ApiError> {
    if let Some(ref expected_key) = state.config.api_key {
        let provided = headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "));
        match provided {
            Some(key) if key == expected_key => {}
            _ => {
                warn!("unauthorized API request, invalid or missing API key");
                return Err(ApiError::unauthorized());
            }
        }
    }
    Ok(next.run(request).await)
}

async fn track_requests(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    let metrics = state.lever.metrics();
    metrics.inc_http_requests();
    let response = next.run(request).await;
    let status = response.status();
    if status.is_client_error() || status.is_server_error() {
        metrics.inc_http_errors();
    }
    response
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".into(),
        version: env!("CARGO_PKG_VERSION").into(),
        uptime_secs: state.lever.metrics().uptime_secs(),
        active_runs: state.lever.active_runs(),
    })
}

/// Prometheus-compatible metrics endpoint.
async fn metrics_handler(
    State(state): State<Arc<AppState>>,
) -> (StatusCode, [(header::HeaderName, &'static str); 1], String) {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        state.lever.metrics().render_prometheus(),
    )
}

/// Engine events as Server-Sent Events. Slow consumers skip what they missed.
async fn events_handler(
    State(state): State<Arc<AppState>>,
) -> Sse<impl Stream<Item = std::result::Result<SseEvent, Infallible>>> {
    let mut rx = state.lever.bus().subscribe();
    let stream = async_stream::stream! {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    let data = serde_json::to_string(&event).unwrap_or_default();
                    yield Ok(SseEvent::default().data(data));
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "event stream subscriber lagged");
                }
                Err(RecvError::Closed) => break,
            }
        }
    };
    Sse::new(stream).keep_alive(KeepAlive::default())
}

/// Start the HTTP server.
pub async fn start_server(config: ServerConfig, lever: Arc<PolicyLever>) -> Result<()> {
    let listen = config.listen.clone();
    let router = build_router(config, lever);

    info!(listen = %listen, "starting HTTP server");

    let listener = tokio::net::TcpListener::bind(&listen)
        .await
        .map_err(|e| LeverError::Config(format!("failed to bind {listen}: {e}")))?;

    axum::serve(listener, router).await?;

    Ok(())
}
