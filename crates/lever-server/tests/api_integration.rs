//! HTTP API integration tests: every route driven through the router with an in-memory store.

use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use parking_lot::RwLock;
use serde_json::{Value, json};
use std::sync::Arc;
use tower::ServiceExt;

use lever_config::LeverConfig;
use lever_config::schema::ServerConfig;
use lever_engine::PolicyLever;
use lever_store::PolicyStore;

async fn setup_with(api_key: Option<&str>) -> (axum::Router, Arc<PolicyLever>) {
    let lever = PolicyLever::builder(
        PolicyStore::open_in_memory().unwrap(),
        Arc::new(RwLock::new(LeverConfig::default())),
    )
    .build()
    .unwrap();
    let lever = Arc::new(lever);
    let server_config = ServerConfig {
        api_key: api_key.map(String::from),
        cors: false,
        ..Default::default()
    };
    (
        lever_server::build_router(server_config, Arc::clone(&lever)),
        lever,
    )
}

async fn setup() -> axum::Router {
    setup_with(None).await.0
}

/// Helper to read the full body bytes from a response.
async fn body_string(resp: axum::response::Response) -> String {
    let bytes = resp.into_body().collect().await.unwrap().to_bytes();
    String::from_utf8(bytes.to_vec()).unwrap()
}

async fn body_json(resp: axum::response::Response) -> Value {
    serde_json::from_str(&body_string(resp).await).unwrap()
}

async fn send(app: &axum::Router, method: &str, uri: &str, body: Option<Value>) -> axum::response::Response {
    let builder = Request::builder().method(method).uri(uri);
    let req = match body {
        Some(v) => builder
            .header("content-type", "application/json")
            .body(Body::from(v.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };
    app.clone().oneshot(req).await.unwrap()
}

fn cost_policy(id: &str, threshold: f64, action: &str) -> Value {
    json!({
        "id": id,
        "name": id,
        "scope": { "tenant": "t1", "scope_type": "ALL_RUNS" },
        "limits": [{ "metric": "cost", "threshold": threshold, "action": action }],
        "alerts": { "channels": ["UI"], "max_alerts_per_run": 5, "min_interval_secs": 0 }
    })
}

// ── Health & Metrics ───────────────────────────────────────────

#[tokio::test]
async fn test_health_endpoint() {
    let app = setup().await;
    let resp = send(&app, "GET", "/health", None).await;
    assert_eq!(resp.status(), StatusCode::OK);
    let json = body_json(resp).await;
    assert_eq!(json["status"], "ok");
    assert!(json["version"].is_string());
    assert_eq!(json["active_runs"], 0);
}

#[tokio::test]
async fn test_metrics_endpoint() {
    let app = setup().await;
    send(&app, "GET", "/health", None).await;
    let resp = send(&app, "GET", "/metrics", None).await;
    assert_eq!(resp.status(), StatusCode::OK);
    let ct = resp
        .headers()
        .get("content-type")
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    assert!(ct.contains("text/plain"));
    let body = body_string(resp).await;
    assert!(body.contains("lever_http_requests_total"));
    assert!(body.contains("lever_runs_admitted_total 0"));
}

// ── Policies ───────────────────────────────────────────────────

#[tokio::test]
async fn test_policy_versioning_roundtrip() {
    let app = setup().await;
    let resp = send(&app, "POST", "/api/v1/policies", Some(cost_policy("p1", 5.0, "STOP"))).await;
    assert_eq!(resp.status(), StatusCode::CREATED);
    assert_eq!(body_json(resp).await["version"], 1);

    let resp = send(
        &app,
        "PUT",
        "/api/v1/policies/p1/limits",
        Some(json!([{ "metric": "cost", "threshold": 3.0 }])),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(body_json(resp).await["version"], 2);

    let current = body_json(send(&app, "GET", "/api/v1/policies/p1", None).await).await;
    assert_eq!(current["limits"][0]["threshold"], 3.0);
    let first = body_json(send(&app, "GET", "/api/v1/policies/p1?version=1", None).await).await;
    assert_eq!(first["limits"][0]["threshold"], 5.0);

    let history = body_json(send(&app, "GET", "/api/v1/policies/p1/history", None).await).await;
    assert_eq!(history.as_array().unwrap().len(), 2);

    let listed = body_json(send(&app, "GET", "/api/v1/policies?tenant=t1", None).await).await;
    assert_eq!(listed.as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_invalid_policy_rejected() {
    let app = setup().await;
    let resp = send(&app, "POST", "/api/v1/policies", Some(cost_policy("bad", -1.0, "ALERT"))).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(resp).await["code"], "INVALID_POLICY");
}

#[tokio::test]
async fn test_unknown_policy_is_404() {
    let app = setup().await;
    let resp = send(&app, "GET", "/api/v1/policies/nope", None).await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    let json = body_json(resp).await;
    assert_eq!(json["code"], "POLICY_NOT_FOUND");
    assert!(json["message"].as_str().unwrap().contains("nope"));
}

#[tokio::test]
async fn test_retired_policy_no_longer_governs() {
    let app = setup().await;
    send(&app, "POST", "/api/v1/policies", Some(cost_policy("p1", 5.0, "STOP"))).await;
    let resp = send(&app, "DELETE", "/api/v1/policies/p1", None).await;
    assert_eq!(resp.status(), StatusCode::NO_CONTENT);

    let snap = body_json(send(&app, "POST", "/api/v1/runs", Some(json!({ "tenant": "t1" }))).await).await;
    assert_eq!(snap["policy_id"], "__default__");
}

// ── Runtime bridge ─────────────────────────────────────────────

#[tokio::test]
async fn test_run_lifecycle() {
    let (app, lever) = setup_with(None).await;
    send(&app, "POST", "/api/v1/policies", Some(cost_policy("p1", 2.0, "STOP"))).await;

    let resp = send(
        &app,
        "POST",
        "/api/v1/runs",
        Some(json!({ "tenant": "t1", "agent_id": "a1" })),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::CREATED);
    let snap = body_json(resp).await;
    assert_eq!(snap["policy_id"], "p1");
    let run_id = snap["run_id"].as_str().unwrap().to_string();

    let resp = send(
        &app,
        "POST",
        &format!("/api/v1/runs/{run_id}/metrics"),
        Some(json!({ "metric": "cost", "value": 2.5 })),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::OK);
    let report = body_json(resp).await;
    assert_eq!(report["signal"]["signal_type"], "BREACH");
    assert_eq!(report["state"], "STOPPED");

    let resp = send(&app, "POST", &format!("/api/v1/runs/{run_id}/resume"), None).await;
    assert_eq!(resp.status(), StatusCode::CONFLICT);
    assert_eq!(body_json(resp).await["code"], "INVALID_RUN_STATE");

    lever.flush().await;
    let signals = body_json(
        send(&app, "GET", &format!("/api/v1/threshold-signals?run_id={run_id}"), None).await,
    )
    .await;
    assert_eq!(signals.as_array().unwrap().len(), 1);
    let actions = body_json(
        send(&app, "GET", &format!("/api/v1/enforcement-actions?run_id={run_id}"), None).await,
    )
    .await;
    assert_eq!(actions[0]["applied"], "STOP");

    let resp = send(&app, "POST", &format!("/api/v1/runs/{run_id}/end"), None).await;
    assert_eq!(resp.status(), StatusCode::NO_CONTENT);
    lever.flush().await;
    let status = body_json(send(&app, "GET", &format!("/api/v1/runs/{run_id}"), None).await).await;
    assert_eq!(status["active"], false);
}

#[tokio::test]
async fn test_unknown_run_is_404() {
    let app = setup().await;
    let resp = send(
        &app,
        "POST",
        &format!("/api/v1/runs/{}/metrics", uuid::Uuid::new_v4()),
        Some(json!({ "metric": "cost", "value": 1.0 })),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    assert_eq!(body_json(resp).await["code"], "RUN_NOT_FOUND");
}

#[tokio::test]
async fn test_fail_closed_denial_is_403() {
    let (app, lever) = setup_with(None).await;
    send(
        &app,
        "POST",
        "/api/v1/policies",
        Some(json!({
            "id": "guard", "name": "guard",
            "scope": { "tenant": "t1", "scope_type": "ALL_RUNS" },
            "precedence": { "priority": 1, "strategy": "FAIL_CLOSED", "binding_moment": "RUN_START" }
        })),
    )
    .await;
    for (id, scope_type, ident) in [("ep-a", "AGENT", "a1"), ("ep-k", "API_KEY", "k1")] {
        let resp = send(
            &app,
            "POST",
            "/api/v1/policies",
            Some(json!({
                "id": id, "name": id,
                "scope": { "tenant": "t1", "scope_type": scope_type, "identifiers": [ident] },
                "precedence": { "priority": 5, "strategy": "EXPLICIT_PRIORITY", "binding_moment": "RUN_START" }
            })),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::CREATED);
    }

    let resp = send(
        &app,
        "POST",
        "/api/v1/runs",
        Some(json!({ "tenant": "t1", "agent_id": "a1", "api_key_id": "k1" })),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    assert_eq!(body_json(resp).await["code"], "AMBIGUOUS_POLICY");

    lever.flush().await;
    let denials = body_json(send(&app, "GET", "/api/v1/denials?tenant=t1", None).await).await;
    assert_eq!(denials.as_array().unwrap().len(), 1);
    assert_eq!(denials[0]["candidates"].as_array().unwrap().len(), 3);
}

// ── Overrides ──────────────────────────────────────────────────

#[tokio::test]
async fn test_override_flow() {
    let app = setup().await;
    let resp = send(
        &app,
        "POST",
        "/api/v1/override-authorities",
        Some(json!({
            "id": "oncall-grant",
            "scope": { "tenant": "t1", "scope_type": "AGENT", "identifiers": ["a1"] },
            "actors": ["oncall"],
            "max_duration_secs": 3600
        })),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::CREATED);

    let grants = body_json(send(&app, "GET", "/api/v1/override-authorities?tenant=t1", None).await).await;
    assert_eq!(grants.as_array().unwrap().len(), 1);

    let request = |actor: &str| {
        json!({
            "tenant": "t1",
            "actor": actor,
            "scope": "AGENT:a1",
            "duration_secs": 600,
            "justification": "incident 42"
        })
    };
    let resp = send(&app, "POST", "/api/v1/overrides", Some(request("oncall"))).await;
    assert_eq!(resp.status(), StatusCode::CREATED);
    let record = body_json(resp).await;
    assert_eq!(record["scope"], "AGENT:a1");

    let resp = send(&app, "POST", "/api/v1/overrides", Some(request("intern"))).await;
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    assert_eq!(body_json(resp).await["code"], "OVERRIDE_DENIED");

    let all = body_json(send(&app, "GET", "/api/v1/overrides?tenant=t1", None).await).await;
    assert_eq!(all.as_array().unwrap().len(), 1);
    let active = body_json(send(&app, "GET", "/api/v1/overrides?tenant=t1&active=true", None).await).await;
    assert_eq!(active.as_array().unwrap().len(), 1);

    let resp = send(&app, "GET", "/api/v1/overrides", None).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_override_duration_out_of_range() {
    let app = setup().await;
    send(
        &app,
        "POST",
        "/api/v1/override-authorities",
        Some(json!({
            "id": "open-grant",
            "scope": { "tenant": "t1", "scope_type": "ALL_RUNS" },
            "actors": ["oncall"],
            "max_duration_secs": i64::MAX
        })),
    )
    .await;
    let request = |duration_secs: i64| {
        json!({
            "tenant": "t1",
            "actor": "oncall",
            "scope": "AGENT:a1",
            "duration_secs": duration_secs,
            "justification": "freeze"
        })
    };

    let resp = send(&app, "POST", "/api/v1/overrides", Some(request(i64::MAX))).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(resp).await["code"], "BAD_REQUEST");

    let resp = send(&app, "POST", "/api/v1/overrides", Some(request(9_000_000_000_000))).await;
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    assert_eq!(body_json(resp).await["code"], "OVERRIDE_DENIED");

    let all = body_json(send(&app, "GET", "/api/v1/overrides?tenant=t1", None).await).await;
    assert!(all.as_array().unwrap().is_empty());
}

// ── Audit reads ────────────────────────────────────────────────

#[tokio::test]
async fn test_record_queries_need_a_filter() {
    let app = setup().await;
    let resp = send(&app, "GET", "/api/v1/threshold-signals", None).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(resp).await["code"], "BAD_REQUEST");
    let resp = send(&app, "GET", "/api/v1/enforcement-actions", None).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_integrity_clean_store() {
    let app = setup().await;
    let json = body_json(send(&app, "GET", "/api/v1/integrity", None).await).await;
    assert_eq!(json["ok"], true);
}

// ── Auth ───────────────────────────────────────────────────────

#[tokio::test]
async fn test_api_key_required() {
    let (app, lever) = setup_with(Some("s3cret")).await;

    let resp = send(&app, "GET", "/api/v1/policies", None).await;
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(body_json(resp).await["code"], "UNAUTHORIZED");

    let req = Request::get("/api/v1/policies")
        .header("authorization", "Bearer s3cret")
        .body(Body::empty())
        .unwrap();
    let resp = app.clone().oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let resp = send(&app, "GET", "/health", None).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(lever.metrics().get("http_errors_total"), Some(1));
}

#[tokio::test]
async fn test_malformed_body_rejected() {
    let app = setup().await;
    let resp = send(&app, "POST", "/api/v1/runs", Some(json!({ "agent_id": "a1" }))).await;
    assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);
}
