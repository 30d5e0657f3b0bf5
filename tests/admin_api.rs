use std::fs;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use beacon_activation::{
    load_seed, ActivationApiBuilder, ActivationStore, AuditRecord, Decision, ACTOR_HEADER, SESSION_HEADER,
};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;

async fn call(router: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let mut builder = Request::builder()
        .method(method)
        .uri(uri)
        .header(ACTOR_HEADER, "dana")
        .header(SESSION_HEADER, "console-1");
    let body = match body {
        Some(body) => {
            builder = builder.header("content-type", "application/json");
            Body::from(body.to_string())
        }
        None => Body::empty(),
    };
    let response = router.clone().oneshot(builder.body(body).unwrap()).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
}

async fn seeded_router() -> (Router, ActivationStore) {
    let dir = tempfile::tempdir().unwrap();
    fs::write(
        dir.path().join("global.yaml"),
        "rules:\n  - pattern: \"*\"\n    kind: LOG\n    min_log_level: WARN\n",
    )
    .unwrap();
    fs::write(
        dir.path().join("orders.json"),
        r#"[{"pattern": "ORDER_PKG.*", "kind": "TRACE", "tenant": "T1", "sampling_rate": 1.0}]"#,
    )
    .unwrap();

    let store = ActivationStore::in_memory();
    let rules = load_seed(dir.path()).unwrap();
    let outcome = store.apply_seed(&rules).await;
    assert_eq!(outcome.succeeded, 2);
    (ActivationApiBuilder::new(store.clone()).into_router(), store)
}

#[tokio::test]
async fn seeded_rules_drive_decisions() {
    let (router, _) = seeded_router().await;

    let (status, body) = call(
        &router,
        "POST",
        "/v1/decisions",
        Some(json!({"object_name": "ORDER_PKG.CREATE", "telemetry_kind": "TRACE", "tenant_id": "T1"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let decision: Decision = serde_json::from_value(body).unwrap();
    assert!(decision.emit);
    assert_eq!(decision.matched_tenant.as_deref(), Some("T1"));

    let (_, body) = call(
        &router,
        "POST",
        "/v1/decisions",
        Some(json!({
            "object_name": "BILLING.RUN",
            "telemetry_kind": "LOG",
            "tenant_id": "T9",
            "log_level": "INFO"
        })),
    )
    .await;
    let decision: Decision = serde_json::from_value(body).unwrap();
    assert!(!decision.emit);
    assert_eq!(decision.matched_tenant.as_deref(), Some("ALL"));
}

#[tokio::test]
async fn operator_changes_are_attributed_in_the_change_report() {
    let (router, _) = seeded_router().await;

    let (status, _) = call(
        &router,
        "POST",
        "/v1/activations/disable",
        Some(json!({"object_pattern": "order_pkg.*", "telemetry_kind": "trace", "tenant_id": "T1"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (_, body) = call(&router, "GET", "/v1/reports/changes?hours=1&tenant=T1", None).await;
    let changes: Vec<AuditRecord> = serde_json::from_value(body).unwrap();
    assert_eq!(changes.len(), 2);
    assert_eq!(changes[0].actor, "dana");
    assert_eq!(changes[0].session.session_id.as_deref(), Some("console-1"));
    assert_eq!(changes[0].session.client.as_deref(), Some("rest"));
    assert_eq!(changes[1].actor, "system:seed");
}

#[tokio::test]
async fn rejects_malformed_payloads() {
    let (router, store) = seeded_router().await;

    let (status, body) = call(
        &router,
        "POST",
        "/v1/activations",
        Some(json!({"object_pattern": "A.*", "telemetry_kind": "TRACE", "sampling_rate": -0.1})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "invalid_request");

    let (status, body) = call(
        &router,
        "POST",
        "/v1/activations",
        Some(json!({"object_pattern": "A.*", "telemetry_kind": "SPAN"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "invalid_request");

    let (status, body) = call(
        &router,
        "POST",
        "/v1/activations",
        Some(json!({"object_pattern": "A.*", "telemetry_kind": "TRACE", "duration_minutes": i64::MAX})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "invalid_request");
    assert_eq!(store.cache().len(), 2);
}

#[tokio::test]
async fn health_reports_cached_rules() {
    let (router, _) = seeded_router().await;
    let (status, body) = call(&router, "GET", "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["cached_rules"], 2);
}
