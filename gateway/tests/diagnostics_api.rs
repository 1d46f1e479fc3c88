mod support;

use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use support::{chat_actor, HarnessBuilder, TEST_TOKEN};
use tower::ServiceExt;

fn get(uri: &str, bearer: Option<&str>, actor_token: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder().method("GET").uri(uri);
    if let Some(token) = bearer {
        builder = builder.header("authorization", format!("Bearer {token}"));
    }
    if let Some(token) = actor_token {
        builder = builder.header("X-Actor-Token", token);
    }
    builder.body(Body::empty()).unwrap()
}

#[tokio::test]
async fn diagnostics_disabled_without_secret() {
    let harness = HarnessBuilder::new().build();
    let response = harness
        .router
        .clone()
        .oneshot(get("/-/__diag/version", Some("whatever"), None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn diagnostics_requires_matching_secret() {
    let harness = HarnessBuilder::new().diagnostics_secret("s3cret").build();

    let denied = harness
        .router
        .clone()
        .oneshot(get("/-/__diag/version", Some("wrong"), None))
        .await
        .unwrap();
    assert_eq!(denied.status(), StatusCode::UNAUTHORIZED);

    let allowed = harness
        .router
        .clone()
        .oneshot(get("/-/__diag/version", Some("s3cret"), None))
        .await
        .unwrap();
    assert_eq!(allowed.status(), StatusCode::OK);
    let bytes = to_bytes(allowed.into_body(), 1024).await.unwrap();
    assert_eq!(String::from_utf8(bytes.to_vec()).unwrap(), env!("CARGO_PKG_VERSION"));
}

#[tokio::test]
async fn actor_lookup_resolves_through_sources() {
    let harness = HarnessBuilder::new()
        .actor(TEST_TOKEN, chat_actor("actor-1", 100, 86_400, &["claude-2"]))
        .diagnostics_secret("s3cret")
        .build();

    let response = harness
        .router
        .clone()
        .oneshot(get("/-/__diag/actor", Some("s3cret"), Some(TEST_TOKEN)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = to_bytes(response.into_body(), 4_096).await.unwrap();
    let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body["id"], "actor-1");
    assert_eq!(body["source"], "test-source");
    assert_eq!(body["disabled"], false);

    let missing = harness
        .router
        .clone()
        .oneshot(get("/-/__diag/actor", Some("s3cret"), Some("slk_nope")))
        .await
        .unwrap();
    assert_eq!(missing.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn healthz_and_metrics_are_public() {
    let harness = HarnessBuilder::new().build();
    let health = harness
        .router
        .clone()
        .oneshot(get("/healthz", None, None))
        .await
        .unwrap();
    assert_eq!(health.status(), StatusCode::OK);

    let metrics = harness
        .router
        .clone()
        .oneshot(get("/metrics", None, None))
        .await
        .unwrap();
    assert_eq!(metrics.status(), StatusCode::OK);
    let bytes = to_bytes(metrics.into_body(), 1024 * 1024).await.unwrap();
    let text = String::from_utf8(bytes.to_vec()).unwrap();
    // plain gauges render even before any request is served
    assert!(text.contains("gateway_event_queue_depth"));
    assert!(text.contains("gateway_events_dropped_total"));
}
