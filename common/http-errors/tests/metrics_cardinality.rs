use axum::http::StatusCode;
use axum::middleware;
use axum::{routing::get, Router};
use common_http_errors::{http_error_metrics_layer, GatewayError};
use once_cell::sync::Lazy;
use std::sync::atomic::{AtomicUsize, Ordering};
use tower::ServiceExt; // for oneshot

static DYNAMIC_COUNTER: Lazy<AtomicUsize> = Lazy::new(|| AtomicUsize::new(0));

// Handler that emits a different error code each time until we exceed the guard threshold.
async fn dyn_error() -> Result<&'static str, GatewayError> {
    let n = DYNAMIC_COUNTER.fetch_add(1, Ordering::Relaxed);
    let code = format!("dyn_code_{}", n);
    Err(GatewayError::FlaggingBlocked {
        request_id: None,
        code: Box::leak(code.into_boxed_str()),
        message: None,
    })
}

#[tokio::test]
async fn error_code_cardinality_guard_caps_labels() {
    let app = Router::new()
        .route("/err", get(dyn_error))
        .layer(middleware::from_fn(http_error_metrics_layer("test-svc")));

    // Fire more requests than the guard threshold (40) to force the overflow label.
    let total = 50;
    for _ in 0..total {
        let resp = app
            .clone()
            .oneshot(
                axum::http::Request::builder()
                    .uri("/err")
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }
    // Registry introspection is covered by the test-helpers feature; here we
    // only assert the layer keeps serving once the cap is exceeded.
}
