use axum::http::StatusCode;
use axum::response::IntoResponse;
use common_http_errors::GatewayError;
use uuid::Uuid;

#[test]
fn unauthenticated_variant() {
    let err = GatewayError::Unauthenticated { request_id: None, message: None };
    let resp = err.into_response();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(resp.headers().get("X-Error-Code").unwrap(), "unauthenticated");
}

#[test]
fn access_denied_variant() {
    let err = GatewayError::AccessDenied { request_id: None, message: Some("subscription archived".into()) };
    let resp = err.into_response();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(resp.headers().get("X-Error-Code").unwrap(), "access_denied");
}

#[test]
fn model_not_allowed_variant() {
    let err = GatewayError::ModelNotAllowed { request_id: None, model: "claude-9".into() };
    let resp = err.into_response();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    assert_eq!(resp.headers().get("X-Error-Code").unwrap(), "model_not_allowed");
}

#[test]
fn flagging_blocked_carries_reason_code() {
    let err = GatewayError::FlaggingBlocked {
        request_id: None,
        code: "max_tokens_exceeded",
        message: Some("requested 20000 tokens, cap is 10000".into()),
    };
    let resp = err.into_response();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    assert_eq!(resp.headers().get("X-Error-Code").unwrap(), "max_tokens_exceeded");
}

#[tokio::test]
async fn rate_limited_sets_throttle_headers() {
    let err = GatewayError::RateLimited {
        request_id: Some(Uuid::new_v4()),
        limit: 100,
        remaining: 0,
        reset_unix: 1_700_000_060,
        retry_after_secs: 42,
    };
    let resp = err.into_response();
    assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(resp.headers().get("Retry-After").unwrap(), "42");
    assert_eq!(resp.headers().get("X-RateLimit-Limit").unwrap(), "100");
    assert_eq!(resp.headers().get("X-RateLimit-Remaining").unwrap(), "0");
    assert_eq!(resp.headers().get("X-RateLimit-Reset").unwrap(), "1700000060");
    let bytes = axum::body::to_bytes(resp.into_body(), 1024).await.unwrap();
    let body = String::from_utf8(bytes.to_vec()).unwrap();
    assert!(body.contains("\"code\":\"rate_limited\""));
    assert!(body.contains("\"request_id\""));
}

#[tokio::test]
async fn upstream_bad_request_passes_body_verbatim() {
    let upstream_body = r#"{"error":{"type":"invalid_request_error","message":"max_tokens required"}}"#;
    let err = GatewayError::UpstreamBadRequest {
        status: 422,
        content_type: Some("application/json".into()),
        body: upstream_body.to_string(),
    };
    let resp = err.into_response();
    assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);
    let bytes = axum::body::to_bytes(resp.into_body(), 1024).await.unwrap();
    assert_eq!(String::from_utf8(bytes.to_vec()).unwrap(), upstream_body);
}

#[tokio::test]
async fn transient_shape() {
    let err = GatewayError::Transient {
        request_id: None,
        retry_after_secs: Some(5),
        message: Some("actor source unavailable".into()),
    };
    let resp = err.into_response();
    assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(resp.headers().get("Retry-After").unwrap(), "5");
    let bytes = axum::body::to_bytes(resp.into_body(), 1024).await.unwrap();
    let body = String::from_utf8(bytes.to_vec()).unwrap();
    assert!(body.contains("\"code\":\"transient\""));
}
