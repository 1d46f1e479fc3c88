use axum::body::Body;
use axum::extract::State;
use axum::http::{header, HeaderName, Method, StatusCode};
use axum::middleware;
use axum::response::Response;
use axum::routing::{get, post};
use axum::Router;
use common_http_errors::http_error_metrics_layer;
use tower_http::cors::{Any, CorsLayer};
use tracing::warn;

pub mod actor;
pub mod app_state;
pub mod auth;
pub mod config;
pub mod diagnostics;
pub mod events;
pub mod flagging;
pub mod handlers;
pub mod kv;
pub mod metrics;
pub mod notify;
pub mod ratelimit;
pub mod upstream;

// Re-export key types for tests
pub use app_state::AppState;
pub use config::GatewayConfig;
pub use events::{BufferedEventSink, EventSink, UsageEvent};
pub use metrics::GatewayMetrics;
pub use ratelimit::RateLimiter;

async fn health() -> &'static str {
    "ok"
}

async fn metrics_endpoint(State(state): State<AppState>) -> Response {
    match state.metrics.render() {
        Ok(resp) => resp,
        Err(err) => {
            warn!(?err, "Failed to render metrics");
            Response::builder()
                .status(StatusCode::INTERNAL_SERVER_ERROR)
                .body(Body::from("metrics unavailable"))
                .expect("failed to build metrics error response")
        }
    }
}

/// The full gateway router; shared by the binary and the integration tests.
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([
            header::ACCEPT,
            header::CONTENT_TYPE,
            header::AUTHORIZATION,
            HeaderName::from_static("x-cody-embed-batch-size"),
        ]);

    let auth_state = state.clone();
    let api = Router::new()
        .route("/v1/completions/anthropic", post(handlers::anthropic_completions))
        .route("/v1/completions/openai", post(handlers::openai_completions))
        .route("/v1/completions/fireworks", post(handlers::fireworks_completions))
        .route("/v1/embeddings", post(handlers::embeddings))
        .route("/v1/attribution/snippet", post(handlers::attribution_snippet))
        .layer(middleware::from_fn(move |request, next| {
            let state = auth_state.clone();
            async move { auth::auth_middleware(state, request, next).await }
        }))
        .with_state(state.clone());

    let diag_state = state.clone();
    let diag = Router::new()
        .route("/-/__diag/version", get(diagnostics::version))
        .route("/-/__diag/actor", get(diagnostics::actor_lookup))
        .route("/-/__diag/flagged-prompts", get(diagnostics::flagged_prompts))
        .layer(middleware::from_fn(move |request, next| {
            let state = diag_state.clone();
            async move { diagnostics::diag_auth(state, request, next).await }
        }))
        .with_state(state.clone());

    Router::new()
        .route("/healthz", get(health))
        .route("/metrics", get(metrics_endpoint))
        .merge(api)
        .merge(diag)
        .with_state(state)
        .layer(middleware::from_fn(http_error_metrics_layer("cody-gateway")))
        .layer(cors)
}
