use crate::actor::source::SourceError;
use crate::actor::{Actor, Feature, Plan, RateLimit};
use crate::app_state::AppState;
use axum::body::Body;
use axum::http::{header, HeaderValue, Request};
use axum::middleware::Next;
use axum::response::Response;
use chrono::Utc;
use common_http_errors::GatewayError;
use tracing::info;
use uuid::Uuid;

/// Correlation id assigned at the edge, attached to responses and events.
#[derive(Clone, Copy)]
pub struct RequestId(pub Uuid);

/// The resolved caller, stored in request extensions for handlers.
#[derive(Clone)]
pub struct AuthedActor(pub Actor);

pub const ACTOR_ID_HEADER: &str = "X-Sourcegraph-ActorID";
pub const REQUEST_ID_HEADER: &str = "X-Request-ID";

fn anonymous_actor() -> Actor {
    Actor {
        id: "anonymous".into(),
        name: None,
        access_token_sha256: String::new(),
        source: "anonymous".into(),
        last_updated: Utc::now(),
        plan: Plan::Internal,
        rate_limits: Feature::ALL
            .iter()
            .map(|f| (*f, RateLimit::unbounded(Vec::new())))
            .collect(),
    }
}

pub fn bearer_token(request: &Request<Body>) -> Option<&str> {
    request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|raw| raw.strip_prefix("Bearer ").map(str::trim))
        .filter(|token| !token.is_empty())
}

/// Authenticate the request and resolve its actor through the cache. The
/// actor and request id land in request extensions; the response gets the
/// correlation headers.
pub async fn auth_middleware(
    state: AppState,
    mut request: Request<Body>,
    next: Next,
) -> Result<Response, GatewayError> {
    let request_id = Uuid::new_v4();
    request.extensions_mut().insert(RequestId(request_id));

    let actor = match bearer_token(&request) {
        Some(token) => match state.actor_cache.get(token).await {
            Ok(actor) => actor,
            Err(SourceError::NotFound) => {
                info!(request_id = %request_id, "Unrecognized bearer token");
                return Err(GatewayError::Unauthenticated {
                    request_id: Some(request_id),
                    message: Some("unrecognized bearer token".into()),
                });
            }
            Err(SourceError::AccessDenied(reason)) => {
                info!(request_id = %request_id, %reason, "Token access denied");
                return Err(GatewayError::AccessDenied {
                    request_id: Some(request_id),
                    message: Some(reason),
                });
            }
            Err(SourceError::Transient(reason)) => {
                tracing::error!(request_id = %request_id, %reason, "Actor resolution unavailable");
                return Err(GatewayError::Transient {
                    request_id: Some(request_id),
                    retry_after_secs: Some(30),
                    message: Some("actor resolution temporarily unavailable".into()),
                });
            }
        },
        None if state.config.allow_anonymous => anonymous_actor(),
        None => {
            return Err(GatewayError::Unauthenticated {
                request_id: Some(request_id),
                message: Some("missing Authorization: Bearer token".into()),
            });
        }
    };

    let actor_id = actor.id.clone();
    request.extensions_mut().insert(AuthedActor(actor));

    let mut response = next.run(request).await;
    if let Ok(value) = HeaderValue::from_str(&actor_id) {
        response.headers_mut().insert(ACTOR_ID_HEADER, value);
    }
    if let Ok(value) = HeaderValue::from_str(&request_id.to_string()) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    Ok(response)
}
