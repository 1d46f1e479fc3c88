use crate::app_state::AppState;
use crate::auth::bearer_token;
use axum::body::Body;
use axum::extract::State;
use axum::http::{Request, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

/// Diagnostics are gated by the configured secret; without one the surface
/// does not exist.
pub async fn diag_auth(
    state: AppState,
    request: Request<Body>,
    next: Next,
) -> Result<Response, StatusCode> {
    let Some(secret) = state.config.diagnostics_secret.as_deref() else {
        return Err(StatusCode::NOT_FOUND);
    };
    match bearer_token(&request) {
        Some(token) if token == secret => Ok(next.run(request).await),
        _ => Err(StatusCode::UNAUTHORIZED),
    }
}

pub async fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

#[derive(Serialize)]
struct DiagActor {
    id: String,
    name: Option<String>,
    source: String,
    plan: crate::actor::Plan,
    disabled: bool,
}

/// Resolve a token straight through the source registry, skipping the cache,
/// so operators can inspect what the sources currently say.
pub async fn actor_lookup(State(state): State<AppState>, request: Request<Body>) -> Response {
    let Some(token) = request
        .headers()
        .get("X-Actor-Token")
        .and_then(|value| value.to_str().ok())
    else {
        return (StatusCode::BAD_REQUEST, "missing X-Actor-Token header").into_response();
    };
    match state.sources.resolve(token).await {
        Ok(actor) => Json(DiagActor {
            id: actor.id.clone(),
            name: actor.name.clone(),
            source: actor.source.clone(),
            plan: actor.plan,
            disabled: actor.disabled(),
        })
        .into_response(),
        Err(err) => (StatusCode::NOT_FOUND, err.to_string()).into_response(),
    }
}

#[derive(Serialize)]
pub struct FlaggedPromptEntry {
    request_id: String,
    actor_id: String,
    feature: crate::actor::Feature,
    reason: String,
    prompt_prefix: String,
}

pub async fn flagged_prompts(State(state): State<AppState>) -> Json<Vec<FlaggedPromptEntry>> {
    let entries = state
        .flagged_prompts
        .recent()
        .await
        .into_iter()
        .map(|(request_id, record)| FlaggedPromptEntry {
            request_id,
            actor_id: record.actor_id,
            feature: record.feature,
            reason: record.reason,
            prompt_prefix: record.prompt_prefix,
        })
        .collect();
    Json(entries)
}
