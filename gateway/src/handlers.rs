use crate::actor::{Actor, Feature};
use crate::app_state::AppState;
use crate::auth::{AuthedActor, RequestId};
use crate::events::{RequestStatus, UsageEvent};
use crate::flagging::{self, PromptSummary};
use crate::ratelimit::{LimitError, WindowReservation};
use crate::upstream::{ParsedRequest, Provider, RequestScope, Usage};
use axum::body::{Body, Bytes};
use axum::extract::{Extension, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use common_http_errors::{GatewayError, GatewayResult};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

pub const EMBED_BATCH_SIZE_HEADER: &str = "X-Cody-Embed-Batch-Size";

fn provider_not_configured(request_id: Uuid) -> GatewayError {
    GatewayError::InvalidRequest {
        request_id: Some(request_id),
        code: "provider_not_configured",
        message: Some("this provider is not configured on the gateway".into()),
    }
}

pub async fn anthropic_completions(
    State(state): State<AppState>,
    Extension(AuthedActor(actor)): Extension<AuthedActor>,
    Extension(RequestId(request_id)): Extension<RequestId>,
    body: Bytes,
) -> GatewayResult<Response> {
    let provider = state.anthropic.clone().ok_or_else(|| provider_not_configured(request_id))?;
    handle_completions(state, provider, actor, request_id, body).await
}

pub async fn openai_completions(
    State(state): State<AppState>,
    Extension(AuthedActor(actor)): Extension<AuthedActor>,
    Extension(RequestId(request_id)): Extension<RequestId>,
    body: Bytes,
) -> GatewayResult<Response> {
    let provider = state.openai.clone().ok_or_else(|| provider_not_configured(request_id))?;
    handle_completions(state, provider, actor, request_id, body).await
}

pub async fn fireworks_completions(
    State(state): State<AppState>,
    Extension(AuthedActor(actor)): Extension<AuthedActor>,
    Extension(RequestId(request_id)): Extension<RequestId>,
    body: Bytes,
) -> GatewayResult<Response> {
    let provider = state.fireworks.clone().ok_or_else(|| provider_not_configured(request_id))?;
    handle_completions(state, provider, actor, request_id, body).await
}

/// The composed pipeline: parse -> model allow-list -> flagging -> window
/// reservation -> concurrency slot -> dispatch -> usage event.
async fn handle_completions(
    state: AppState,
    provider: Arc<dyn Provider>,
    actor: Actor,
    request_id: Uuid,
    body: Bytes,
) -> GatewayResult<Response> {
    let parsed = provider.parse(&body, &actor.id, request_id)?;
    check_model_allowed(provider.allowed_models(), &actor, &parsed, request_id)?;

    let verdict = flagging::evaluate(provider.flagging(), &parsed.summary);
    if verdict.blocked() {
        let reason = verdict.primary_reason();
        // Pattern hits leave evidence behind for operator review.
        if reason == flagging::REASON_BLOCKED_PATTERN {
            state
                .flagged_prompts
                .record(
                    &request_id.to_string(),
                    &actor.id,
                    parsed.feature,
                    reason,
                    &parsed.summary.prompt,
                )
                .await;
        }
        emit_terminal_event(
            &state,
            &actor,
            &parsed,
            request_id,
            RequestStatus::Blocked,
            &verdict.reasons,
        );
        return Err(GatewayError::FlaggingBlocked {
            request_id: Some(request_id),
            code: reason,
            message: None,
        });
    }
    let flagged_reasons: Vec<String> =
        verdict.reasons.iter().map(|reason| reason.to_string()).collect();

    let rl_start = Instant::now();
    let reservation = match state.rate_limiter.reserve(&actor, parsed.feature).await {
        Ok(reservation) => reservation,
        Err(err) => {
            state.metrics.record_rate_check(parsed.feature.as_str(), false, "window");
            return Err(settle_limit_error(&state, &actor, &parsed, request_id, err));
        }
    };
    state.metrics.observe_rate_limiter_latency(rl_start.elapsed().as_secs_f64());
    state.metrics.record_rate_check(parsed.feature.as_str(), true, "window");

    let guard = match state.rate_limiter.acquire_concurrent(&actor, parsed.feature).await {
        Ok(guard) => guard,
        Err(err) => {
            state.metrics.record_rate_check(parsed.feature.as_str(), false, "concurrent");
            return Err(settle_limit_error(&state, &actor, &parsed, request_id, err));
        }
    };

    let scope = RequestScope::new(
        request_id,
        actor.id.clone(),
        actor.source.clone(),
        parsed.feature,
        parsed.model.clone(),
        flagged_reasons,
        state.events.clone(),
        state.metrics.clone(),
        guard,
    );

    if parsed.stream {
        let response = state
            .dispatcher
            .stream(
                &parsed.endpoint,
                provider.access_token(),
                provider.auth_style(),
                &parsed.body,
                parsed.summary.clone(),
                provider.accumulator(),
                scope,
                provider.name(),
                state.metrics.clone(),
            )
            .await;
        match response {
            Ok(mut response) => {
                apply_rate_headers(&mut response, &reservation);
                Ok(response)
            }
            Err((err, scope)) => {
                scope.finish(RequestStatus::UpstreamError, prompt_only_usage(&parsed.summary));
                Err(err)
            }
        }
    } else {
        let outcome = state
            .dispatcher
            .unary(
                &parsed.endpoint,
                provider.access_token(),
                provider.auth_style(),
                &parsed.body,
                request_id,
            )
            .await;
        match outcome {
            Ok((status, bytes)) => {
                scope.mark_upstream_latency();
                state
                    .metrics
                    .observe_upstream_latency(provider.name(), scope.elapsed_secs());
                let mut scope = scope;
                let usage = provider.unary_usage(&bytes, &parsed.summary);
                if let Some(reason) =
                    flagging::response_token_flag(provider.flagging(), usage.completion_tokens)
                {
                    scope.push_flagged_reason(reason);
                }
                scope.finish(RequestStatus::Ok, usage);

                let mut response = Response::new(Body::from(bytes));
                *response.status_mut() = StatusCode::from_u16(status.as_u16())
                    .unwrap_or(StatusCode::OK);
                response.headers_mut().insert(
                    header::CONTENT_TYPE,
                    HeaderValue::from_static("application/json"),
                );
                apply_rate_headers(&mut response, &reservation);
                Ok(response)
            }
            Err(err) => {
                scope.finish(RequestStatus::UpstreamError, prompt_only_usage(&parsed.summary));
                Err(err)
            }
        }
    }
}

fn prompt_only_usage(summary: &PromptSummary) -> Usage {
    Usage { prompt_tokens: summary.prompt_tokens(), ..Usage::default() }
}

fn check_model_allowed(
    gateway_allowed: &[String],
    actor: &Actor,
    parsed: &ParsedRequest,
    request_id: Uuid,
) -> GatewayResult<()> {
    // An empty gateway list is unrestricted; a configured list is exact.
    let gateway_ok =
        gateway_allowed.is_empty() || gateway_allowed.iter().any(|model| model == &parsed.model);
    if !gateway_ok || !actor.model_allowed(parsed.feature, &parsed.model) {
        return Err(GatewayError::ModelNotAllowed {
            request_id: Some(request_id),
            model: parsed.model.clone(),
        });
    }
    Ok(())
}

/// Rejections still produce their usage event before the error response.
fn settle_limit_error(
    state: &AppState,
    actor: &Actor,
    parsed: &ParsedRequest,
    request_id: Uuid,
    err: LimitError,
) -> GatewayError {
    match err {
        LimitError::Disabled => {
            emit_terminal_event(state, actor, parsed, request_id, RequestStatus::RateLimited, &[]);
            GatewayError::AccessDenied {
                request_id: Some(request_id),
                message: Some(format!("{} is disabled for this actor", parsed.feature)),
            }
        }
        LimitError::RateLimited { limit, retry_after_secs, reset_unix } => {
            emit_terminal_event(state, actor, parsed, request_id, RequestStatus::RateLimited, &[]);
            GatewayError::RateLimited {
                request_id: Some(request_id),
                limit,
                remaining: 0,
                reset_unix,
                retry_after_secs,
            }
        }
        LimitError::Concurrent { retry_after_secs } => {
            emit_terminal_event(state, actor, parsed, request_id, RequestStatus::RateLimited, &[]);
            GatewayError::ConcurrentLimit { request_id: Some(request_id), retry_after_secs }
        }
        LimitError::Kv(err) => {
            tracing::error!(?err, request_id = %request_id, "Rate limiter KV failure");
            GatewayError::internal("rate limiter unavailable", Some(request_id))
        }
    }
}

fn emit_terminal_event(
    state: &AppState,
    actor: &Actor,
    parsed: &ParsedRequest,
    request_id: Uuid,
    status: RequestStatus,
    reasons: &[&'static str],
) {
    state.metrics.record_request(parsed.feature.as_str(), status.as_str());
    state.events.record(UsageEvent {
        request_id,
        timestamp: Utc::now(),
        actor_id: actor.id.clone(),
        actor_source: actor.source.clone(),
        feature: parsed.feature,
        model: parsed.model.clone(),
        status,
        prompt_tokens: parsed.summary.prompt_tokens(),
        completion_tokens: 0,
        cache_read_tokens: None,
        cache_write_tokens: None,
        upstream_latency_ms: 0,
        total_latency_ms: 0,
        flagged_reasons: reasons.iter().map(|reason| reason.to_string()).collect(),
    });
}

fn apply_rate_headers(response: &mut Response, reservation: &WindowReservation) {
    if reservation.bypass {
        return;
    }
    let headers = response.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&reservation.limit.to_string()) {
        headers.insert("X-RateLimit-Limit", value);
    }
    if let Ok(value) = HeaderValue::from_str(&reservation.remaining.to_string()) {
        headers.insert("X-RateLimit-Remaining", value);
    }
    if let Ok(value) = HeaderValue::from_str(&reservation.reset_unix.to_string()) {
        headers.insert("X-RateLimit-Reset", value);
    }
}

// ---------------- Embeddings ----------------

pub async fn embeddings(
    State(state): State<AppState>,
    Extension(AuthedActor(actor)): Extension<AuthedActor>,
    Extension(RequestId(request_id)): Extension<RequestId>,
    body: Bytes,
) -> GatewayResult<Response> {
    let adapter = state.embeddings.clone().ok_or_else(|| provider_not_configured(request_id))?;
    let (request, summary) = adapter.parse(&body, request_id)?;

    let gateway_ok = adapter.allowed_models().is_empty()
        || adapter.allowed_models().iter().any(|model| model == &request.model);
    if !gateway_ok || !actor.model_allowed(Feature::Embeddings, &request.model) {
        return Err(GatewayError::ModelNotAllowed {
            request_id: Some(request_id),
            model: request.model.clone(),
        });
    }

    let embeddings_parsed = ParsedRequest {
        model: request.model.clone(),
        upstream_model: request.model.clone(),
        feature: Feature::Embeddings,
        stream: false,
        summary: summary.clone(),
        body: serde_json::Value::Null,
        endpoint: String::new(),
    };

    let reservation = match state.rate_limiter.reserve(&actor, Feature::Embeddings).await {
        Ok(reservation) => reservation,
        Err(err) => {
            state.metrics.record_rate_check(Feature::Embeddings.as_str(), false, "window");
            return Err(settle_limit_error(&state, &actor, &embeddings_parsed, request_id, err));
        }
    };
    state.metrics.record_rate_check(Feature::Embeddings.as_str(), true, "window");
    let guard = match state.rate_limiter.acquire_concurrent(&actor, Feature::Embeddings).await {
        Ok(guard) => guard,
        Err(err) => {
            state.metrics.record_rate_check(Feature::Embeddings.as_str(), false, "concurrent");
            return Err(settle_limit_error(&state, &actor, &embeddings_parsed, request_id, err));
        }
    };

    let scope = RequestScope::new(
        request_id,
        actor.id.clone(),
        actor.source.clone(),
        Feature::Embeddings,
        request.model.clone(),
        Vec::new(),
        state.events.clone(),
        state.metrics.clone(),
        guard,
    );

    match adapter.dispatch(&state.dispatcher, &request, &summary, request_id).await {
        Ok((response_body, usage)) => {
            scope.mark_upstream_latency();
            state
                .metrics
                .observe_upstream_latency("openai-embeddings", scope.elapsed_secs());
            scope.finish(RequestStatus::Ok, usage);
            let mut response = Json(response_body).into_response();
            apply_rate_headers(&mut response, &reservation);
            if let Ok(value) = HeaderValue::from_str(&adapter.max_batch_size().to_string()) {
                response.headers_mut().insert(EMBED_BATCH_SIZE_HEADER, value);
            }
            Ok(response)
        }
        Err(err) => {
            scope.finish(RequestStatus::UpstreamError, prompt_only_usage(&summary));
            Err(err)
        }
    }
}

// ---------------- Attribution ----------------

#[derive(Debug, Deserialize)]
pub struct AttributionRequest {
    pub snippet: String,
    #[serde(default = "default_attribution_limit")]
    pub limit: usize,
}

fn default_attribution_limit() -> usize {
    5
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AttributionRepository {
    pub name: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AttributionResponse {
    pub repositories: Vec<AttributionRepository>,
    #[serde(rename = "limitHit", default)]
    pub limit_hit: bool,
}

/// Snippet attribution search, forwarded to the dotcom API under the
/// attribution rate-limit bucket.
pub async fn attribution_snippet(
    State(state): State<AppState>,
    Extension(AuthedActor(actor)): Extension<AuthedActor>,
    Extension(RequestId(request_id)): Extension<RequestId>,
    Json(request): Json<AttributionRequest>,
) -> GatewayResult<Response> {
    if request.snippet.trim().is_empty() {
        return Err(GatewayError::InvalidRequest {
            request_id: Some(request_id),
            code: "invalid_request",
            message: Some("snippet must not be empty".into()),
        });
    }

    let summary = PromptSummary {
        prompt: request.snippet.clone(),
        max_response_tokens: 0,
        native_prompt_tokens: None,
    };
    let attribution_parsed = ParsedRequest {
        model: "attribution-search".into(),
        upstream_model: "attribution-search".into(),
        feature: Feature::Attribution,
        stream: false,
        summary: summary.clone(),
        body: serde_json::Value::Null,
        endpoint: String::new(),
    };

    let reservation = match state.rate_limiter.reserve(&actor, Feature::Attribution).await {
        Ok(reservation) => reservation,
        Err(err) => {
            state.metrics.record_rate_check(Feature::Attribution.as_str(), false, "window");
            return Err(settle_limit_error(&state, &actor, &attribution_parsed, request_id, err));
        }
    };
    state.metrics.record_rate_check(Feature::Attribution.as_str(), true, "window");

    let scope = RequestScope::new(
        request_id,
        actor.id.clone(),
        actor.source.clone(),
        Feature::Attribution,
        "attribution-search".into(),
        Vec::new(),
        state.events.clone(),
        state.metrics.clone(),
        None,
    );

    let url = format!(
        "{}/.api/gateway/attribution",
        state.config.dotcom.url.trim_end_matches('/')
    );
    let outcome = state
        .http_client
        .post(&url)
        .bearer_auth(&state.config.dotcom.access_token)
        .json(&serde_json::json!({ "snippet": request.snippet, "limit": request.limit }))
        .send()
        .await;
    let upstream = match outcome {
        Ok(response) if response.status().is_success() => response,
        Ok(response) => {
            scope.finish(RequestStatus::UpstreamError, prompt_only_usage(&summary));
            return Err(GatewayError::UpstreamError {
                request_id: Some(request_id),
                message: Some(format!(
                    "attribution search returned status {}",
                    response.status().as_u16()
                )),
            });
        }
        Err(err) => {
            scope.finish(RequestStatus::UpstreamError, prompt_only_usage(&summary));
            tracing::warn!(?err, request_id = %request_id, "Attribution search failed");
            return Err(GatewayError::upstream("attribution search failed", Some(request_id)));
        }
    };
    let attribution = match upstream.json::<AttributionResponse>().await {
        Ok(attribution) => attribution,
        Err(err) => {
            scope.finish(RequestStatus::UpstreamError, prompt_only_usage(&summary));
            return Err(GatewayError::UpstreamError {
                request_id: Some(request_id),
                message: Some(format!("decoding attribution response: {err}")),
            });
        }
    };

    scope.finish(RequestStatus::Ok, prompt_only_usage(&summary));
    let mut response = Json(attribution).into_response();
    apply_rate_headers(&mut response, &reservation);
    Ok(response)
}
