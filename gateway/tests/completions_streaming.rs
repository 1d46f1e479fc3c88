mod support;

use axum::body::to_bytes;
use axum::http::StatusCode;
use cody_gateway::events::RequestStatus;
use cody_gateway::flagging::FlaggingConfig;
use cody_gateway::kv::KeyValue;
use eventsource_stream::Eventsource;
use futures::StreamExt;
use httpmock::prelude::*;
use support::{chat_actor, post_json, provider_config, HarnessBuilder, TEST_TOKEN};
use tower::ServiceExt;

const SSE_BODY: &str = "event: completion\ndata: {\"completion\":\" Hello\"}\n\nevent: completion\ndata: {\"completion\":\" world!\"}\n\nevent: done\ndata: {}\n\n";

#[tokio::test]
async fn streaming_completion_forwards_sse_and_accounts_usage() {
    let upstream = MockServer::start();
    let complete = upstream.mock(|when, then| {
        when.method(POST).path("/v1/complete").header("X-API-Key", "upstream-test-token");
        then.status(200)
            .header("content-type", "text/event-stream")
            .body(SSE_BODY);
    });

    let harness = HarnessBuilder::new()
        .actor(TEST_TOKEN, chat_actor("actor-1", 100, 86_400, &["claude-2"]))
        .anthropic(provider_config(&upstream.base_url(), &["claude-2"], FlaggingConfig::default()))
        .build();

    let request = post_json(
        "/v1/completions/anthropic",
        Some(TEST_TOKEN),
        &serde_json::json!({
            "model": "claude-2",
            "prompt": "hello",
            "max_tokens_to_sample": 100,
            "stream": true,
        }),
    );
    let response = harness.router.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers().get("X-Sourcegraph-ActorID").unwrap(), "actor-1");
    assert_eq!(response.headers().get("X-RateLimit-Limit").unwrap(), "100");
    assert_eq!(response.headers().get("X-RateLimit-Remaining").unwrap(), "99");
    assert_eq!(
        response.headers().get("content-type").unwrap(),
        "text/event-stream"
    );

    // body is forwarded byte-for-byte
    let bytes = to_bytes(response.into_body(), 64 * 1024).await.unwrap();
    assert_eq!(String::from_utf8(bytes.to_vec()).unwrap(), SSE_BODY);
    complete.assert();

    // a client-side SSE parser sees the same events the upstream emitted
    let events: Vec<_> = futures::stream::iter([Ok::<_, std::io::Error>(bytes)])
        .eventsource()
        .collect::<Vec<_>>()
        .await;
    let parsed: Vec<_> = events.into_iter().map(|event| event.unwrap()).collect();
    assert_eq!(parsed.len(), 3);
    assert_eq!(parsed[0].event, "completion");
    assert_eq!(parsed[0].data, "{\"completion\":\" Hello\"}");

    // window consumed exactly once
    assert_eq!(harness.kv.llen("ratelimit:actor-1:chat_completions").await.unwrap(), 1);

    // exactly one ok event with accounted tokens
    let events = harness.sink.snapshot();
    assert_eq!(events.len(), 1);
    let event = &events[0];
    assert_eq!(event.status, RequestStatus::Ok);
    assert_eq!(event.actor_id, "actor-1");
    assert_eq!(event.model, "claude-2");
    // "hello" -> 2 tokens by the chars/4 heuristic
    assert_eq!(event.prompt_tokens, 2);
    assert!(event.completion_tokens > 0);
}

#[tokio::test]
async fn upstream_4xx_at_headers_is_forwarded_verbatim() {
    let upstream = MockServer::start();
    let error_body = r#"{"error":{"type":"invalid_request_error","message":"prompt is required"}}"#;
    upstream.mock(|when, then| {
        when.method(POST).path("/v1/complete");
        then.status(400).header("content-type", "application/json").body(error_body);
    });

    let harness = HarnessBuilder::new()
        .actor(TEST_TOKEN, chat_actor("actor-1", 100, 86_400, &["claude-2"]))
        .anthropic(provider_config(&upstream.base_url(), &["claude-2"], FlaggingConfig::default()))
        .build();

    let request = post_json(
        "/v1/completions/anthropic",
        Some(TEST_TOKEN),
        &serde_json::json!({
            "model": "claude-2",
            "prompt": "hello",
            "stream": true,
        }),
    );
    let response = harness.router.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let bytes = to_bytes(response.into_body(), 64 * 1024).await.unwrap();
    assert_eq!(String::from_utf8(bytes.to_vec()).unwrap(), error_body);

    let events = harness.sink.snapshot();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].status, RequestStatus::UpstreamError);
}

#[tokio::test]
async fn model_not_in_actor_allowlist_is_rejected_before_upstream() {
    let upstream = MockServer::start();
    let complete = upstream.mock(|when, then| {
        when.method(POST).path("/v1/complete");
        then.status(200).body("{}");
    });

    let harness = HarnessBuilder::new()
        .actor(TEST_TOKEN, chat_actor("actor-1", 100, 86_400, &["claude-2"]))
        .anthropic(provider_config(
            &upstream.base_url(),
            &["claude-2", "claude-3"],
            FlaggingConfig::default(),
        ))
        .build();

    let request = post_json(
        "/v1/completions/anthropic",
        Some(TEST_TOKEN),
        &serde_json::json!({"model": "claude-3", "prompt": "hi"}),
    );
    let response = harness.router.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(response.headers().get("X-Error-Code").unwrap(), "model_not_allowed");
    assert_eq!(complete.hits(), 0);
}

#[tokio::test]
async fn missing_bearer_token_is_unauthorized() {
    let harness = HarnessBuilder::new().build();
    let request = post_json(
        "/v1/completions/anthropic",
        None,
        &serde_json::json!({"model": "claude-2", "prompt": "hi"}),
    );
    let response = harness.router.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(response.headers().get("X-Error-Code").unwrap(), "unauthenticated");
}
