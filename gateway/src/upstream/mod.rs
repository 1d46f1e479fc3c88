use crate::actor::Feature;
use crate::events::{EventSink, RequestStatus, UsageEvent};
use crate::flagging::PromptSummary;
use crate::metrics::GatewayMetrics;
use crate::ratelimit::ConcurrencyGuard;
use axum::body::Body;
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::Response;
use bytes::{Bytes, BytesMut};
use chrono::Utc;
use common_http_errors::GatewayError;
use futures::StreamExt;
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use uuid::Uuid;

pub mod anthropic;
pub mod embeddings;
pub mod fireworks;
pub mod openai;

/// Provider-independent view of a parsed completion request.
#[derive(Debug)]
pub struct ParsedRequest {
    /// Canonical client-facing model name (allow-lists check this).
    pub model: String,
    /// Concrete model sent upstream after virtual-model routing.
    pub upstream_model: String,
    pub feature: Feature,
    pub stream: bool,
    pub summary: PromptSummary,
    /// Body forwarded upstream; shaped, otherwise opaque.
    pub body: serde_json::Value,
    pub endpoint: String,
}

/// One adapter per upstream provider: request shaping, endpoints, and usage
/// extraction. Dispatch and rate limiting are shared.
pub trait Provider: Send + Sync {
    fn name(&self) -> &'static str;
    fn allowed_models(&self) -> &[String];
    fn access_token(&self) -> &str;
    fn auth_style(&self) -> AuthStyle;
    fn flagging(&self) -> &crate::flagging::FlaggingConfig;
    fn parse(
        &self,
        body: &[u8],
        actor_id: &str,
        request_id: Uuid,
    ) -> Result<ParsedRequest, GatewayError>;
    fn accumulator(&self) -> Box<dyn UsageAccumulator>;
    fn unary_usage(&self, body: &[u8], summary: &PromptSummary) -> Usage;
}

/// Required string field, or a 400 naming it.
pub(crate) fn required_str(
    value: &serde_json::Value,
    field: &'static str,
    request_id: Uuid,
) -> Result<String, GatewayError> {
    value
        .get(field)
        .and_then(|v| v.as_str())
        .map(|v| v.to_string())
        .ok_or(GatewayError::InvalidRequest {
            request_id: Some(request_id),
            code: "invalid_request",
            message: Some(format!("missing required field {field}")),
        })
}

pub(crate) fn parse_body(body: &[u8], request_id: Uuid) -> Result<serde_json::Value, GatewayError> {
    serde_json::from_slice(body).map_err(|err| GatewayError::InvalidRequest {
        request_id: Some(request_id),
        code: "invalid_request",
        message: Some(format!("malformed JSON body: {err}")),
    })
}

/// Concatenate chat message text parts for flagging. Handles both plain
/// string contents and `[{type:"text",text:...}]` arrays.
pub(crate) fn concat_message_text(value: &serde_json::Value) -> String {
    let mut prompt = String::new();
    if let Some(system) = value.get("system").and_then(|v| v.as_str()) {
        prompt.push_str(system);
    }
    if let Some(messages) = value.get("messages").and_then(|v| v.as_array()) {
        for message in messages {
            let content = match message.get("content") {
                Some(content) => content,
                None => continue,
            };
            if !prompt.is_empty() {
                prompt.push('\n');
            }
            match content {
                serde_json::Value::String(text) => prompt.push_str(text),
                serde_json::Value::Array(parts) => {
                    for part in parts {
                        if let Some(text) = part.get("text").and_then(|v| v.as_str()) {
                            prompt.push_str(text);
                        }
                    }
                }
                _ => {}
            }
        }
    }
    prompt
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub cache_read_tokens: Option<u32>,
    pub cache_write_tokens: Option<u32>,
}

/// Scans provider-specific SSE payloads for token counts while the raw bytes
/// pass through untouched.
pub trait UsageAccumulator: Send {
    fn observe(&mut self, event_data: &str);

    /// Final usage; missing counts fall back to the prompt heuristic and the
    /// accumulated completion text length.
    fn finish(&mut self, summary: &PromptSummary) -> Usage;
}

/// Incremental SSE framing for the usage side-channel. The client stream is
/// forwarded verbatim; this only needs `data:` payloads at event boundaries.
pub struct SseScanner {
    buffer: String,
    data: String,
    accumulator: Box<dyn UsageAccumulator>,
}

impl SseScanner {
    pub fn new(accumulator: Box<dyn UsageAccumulator>) -> Self {
        Self { buffer: String::new(), data: String::new(), accumulator }
    }

    pub fn feed(&mut self, chunk: &[u8]) {
        self.buffer.push_str(&String::from_utf8_lossy(chunk));
        while let Some(newline) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=newline).collect();
            let line = line.trim_end_matches(['\n', '\r']);
            if line.is_empty() {
                // event boundary
                if !self.data.is_empty() {
                    let data = std::mem::take(&mut self.data);
                    self.accumulator.observe(&data);
                }
            } else if let Some(rest) = line.strip_prefix("data:") {
                if !self.data.is_empty() {
                    self.data.push('\n');
                }
                self.data.push_str(rest.strip_prefix(' ').unwrap_or(rest));
            }
        }
    }

    pub fn finish(&mut self, summary: &PromptSummary) -> Usage {
        if !self.data.is_empty() {
            let data = std::mem::take(&mut self.data);
            self.accumulator.observe(&data);
        }
        self.accumulator.finish(summary)
    }
}

/// Everything a request needs to settle exactly once: the concurrency slot
/// and the usage event. Dropping an unfinished scope (client went away, the
/// handler future was cancelled) emits a `client_gone` event with whatever
/// was streamed so far; the guard's own drop releases the slot.
pub struct RequestScope {
    pub request_id: Uuid,
    actor_id: String,
    actor_source: String,
    feature: Feature,
    model: String,
    flagged_reasons: Vec<String>,
    started: Instant,
    upstream_latency_ms: Arc<AtomicU64>,
    partial: Arc<Mutex<Usage>>,
    sink: Arc<dyn EventSink>,
    metrics: Arc<GatewayMetrics>,
    guard: Option<ConcurrencyGuard>,
    finished: AtomicBool,
}

impl RequestScope {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        request_id: Uuid,
        actor_id: String,
        actor_source: String,
        feature: Feature,
        model: String,
        flagged_reasons: Vec<String>,
        sink: Arc<dyn EventSink>,
        metrics: Arc<GatewayMetrics>,
        guard: Option<ConcurrencyGuard>,
    ) -> Self {
        Self {
            request_id,
            actor_id,
            actor_source,
            feature,
            model,
            flagged_reasons,
            started: Instant::now(),
            upstream_latency_ms: Arc::new(AtomicU64::new(0)),
            partial: Arc::new(Mutex::new(Usage::default())),
            sink,
            metrics,
            guard,
            finished: AtomicBool::new(false),
        }
    }

    pub fn mark_upstream_latency(&self) {
        self.upstream_latency_ms
            .store(self.started.elapsed().as_millis() as u64, Ordering::SeqCst);
    }

    /// Streamed-so-far snapshot, reported when the client disappears.
    pub fn record_partial(&self, usage: Usage) {
        if let Ok(mut partial) = self.partial.lock() {
            *partial = usage;
        }
    }

    pub fn push_flagged_reason(&mut self, reason: &str) {
        self.flagged_reasons.push(reason.to_string());
    }

    pub fn finish(mut self, status: RequestStatus, usage: Usage) {
        self.emit(status, usage);
    }

    pub fn elapsed_secs(&self) -> f64 {
        self.started.elapsed().as_secs_f64()
    }

    fn emit(&mut self, status: RequestStatus, usage: Usage) {
        if self.finished.swap(true, Ordering::SeqCst) {
            return;
        }
        // A flagged request that completes normally reports as flagged.
        let status = if status == RequestStatus::Ok && !self.flagged_reasons.is_empty() {
            RequestStatus::Flagged
        } else {
            status
        };
        let event = UsageEvent {
            request_id: self.request_id,
            timestamp: Utc::now(),
            actor_id: self.actor_id.clone(),
            actor_source: self.actor_source.clone(),
            feature: self.feature,
            model: self.model.clone(),
            status,
            prompt_tokens: usage.prompt_tokens,
            completion_tokens: usage.completion_tokens,
            cache_read_tokens: usage.cache_read_tokens,
            cache_write_tokens: usage.cache_write_tokens,
            upstream_latency_ms: self.upstream_latency_ms.load(Ordering::SeqCst),
            total_latency_ms: self.started.elapsed().as_millis() as u64,
            flagged_reasons: std::mem::take(&mut self.flagged_reasons),
        };
        self.metrics.record_request(self.feature.as_str(), status.as_str());
        self.sink.record(event);
        self.guard.take();
    }
}

impl Drop for RequestScope {
    fn drop(&mut self) {
        let partial = self.partial.lock().map(|usage| *usage).unwrap_or_default();
        self.emit(RequestStatus::ClientGone, partial);
    }
}

/// Deterministic routing bucket in [0, 100) from the actor/request pair; the
/// same pair always lands in the same bucket so retries route identically.
pub fn stable_percent(actor_id: &str, request_id: Uuid) -> u8 {
    let mut hasher = Sha256::new();
    hasher.update(actor_id.as_bytes());
    hasher.update(b":");
    hasher.update(request_id.as_bytes());
    let digest = hasher.finalize();
    let mut eight = [0u8; 8];
    eight.copy_from_slice(&digest[..8]);
    (u64::from_be_bytes(eight) % 100) as u8
}

pub struct Dispatcher {
    client: reqwest::Client,
    auto_flush: bool,
    stream_timeout: Duration,
    unary_timeout: Duration,
}

impl Dispatcher {
    pub fn new(
        client: reqwest::Client,
        auto_flush: bool,
        stream_timeout: Duration,
        unary_timeout: Duration,
    ) -> Self {
        Self { client, auto_flush, stream_timeout, unary_timeout }
    }

    /// Forward a unary request. 2xx bodies are returned for usage extraction
    /// and passthrough; 4xx map to verbatim passthrough errors; everything
    /// else is redacted.
    pub async fn unary(
        &self,
        url: &str,
        access_token: &str,
        auth: AuthStyle,
        body: &serde_json::Value,
        request_id: Uuid,
    ) -> Result<(StatusCode, Bytes), GatewayError> {
        let request = self.client.post(url).timeout(self.unary_timeout).json(body);
        let request = auth.apply(request, access_token);
        let response = request.send().await.map_err(|err| redact_send_error(err, request_id))?;
        let status = response.status();
        if status.is_success() {
            let bytes = response
                .bytes()
                .await
                .map_err(|err| redact_send_error(err, request_id))?;
            return Ok((status, bytes));
        }
        Err(upstream_failure(status, response, request_id).await)
    }

    /// Forward a streaming request, passing SSE bytes through in upstream
    /// order while scanning each event for token counts. The scope settles
    /// on every terminal path.
    pub async fn stream(
        &self,
        url: &str,
        access_token: &str,
        auth: AuthStyle,
        body: &serde_json::Value,
        summary: PromptSummary,
        accumulator: Box<dyn UsageAccumulator>,
        scope: RequestScope,
        provider: &'static str,
        metrics: Arc<GatewayMetrics>,
    ) -> Result<Response, (GatewayError, RequestScope)> {
        let request = self
            .client
            .post(url)
            .timeout(self.stream_timeout)
            .header(header::ACCEPT, "text/event-stream")
            .json(body);
        let request = auth.apply(request, access_token);
        let response = match request.send().await {
            Ok(response) => response,
            Err(err) => return Err((redact_send_error(err, scope.request_id), scope)),
        };
        let status = response.status();
        if !status.is_success() {
            // 4xx at headers: surface verbatim, stream never starts
            let err = upstream_failure(status, response, scope.request_id).await;
            return Err((err, scope));
        }
        scope.mark_upstream_latency();
        metrics.observe_upstream_latency(
            provider,
            scope.started.elapsed().as_secs_f64(),
        );

        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or("text/event-stream")
            .to_string();

        let auto_flush = self.auto_flush;
        let mut upstream = response.bytes_stream();
        let body_stream = async_stream::stream! {
            let mut scanner = SseScanner::new(accumulator);
            let mut scope = scope;
            let mut pending = BytesMut::new();
            while let Some(chunk) = upstream.next().await {
                match chunk {
                    Ok(bytes) => {
                        scanner.feed(&bytes);
                        scope.record_partial(scanner_snapshot(&mut scanner, &summary));
                        if auto_flush {
                            // one frame per upstream write
                            yield Ok::<Bytes, std::io::Error>(bytes);
                        } else {
                            pending.extend_from_slice(&bytes);
                            // coalesce up to the last complete event boundary
                            if let Some(boundary) = last_event_boundary(&pending) {
                                let ready = pending.split_to(boundary);
                                yield Ok::<Bytes, std::io::Error>(ready.freeze());
                            }
                        }
                    }
                    Err(err) => {
                        tracing::warn!(?err, "Upstream stream failed mid-flight");
                        let usage = scanner.finish(&summary);
                        scope.finish(RequestStatus::UpstreamError, usage);
                        yield Err(std::io::Error::other("upstream stream failed"));
                        return;
                    }
                }
            }
            if !pending.is_empty() {
                yield Ok::<Bytes, std::io::Error>(pending.freeze());
            }
            let usage = scanner.finish(&summary);
            scope.finish(RequestStatus::Ok, usage);
        };

        let mut resp = Response::new(Body::from_stream(body_stream));
        *resp.status_mut() = StatusCode::OK;
        if let Ok(value) = HeaderValue::from_str(&content_type) {
            resp.headers_mut().insert(header::CONTENT_TYPE, value);
        }
        resp.headers_mut().insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
        Ok(resp)
    }
}

/// How the provider expects its credential.
#[derive(Clone, Copy)]
pub enum AuthStyle {
    /// `Authorization: Bearer <token>` (OpenAI, Fireworks)
    Bearer,
    /// `X-API-Key: <token>` (Anthropic)
    XApiKey,
}

impl AuthStyle {
    fn apply(self, request: reqwest::RequestBuilder, token: &str) -> reqwest::RequestBuilder {
        match self {
            AuthStyle::Bearer => request.bearer_auth(token),
            AuthStyle::XApiKey => request.header("X-API-Key", token),
        }
    }
}

fn scanner_snapshot(scanner: &mut SseScanner, summary: &PromptSummary) -> Usage {
    // finish() is tolerant of being called repeatedly: accumulators compute
    // from state without consuming it.
    scanner.accumulator.finish(summary)
}

/// Index one past the last `\n\n` / `\r\n\r\n` in the buffer, if any.
fn last_event_boundary(buffer: &[u8]) -> Option<usize> {
    let mut idx = buffer.len();
    while idx >= 2 {
        if &buffer[idx - 2..idx] == b"\n\n" {
            return Some(idx);
        }
        if idx >= 4 && &buffer[idx - 4..idx] == b"\r\n\r\n" {
            return Some(idx);
        }
        idx -= 1;
    }
    None
}

async fn upstream_failure(
    status: StatusCode,
    response: reqwest::Response,
    request_id: Uuid,
) -> GatewayError {
    if status.is_client_error() {
        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(|value| value.to_string());
        let body = response.text().await.unwrap_or_default();
        return GatewayError::UpstreamBadRequest {
            status: status.as_u16(),
            content_type,
            body,
        };
    }
    GatewayError::UpstreamError {
        request_id: Some(request_id),
        message: Some(format!("upstream responded with status {}", status.as_u16())),
    }
}

/// Network and timeout failures never leak upstream hostnames or tokens.
fn redact_send_error(err: reqwest::Error, request_id: Uuid) -> GatewayError {
    let message = if err.is_timeout() {
        "upstream request timed out".to_string()
    } else if err.is_connect() {
        "failed to reach upstream".to_string()
    } else {
        "upstream request failed".to_string()
    };
    GatewayError::UpstreamError { request_id: Some(request_id), message: Some(message) }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct CountingAccumulator {
        completion_chars: usize,
    }

    impl UsageAccumulator for CountingAccumulator {
        fn observe(&mut self, event_data: &str) {
            self.completion_chars += event_data.len();
        }

        fn finish(&mut self, summary: &PromptSummary) -> Usage {
            Usage {
                prompt_tokens: summary.prompt_tokens(),
                completion_tokens: (self.completion_chars as u32).div_ceil(4),
                cache_read_tokens: None,
                cache_write_tokens: None,
            }
        }
    }

    #[test]
    fn scanner_reassembles_split_events() {
        let mut scanner =
            SseScanner::new(Box::new(CountingAccumulator { completion_chars: 0 }));
        // one event split across chunks, another complete
        scanner.feed(b"data: hel");
        scanner.feed(b"lo\n\ndata: world\n\n");
        let summary = PromptSummary {
            prompt: "hi".into(),
            max_response_tokens: 10,
            native_prompt_tokens: None,
        };
        let usage = scanner.finish(&summary);
        // "hello" + "world" = 10 chars -> 3 tokens
        assert_eq!(usage.completion_tokens, 3);
        assert_eq!(usage.prompt_tokens, 1);
    }

    #[test]
    fn scanner_joins_multi_line_data_and_skips_event_lines() {
        struct Capture(Arc<Mutex<Vec<String>>>);
        impl UsageAccumulator for Capture {
            fn observe(&mut self, event_data: &str) {
                self.0.lock().unwrap().push(event_data.to_string());
            }
            fn finish(&mut self, _summary: &PromptSummary) -> Usage {
                Usage::default()
            }
        }
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut scanner = SseScanner::new(Box::new(Capture(seen.clone())));
        scanner.feed(b"event: completion\r\ndata: {\"a\":1}\r\ndata: tail\r\n\r\n");
        let summary = PromptSummary {
            prompt: String::new(),
            max_response_tokens: 0,
            native_prompt_tokens: None,
        };
        scanner.finish(&summary);
        assert_eq!(seen.lock().unwrap().as_slice(), ["{\"a\":1}\ntail"]);
    }

    #[test]
    fn routing_hash_is_stable() {
        let id = Uuid::parse_str("8f14e45f-ceea-467f-a0f7-b84ae0b0a0a0").unwrap();
        let a = stable_percent("actor-1", id);
        let b = stable_percent("actor-1", id);
        assert_eq!(a, b);
        assert!(a < 100);
    }

    #[test]
    fn event_boundary_detection() {
        assert_eq!(last_event_boundary(b"data: x\n\n"), Some(9));
        assert_eq!(last_event_boundary(b"data: x\n\ndata: y"), Some(9));
        assert_eq!(last_event_boundary(b"data: x"), None);
    }
}
