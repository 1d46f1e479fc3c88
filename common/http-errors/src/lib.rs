use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;

use axum::body::Body;
use axum::http::{header, HeaderValue, Request, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use once_cell::sync::Lazy;
use prometheus::{IntCounter, IntCounterVec, IntGauge, Opts, Registry};
use serde::Serialize;
use uuid::Uuid;

/// Uniform JSON error envelope: `{"error":{"code","message","request_id"}}`.
/// Upstream 4xx passthrough bypasses this shape to preserve SDK compatibility.
#[derive(Serialize, Debug)]
pub struct ErrorBody {
    pub error: ErrorDetail,
}

#[derive(Serialize, Debug)]
pub struct ErrorDetail {
    pub code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<Uuid>,
}

#[derive(Debug)]
pub enum GatewayError {
    Unauthenticated { request_id: Option<Uuid>, message: Option<String> },
    AccessDenied { request_id: Option<Uuid>, message: Option<String> },
    /// Request body failed gateway-side validation before any upstream call.
    InvalidRequest { request_id: Option<Uuid>, code: &'static str, message: Option<String> },
    ModelNotAllowed { request_id: Option<Uuid>, model: String },
    /// Flagging pipeline produced a Block verdict; `code` is the reason slug.
    FlaggingBlocked { request_id: Option<Uuid>, code: &'static str, message: Option<String> },
    RateLimited {
        request_id: Option<Uuid>,
        limit: u64,
        remaining: u64,
        reset_unix: i64,
        retry_after_secs: u64,
    },
    ConcurrentLimit { request_id: Option<Uuid>, retry_after_secs: u64 },
    /// Upstream 4xx forwarded verbatim (status + body + content type).
    UpstreamBadRequest { status: u16, content_type: Option<String>, body: String },
    UpstreamError { request_id: Option<Uuid>, message: Option<String> },
    Transient { request_id: Option<Uuid>, retry_after_secs: Option<u64>, message: Option<String> },
    Internal { request_id: Option<Uuid>, message: Option<String> },
}

impl GatewayError {
    pub fn internal<E: std::fmt::Display>(e: E, request_id: Option<Uuid>) -> Self {
        Self::Internal { request_id, message: Some(e.to_string()) }
    }

    pub fn upstream<E: std::fmt::Display>(e: E, request_id: Option<Uuid>) -> Self {
        Self::UpstreamError { request_id, message: Some(e.to_string()) }
    }

    pub fn unauthenticated(request_id: Option<Uuid>) -> Self {
        Self::Unauthenticated { request_id, message: None }
    }

    /// Stable machine code for the variant; flagging carries its reason slug.
    pub fn code(&self) -> &str {
        match self {
            GatewayError::Unauthenticated { .. } => "unauthenticated",
            GatewayError::AccessDenied { .. } => "access_denied",
            GatewayError::InvalidRequest { code, .. } => code,
            GatewayError::ModelNotAllowed { .. } => "model_not_allowed",
            GatewayError::FlaggingBlocked { code, .. } => code,
            GatewayError::RateLimited { .. } => "rate_limited",
            GatewayError::ConcurrentLimit { .. } => "concurrent_limit",
            GatewayError::UpstreamBadRequest { .. } => "upstream_bad_request",
            GatewayError::UpstreamError { .. } => "upstream_error",
            GatewayError::Transient { .. } => "transient",
            GatewayError::Internal { .. } => "internal_error",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::Unauthenticated { .. } | GatewayError::AccessDenied { .. } => {
                StatusCode::UNAUTHORIZED
            }
            GatewayError::ModelNotAllowed { .. }
            | GatewayError::FlaggingBlocked { .. }
            | GatewayError::InvalidRequest { .. } => StatusCode::BAD_REQUEST,
            GatewayError::RateLimited { .. } | GatewayError::ConcurrentLimit { .. } => {
                StatusCode::TOO_MANY_REQUESTS
            }
            GatewayError::UpstreamBadRequest { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_REQUEST)
            }
            GatewayError::UpstreamError { .. } => StatusCode::BAD_GATEWAY,
            GatewayError::Transient { .. } => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl std::fmt::Display for GatewayError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.code(), self.status())
    }
}

fn header_secs(resp: &mut Response, name: &'static str, secs: u64) {
    if let Ok(val) = HeaderValue::from_str(&secs.to_string()) {
        resp.headers_mut().insert(name, val);
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        // Upstream 4xx: forward status and body verbatim, no envelope.
        if let GatewayError::UpstreamBadRequest { status, content_type, body } = self {
            let status = StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_REQUEST);
            let ct = content_type.unwrap_or_else(|| "application/json".to_string());
            let mut resp = Response::new(Body::from(body));
            *resp.status_mut() = status;
            if let Ok(val) = HeaderValue::from_str(&ct) {
                resp.headers_mut().insert(header::CONTENT_TYPE, val);
            }
            resp.headers_mut().insert("X-Error-Code", HeaderValue::from_static("upstream_bad_request"));
            return resp;
        }

        let status = self.status();
        let code = self.code().to_string();
        let (message, request_id) = match &self {
            GatewayError::Unauthenticated { request_id, message }
            | GatewayError::AccessDenied { request_id, message }
            | GatewayError::UpstreamError { request_id, message }
            | GatewayError::Internal { request_id, message } => (message.clone(), *request_id),
            GatewayError::ModelNotAllowed { request_id, model } => {
                (Some(format!("model {model} is not allowed")), *request_id)
            }
            GatewayError::FlaggingBlocked { request_id, message, .. }
            | GatewayError::InvalidRequest { request_id, message, .. } => {
                (message.clone(), *request_id)
            }
            GatewayError::RateLimited { request_id, .. } => {
                (Some("rate limit exceeded".to_string()), *request_id)
            }
            GatewayError::ConcurrentLimit { request_id, .. } => {
                (Some("too many concurrent requests".to_string()), *request_id)
            }
            GatewayError::Transient { request_id, message, .. } => (message.clone(), *request_id),
            GatewayError::UpstreamBadRequest { .. } => unreachable!("handled above"),
        };

        let body = ErrorBody { error: ErrorDetail { code: code.clone(), message, request_id } };
        let mut resp = (status, Json(body)).into_response();
        if let Ok(val) = HeaderValue::from_str(&code) {
            resp.headers_mut().insert("X-Error-Code", val);
        }
        match self {
            GatewayError::RateLimited { limit, remaining, reset_unix, retry_after_secs, .. } => {
                header_secs(&mut resp, "Retry-After", retry_after_secs);
                header_secs(&mut resp, "X-RateLimit-Limit", limit);
                header_secs(&mut resp, "X-RateLimit-Remaining", remaining);
                if let Ok(val) = HeaderValue::from_str(&reset_unix.to_string()) {
                    resp.headers_mut().insert("X-RateLimit-Reset", val);
                }
            }
            GatewayError::ConcurrentLimit { retry_after_secs, .. } => {
                header_secs(&mut resp, "Retry-After", retry_after_secs);
            }
            GatewayError::Transient { retry_after_secs: Some(secs), .. } => {
                header_secs(&mut resp, "Retry-After", secs);
            }
            _ => {}
        }
        resp
    }
}

pub type GatewayResult<T> = Result<T, GatewayError>;

// ---------------- Error metrics layer ----------------

// Cap on distinct `code` label values to keep metric cardinality bounded.
const MAX_ERROR_CODES: usize = 40;

static HTTP_ERRORS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("http_errors_total", "Count of HTTP error responses emitted (status >= 400)"),
        &["service", "code", "status"],
    )
    .expect("http_errors_total opts are valid")
});

static DISTINCT_CODES: Lazy<Mutex<HashSet<String>>> = Lazy::new(|| Mutex::new(HashSet::new()));

static DISTINCT_CODES_GAUGE: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new("http_error_codes_distinct", "Distinct error codes observed (capped)")
        .expect("gauge opts are valid")
});

static CODE_OVERFLOW: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new(
        "http_error_code_overflow_total",
        "Errors recorded under the overflow label after exceeding the code cardinality cap",
    )
    .expect("counter opts are valid")
});

/// Register the shared error counters into a service's registry. Safe to skip:
/// the layer still records into the process-wide collectors.
pub fn register_http_error_metrics(registry: &Registry) -> prometheus::Result<()> {
    registry.register(Box::new(HTTP_ERRORS.clone()))?;
    registry.register(Box::new(DISTINCT_CODES_GAUGE.clone()))?;
    registry.register(Box::new(CODE_OVERFLOW.clone()))?;
    Ok(())
}

fn record_http_error(service: &str, code: &str, status: u16) {
    let label = {
        let mut guard = match DISTINCT_CODES.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if guard.contains(code) {
            code.to_string()
        } else if guard.len() < MAX_ERROR_CODES {
            guard.insert(code.to_string());
            DISTINCT_CODES_GAUGE.set(guard.len() as i64);
            code.to_string()
        } else {
            CODE_OVERFLOW.inc();
            "overflow".to_string()
        }
    };
    HTTP_ERRORS.with_label_values(&[service, &label, &status.to_string()]).inc();
}

/// Middleware that counts >=400 responses by service / code / status. The code
/// label is read back from the `X-Error-Code` header set by `GatewayError`.
pub fn http_error_metrics_layer(
    service: &'static str,
) -> impl Fn(Request<Body>, Next) -> Pin<Box<dyn Future<Output = Response> + Send>> + Clone {
    move |req: Request<Body>, next: Next| {
        Box::pin(async move {
            let resp = next.run(req).await;
            let status = resp.status().as_u16();
            if status >= 400 {
                let code = resp
                    .headers()
                    .get("X-Error-Code")
                    .and_then(|value| value.to_str().ok())
                    .unwrap_or("unknown")
                    .to_string();
                record_http_error(service, &code, status);
            }
            resp
        })
    }
}

#[cfg(feature = "test-helpers")]
pub mod test_helpers {
    pub fn simulate_error_code(code: &str) {
        super::record_http_error("test", code, 400);
    }

    pub fn distinct_gauge() -> i64 {
        super::DISTINCT_CODES_GAUGE.get()
    }

    pub fn overflow_count() -> u64 {
        super::CODE_OVERFLOW.get()
    }
}
