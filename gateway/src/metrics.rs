use anyhow::Result;
use axum::body::Body;
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::Response;
use prometheus::{
    Encoder, Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge,
    IntGaugeVec, Opts, Registry, TextEncoder,
};

#[derive(Clone)]
pub struct GatewayMetrics {
    registry: Registry,
    requests: IntCounterVec,
    rate_checks: IntCounterVec,
    rate_rejections: IntCounterVec,
    upstream_latency: HistogramVec,
    rate_limit_latency: Histogram,
    events_dropped: IntCounter,
    event_queue_depth: IntGauge,
    event_queue_capacity: IntGauge,
    build_info: IntGaugeVec,
}

impl GatewayMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();
        let requests = IntCounterVec::new(
            Opts::new("gateway_requests_total", "Requests by feature and terminal status"),
            &["feature", "status"],
        )?;
        let rate_checks = IntCounterVec::new(
            Opts::new("gateway_rate_limit_checks_total", "Total rate limit checks"),
            &["feature"],
        )?;
        let rate_rejections = IntCounterVec::new(
            Opts::new("gateway_rate_limit_rejections_total", "Total rate limit rejections"),
            &["feature", "kind"],
        )?;
        let upstream_latency = HistogramVec::new(
            HistogramOpts::new(
                "gateway_upstream_latency_seconds",
                "Time to upstream completion (headers for streams)",
            )
            .buckets(vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0]),
            &["provider"],
        )?;
        let rate_limit_latency = Histogram::with_opts(HistogramOpts::new(
            "gateway_rate_limiter_decision_seconds",
            "Time spent performing rate limiter decision (seconds)",
        ))?;
        let events_dropped = IntCounter::new(
            "gateway_events_dropped_total",
            "Usage events dropped because the sink queue was full",
        )?;
        let event_queue_depth =
            IntGauge::with_opts(Opts::new("gateway_event_queue_depth", "Current sink queue depth"))?;
        let event_queue_capacity = IntGauge::with_opts(Opts::new(
            "gateway_event_queue_capacity",
            "Configured capacity of the sink queue",
        ))?;
        let build_info = IntGaugeVec::new(
            Opts::new("gateway_build_info", "Build metadata (value is always 1)"),
            &["version"],
        )?;
        registry.register(Box::new(requests.clone()))?;
        registry.register(Box::new(rate_checks.clone()))?;
        registry.register(Box::new(rate_rejections.clone()))?;
        registry.register(Box::new(upstream_latency.clone()))?;
        registry.register(Box::new(rate_limit_latency.clone()))?;
        registry.register(Box::new(events_dropped.clone()))?;
        registry.register(Box::new(event_queue_depth.clone()))?;
        registry.register(Box::new(event_queue_capacity.clone()))?;
        registry.register(Box::new(build_info.clone()))?;
        // error counters shared with the metrics middleware
        common_http_errors::register_http_error_metrics(&registry)?;
        Ok(Self {
            registry,
            requests,
            rate_checks,
            rate_rejections,
            upstream_latency,
            rate_limit_latency,
            events_dropped,
            event_queue_depth,
            event_queue_capacity,
            build_info,
        })
    }

    pub fn record_request(&self, feature: &str, status: &str) {
        self.requests.with_label_values(&[feature, status]).inc();
    }

    pub fn record_rate_check(&self, feature: &str, allowed: bool, kind: &str) {
        self.rate_checks.with_label_values(&[feature]).inc();
        if !allowed {
            self.rate_rejections.with_label_values(&[feature, kind]).inc();
        }
    }

    pub fn observe_upstream_latency(&self, provider: &str, secs: f64) {
        self.upstream_latency.with_label_values(&[provider]).observe(secs);
    }

    pub fn observe_rate_limiter_latency(&self, secs: f64) {
        self.rate_limit_latency.observe(secs);
    }

    pub fn inc_dropped_events(&self) {
        self.events_dropped.inc();
    }

    pub fn dropped_events(&self) -> u64 {
        self.events_dropped.get()
    }

    pub fn set_event_queue_capacity(&self, capacity: usize) {
        self.event_queue_capacity.set(capacity as i64);
    }

    pub fn set_event_queue_depth(&self, depth: usize) {
        self.event_queue_depth.set(depth as i64);
    }

    pub fn set_build_info(&self) {
        self.build_info.with_label_values(&[env!("CARGO_PKG_VERSION")]).set(1);
    }

    pub fn render(&self) -> Result<Response> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        let response = Response::builder()
            .status(StatusCode::OK)
            .header(
                header::CONTENT_TYPE,
                HeaderValue::from_static("text/plain; version=0.0.4"),
            )
            .body(Body::from(buffer))?;
        Ok(response)
    }
}
