#![allow(dead_code)]

use async_trait::async_trait;
use axum::Router;
use chrono::Utc;
use cody_gateway::actor::cache::ActorCache;
use cody_gateway::actor::source::{ActorSource, SourceError, SourceRegistry};
use cody_gateway::actor::{access_token_sha256, Actor, Feature, Plan, RateLimit};
use cody_gateway::app_state::AppState;
use cody_gateway::config::{
    DotcomConfig, EmbeddingsConfig, GatewayConfig, ProviderConfig,
};
use cody_gateway::events::{EventSink, UsageEvent};
use cody_gateway::flagging::{FlaggedPromptRecorder, FlaggingConfig};
use cody_gateway::kv::{Clock, ManualClock, MemoryKeyValue};
use cody_gateway::metrics::GatewayMetrics;
use cody_gateway::notify::NoopNotifier;
use cody_gateway::ratelimit::RateLimiter;
use cody_gateway::upstream::anthropic::AnthropicAdapter;
use cody_gateway::upstream::embeddings::EmbeddingsAdapter;
use cody_gateway::upstream::fireworks::FireworksAdapter;
use cody_gateway::upstream::openai::OpenAiAdapter;
use cody_gateway::upstream::{Dispatcher, Provider};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const TEST_TOKEN: &str = "slk_0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef";

/// Actor with one chat-completions bucket.
pub fn chat_actor(id: &str, limit: u64, interval_secs: u64, models: &[&str]) -> Actor {
    let mut rate_limits = HashMap::new();
    rate_limits.insert(
        Feature::ChatCompletions,
        RateLimit {
            limit,
            interval_seconds: interval_secs,
            allowed_models: models.iter().map(|m| m.to_string()).collect(),
            concurrent_requests: None,
            concurrent_interval_seconds: None,
        },
    );
    Actor {
        id: id.to_string(),
        name: None,
        access_token_sha256: access_token_sha256(TEST_TOKEN),
        source: "test-source".into(),
        last_updated: Utc::now(),
        plan: Plan::Enterprise,
        rate_limits,
    }
}

pub fn with_feature(mut actor: Actor, feature: Feature, limit: RateLimit) -> Actor {
    actor.rate_limits.insert(feature, limit);
    actor
}

/// Source double: mutable token map plus a resolution counter, so tests can
/// assert exactly how often the cache fell through.
pub struct StaticSource {
    actors: Mutex<HashMap<String, Actor>>,
    pub calls: AtomicUsize,
}

impl StaticSource {
    pub fn new(entries: Vec<(String, Actor)>) -> Arc<Self> {
        Arc::new(Self { actors: Mutex::new(entries.into_iter().collect()), calls: AtomicUsize::new(0) })
    }

    pub fn set(&self, token: &str, actor: Actor) {
        self.actors.lock().unwrap().insert(token.to_string(), actor);
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ActorSource for StaticSource {
    fn name(&self) -> &'static str {
        "test-source"
    }

    async fn get(&self, token: &str) -> Result<Actor, SourceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.actors
            .lock()
            .unwrap()
            .get(token)
            .cloned()
            .ok_or(SourceError::NotFound)
    }
}

/// Synchronous capture sink for asserting on emitted usage events.
#[derive(Default)]
pub struct CapturingSink {
    pub events: Mutex<Vec<UsageEvent>>,
}

impl CapturingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn take(&self) -> Vec<UsageEvent> {
        self.events.lock().unwrap().drain(..).collect()
    }

    pub fn snapshot(&self) -> Vec<UsageEvent> {
        self.events.lock().unwrap().clone()
    }
}

impl EventSink for CapturingSink {
    fn record(&self, event: UsageEvent) {
        self.events.lock().unwrap().push(event);
    }
}

pub fn provider_config(api_base: &str, models: &[&str], flagging: FlaggingConfig) -> ProviderConfig {
    ProviderConfig {
        access_token: "upstream-test-token".into(),
        api_base: Some(api_base.to_string()),
        allowed_models: models.iter().map(|m| m.to_string()).collect(),
        flagging,
        starcoder_single_tenant_percent: 0,
    }
}

pub struct Harness {
    pub router: Router,
    pub state: AppState,
    pub clock: Arc<ManualClock>,
    pub kv: Arc<MemoryKeyValue>,
    pub sink: Arc<CapturingSink>,
    pub source: Arc<StaticSource>,
    pub metrics: Arc<GatewayMetrics>,
}

pub struct HarnessBuilder {
    actors: Vec<(String, Actor)>,
    anthropic: Option<ProviderConfig>,
    openai: Option<ProviderConfig>,
    fireworks: Option<ProviderConfig>,
    embeddings: Option<EmbeddingsConfig>,
    allow_anonymous: bool,
    diagnostics_secret: Option<String>,
    dotcom_url: String,
    cooldown_secs: u64,
    cache_ttl_secs: u64,
    auto_flush: bool,
    sink_override: Option<Arc<dyn EventSink>>,
}

impl Default for HarnessBuilder {
    fn default() -> Self {
        Self {
            actors: Vec::new(),
            anthropic: None,
            openai: None,
            fireworks: None,
            embeddings: None,
            allow_anonymous: false,
            diagnostics_secret: None,
            dotcom_url: "http://dotcom.invalid".into(),
            cooldown_secs: 300,
            cache_ttl_secs: 86_400,
            auto_flush: true,
            sink_override: None,
        }
    }
}

impl HarnessBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn actor(mut self, token: &str, actor: Actor) -> Self {
        self.actors.push((token.to_string(), actor));
        self
    }

    pub fn anthropic(mut self, config: ProviderConfig) -> Self {
        self.anthropic = Some(config);
        self
    }

    pub fn openai(mut self, config: ProviderConfig) -> Self {
        self.openai = Some(config);
        self
    }

    pub fn fireworks(mut self, config: ProviderConfig) -> Self {
        self.fireworks = Some(config);
        self
    }

    pub fn embeddings(mut self, config: EmbeddingsConfig) -> Self {
        self.embeddings = Some(config);
        self
    }

    pub fn allow_anonymous(mut self) -> Self {
        self.allow_anonymous = true;
        self
    }

    pub fn diagnostics_secret(mut self, secret: &str) -> Self {
        self.diagnostics_secret = Some(secret.to_string());
        self
    }

    pub fn dotcom_url(mut self, url: &str) -> Self {
        self.dotcom_url = url.to_string();
        self
    }

    pub fn cooldown_secs(mut self, secs: u64) -> Self {
        self.cooldown_secs = secs;
        self
    }

    pub fn cache_ttl_secs(mut self, secs: u64) -> Self {
        self.cache_ttl_secs = secs;
        self
    }

    pub fn event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink_override = Some(sink);
        self
    }

    pub fn build(self) -> Harness {
        let clock = Arc::new(ManualClock::new(1_700_000_000));
        let kv = Arc::new(MemoryKeyValue::with_clock(clock.clone()));
        let source = StaticSource::new(self.actors);
        let sources = Arc::new(SourceRegistry::new(vec![source.clone() as Arc<dyn ActorSource>]));
        let actor_cache = ActorCache::new(
            kv.clone(),
            sources.clone(),
            clock.clone() as Arc<dyn Clock>,
            self.cache_ttl_secs,
            60,
            self.cooldown_secs,
        );
        let metrics = Arc::new(GatewayMetrics::new().expect("metrics"));
        let rate_limiter = RateLimiter::new(
            kv.clone(),
            clock.clone() as Arc<dyn Clock>,
            Arc::new(NoopNotifier),
            0.5,
            10,
            vec![80, 100],
        );
        let sink = CapturingSink::new();
        let events: Arc<dyn EventSink> = match &self.sink_override {
            Some(events) => events.clone(),
            None => sink.clone() as Arc<dyn EventSink>,
        };
        let http_client = reqwest::Client::new();
        let dispatcher = Arc::new(Dispatcher::new(
            http_client.clone(),
            self.auto_flush,
            Duration::from_secs(30),
            Duration::from_secs(10),
        ));

        let config = Arc::new(GatewayConfig {
            port: 0,
            diagnostics_secret: self.diagnostics_secret,
            redis_url: "redis://unused".into(),
            instance_prefix: "test".into(),
            allow_anonymous: self.allow_anonymous,
            sources_sync_interval_secs: 600,
            sources_cache_ttl_secs: self.cache_ttl_secs,
            actor_refresh_cooldown_secs: self.cooldown_secs,
            negative_cache_ttl_secs: 60,
            flagged_prompt_ttl_secs: 3_600,
            dotcom: DotcomConfig {
                url: self.dotcom_url,
                access_token: "dotcom-token".into(),
                internal_mode: false,
            },
            anthropic: self.anthropic.clone().unwrap_or_else(disabled_provider),
            openai: self.openai.clone().unwrap_or_else(disabled_provider),
            fireworks: self.fireworks.clone().unwrap_or_else(disabled_provider),
            embeddings: self.embeddings.clone().unwrap_or(EmbeddingsConfig {
                access_token: String::new(),
                api_base: None,
                allowed_models: Vec::new(),
                max_batch_size: 128,
            }),
            event_buffer_size: 1_024,
            event_buffer_workers: 1,
            concurrency_percentage: 0.5,
            concurrency_interval_secs: 10,
            notify_webhook_url: None,
            notify_thresholds: vec![80, 100],
            auto_flush_streaming_responses: self.auto_flush,
            dev_tokens: HashMap::new(),
            stream_timeout_secs: 30,
            unary_timeout_secs: 10,
        });

        let anthropic = self
            .anthropic
            .as_ref()
            .map(|cfg| Arc::new(AnthropicAdapter::new(cfg)) as Arc<dyn Provider>);
        let openai = self
            .openai
            .as_ref()
            .map(|cfg| Arc::new(OpenAiAdapter::new(cfg)) as Arc<dyn Provider>);
        let fireworks = self
            .fireworks
            .as_ref()
            .map(|cfg| Arc::new(FireworksAdapter::new(cfg)) as Arc<dyn Provider>);
        let embeddings = self.embeddings.as_ref().map(|cfg| Arc::new(EmbeddingsAdapter::new(cfg)));

        let flagged_prompts = Arc::new(FlaggedPromptRecorder::new(kv.clone(), 3_600));

        let state = AppState {
            config,
            kv: kv.clone(),
            actor_cache,
            sources,
            rate_limiter,
            dispatcher,
            anthropic,
            openai,
            fireworks,
            embeddings,
            flagged_prompts,
            events,
            metrics: metrics.clone(),
            http_client,
        };
        let router = cody_gateway::build_router(state.clone());
        Harness { router, state, clock, kv, sink, source, metrics }
    }
}

fn disabled_provider() -> ProviderConfig {
    ProviderConfig {
        access_token: String::new(),
        api_base: None,
        allowed_models: Vec::new(),
        flagging: FlaggingConfig::default(),
        starcoder_single_tenant_percent: 0,
    }
}

/// POST helper with bearer auth and a JSON body.
pub fn post_json(uri: &str, token: Option<&str>, body: &serde_json::Value) -> axum::http::Request<axum::body::Body> {
    let mut builder = axum::http::Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json");
    if let Some(token) = token {
        builder = builder.header("authorization", format!("Bearer {token}"));
    }
    builder
        .body(axum::body::Body::from(body.to_string()))
        .expect("request builds")
}
