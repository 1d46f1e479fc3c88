use anyhow::Context;
use cody_gateway::actor::cache::ActorCache;
use cody_gateway::actor::dev::DevTokenSource;
use cody_gateway::actor::product::ProductSubscriptionSource;
use cody_gateway::actor::source::{ActorSource, SourceRegistry};
use cody_gateway::app_state::AppState;
use cody_gateway::build_router;
use cody_gateway::config::GatewayConfig;
use cody_gateway::events::{BufferedEventSink, EventSink, TracingTelemetryWriter};
use cody_gateway::flagging::FlaggedPromptRecorder;
use cody_gateway::kv::{Clock, KeyValue, RedisKeyValue, SystemClock};
use cody_gateway::metrics::GatewayMetrics;
use cody_gateway::notify::{NoopNotifier, Notifier, WebhookNotifier};
use cody_gateway::ratelimit::RateLimiter;
use cody_gateway::upstream::anthropic::AnthropicAdapter;
use cody_gateway::upstream::embeddings::EmbeddingsAdapter;
use cody_gateway::upstream::fireworks::FireworksAdapter;
use cody_gateway::upstream::openai::OpenAiAdapter;
use cody_gateway::upstream::{Dispatcher, Provider};
use reqwest::Client;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()))
        .init();

    let config = Arc::new(GatewayConfig::from_env()?);

    let kv: Arc<dyn KeyValue> = Arc::new(
        RedisKeyValue::new(&config.redis_url, config.instance_prefix.clone())
            .await
            .context("Failed to connect to Redis")?,
    );
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let http_client = Client::builder().build().context("Failed to build HTTP client")?;

    let mut sources: Vec<Arc<dyn ActorSource>> = Vec::new();
    if !config.dotcom.access_token.is_empty() {
        sources.push(Arc::new(ProductSubscriptionSource::new(
            http_client.clone(),
            config.dotcom.url.clone(),
            config.dotcom.access_token.clone(),
            config.dotcom.internal_mode,
        )));
    } else {
        tracing::warn!("No dotcom access token configured; license tokens will not resolve");
    }
    if !config.dev_tokens.is_empty() {
        info!(count = config.dev_tokens.len(), "Loaded dev tokens");
        sources.push(Arc::new(DevTokenSource::new(config.dev_tokens.clone())));
    }
    let sources = Arc::new(SourceRegistry::new(sources));
    sources.spawn_sync_loop(Duration::from_secs(config.sources_sync_interval_secs));

    let actor_cache = ActorCache::new(
        kv.clone(),
        sources.clone(),
        clock.clone(),
        config.sources_cache_ttl_secs,
        config.negative_cache_ttl_secs,
        config.actor_refresh_cooldown_secs,
    );

    let metrics = Arc::new(GatewayMetrics::new()?);
    metrics.set_build_info();

    let notifier: Arc<dyn Notifier> = match &config.notify_webhook_url {
        Some(url) => Arc::new(WebhookNotifier::new(http_client.clone(), url.clone())),
        None => Arc::new(NoopNotifier),
    };
    let rate_limiter = RateLimiter::new(
        kv.clone(),
        clock.clone(),
        notifier,
        config.concurrency_percentage,
        config.concurrency_interval_secs,
        config.notify_thresholds.clone(),
    );

    let workers = if config.event_buffer_workers == 0 {
        BufferedEventSink::default_workers(config.event_buffer_size)
    } else {
        config.event_buffer_workers
    };
    let sink = BufferedEventSink::new(
        Arc::new(TracingTelemetryWriter),
        metrics.clone(),
        config.event_buffer_size,
        workers,
    );

    let dispatcher = Arc::new(Dispatcher::new(
        http_client.clone(),
        config.auto_flush_streaming_responses,
        Duration::from_secs(config.stream_timeout_secs),
        Duration::from_secs(config.unary_timeout_secs),
    ));

    let anthropic = config
        .anthropic
        .enabled()
        .then(|| Arc::new(AnthropicAdapter::new(&config.anthropic)) as Arc<dyn Provider>);
    let openai = config
        .openai
        .enabled()
        .then(|| Arc::new(OpenAiAdapter::new(&config.openai)) as Arc<dyn Provider>);
    let fireworks = config
        .fireworks
        .enabled()
        .then(|| Arc::new(FireworksAdapter::new(&config.fireworks)) as Arc<dyn Provider>);
    let embeddings = (!config.embeddings.access_token.is_empty())
        .then(|| Arc::new(EmbeddingsAdapter::new(&config.embeddings)));

    let flagged_prompts =
        Arc::new(FlaggedPromptRecorder::new(kv.clone(), config.flagged_prompt_ttl_secs));

    let state = AppState {
        config: config.clone(),
        kv,
        actor_cache,
        sources,
        rate_limiter,
        dispatcher,
        anthropic,
        openai,
        fireworks,
        embeddings,
        flagged_prompts,
        events: sink.clone() as Arc<dyn EventSink>,
        metrics: metrics.clone(),
        http_client,
    };

    let app = build_router(state);
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    info!(%addr, "starting cody-gateway");
    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Drain buffered usage events before exiting.
    sink.shutdown(Duration::from_secs(10)).await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::warn!(?err, "Failed to listen for shutdown signal");
    }
}
