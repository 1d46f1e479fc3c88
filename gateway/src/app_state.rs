use crate::actor::cache::ActorCache;
use crate::actor::source::SourceRegistry;
use crate::config::GatewayConfig;
use crate::events::EventSink;
use crate::flagging::FlaggedPromptRecorder;
use crate::kv::KeyValue;
use crate::metrics::GatewayMetrics;
use crate::ratelimit::RateLimiter;
use crate::upstream::embeddings::EmbeddingsAdapter;
use crate::upstream::{Dispatcher, Provider};
use reqwest::Client;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<GatewayConfig>,
    pub kv: Arc<dyn KeyValue>,
    pub actor_cache: Arc<ActorCache>,
    pub sources: Arc<SourceRegistry>,
    pub rate_limiter: Arc<RateLimiter>,
    pub dispatcher: Arc<Dispatcher>,
    pub anthropic: Option<Arc<dyn Provider>>,
    pub openai: Option<Arc<dyn Provider>>,
    pub fireworks: Option<Arc<dyn Provider>>,
    pub embeddings: Option<Arc<EmbeddingsAdapter>>,
    pub flagged_prompts: Arc<FlaggedPromptRecorder>,
    pub events: Arc<dyn EventSink>,
    pub metrics: Arc<GatewayMetrics>,
    pub http_client: Client,
}
