use crate::flagging::FlaggingConfig;
use anyhow::{Context, Result};
use std::collections::HashMap;
use std::env;
use std::str::FromStr;

fn env_parsed<T: FromStr>(name: &str, default: T) -> T {
    env::var(name).ok().and_then(|value| value.parse::<T>().ok()).unwrap_or(default)
}

fn env_bool(name: &str, default: bool) -> bool {
    env::var(name)
        .map(|value| value == "1" || value.eq_ignore_ascii_case("true"))
        .unwrap_or(default)
}

fn env_csv(name: &str) -> Vec<String> {
    env::var(name)
        .map(|value| {
            value
                .split(',')
                .map(|item| item.trim().to_string())
                .filter(|item| !item.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

#[derive(Debug, Clone)]
pub struct DotcomConfig {
    pub url: String,
    pub access_token: String,
    pub internal_mode: bool,
}

#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub access_token: String,
    pub api_base: Option<String>,
    pub allowed_models: Vec<String>,
    pub flagging: FlaggingConfig,
    /// Fireworks only; ignored elsewhere.
    pub starcoder_single_tenant_percent: u8,
}

impl ProviderConfig {
    pub fn enabled(&self) -> bool {
        !self.access_token.is_empty()
    }

    /// Each provider reads its own prefix; flagging configuration is never
    /// shared across providers.
    fn from_env(prefix: &str) -> Self {
        let var = |suffix: &str| format!("CODY_GATEWAY_{prefix}_{suffix}");
        Self {
            access_token: env::var(var("ACCESS_TOKEN")).unwrap_or_default(),
            api_base: env::var(var("API_BASE")).ok(),
            allowed_models: env_csv(&var("ALLOWED_MODELS")),
            flagging: FlaggingConfig {
                allowed_prompt_patterns: env_csv(&var("ALLOWED_PROMPT_PATTERNS")),
                blocked_prompt_patterns: env_csv(&var("BLOCKED_PROMPT_PATTERNS")),
                request_blocking_enabled: env_bool(&var("REQUEST_BLOCKING_ENABLED"), false),
                prompt_token_flagging_limit: env_parsed(&var("PROMPT_TOKEN_FLAGGING_LIMIT"), 0),
                prompt_token_blocking_limit: env_parsed(&var("PROMPT_TOKEN_BLOCKING_LIMIT"), 0),
                max_tokens_to_sample: env_parsed(&var("MAX_TOKENS_TO_SAMPLE"), 0),
                max_tokens_to_sample_flagging_limit: env_parsed(
                    &var("MAX_TOKENS_TO_SAMPLE_FLAGGING_LIMIT"),
                    0,
                ),
                response_token_blocking_limit: env_parsed(
                    &var("RESPONSE_TOKEN_BLOCKING_LIMIT"),
                    0,
                ),
            },
            starcoder_single_tenant_percent: env_parsed::<u8>(
                &var("STARCODER_SINGLE_TENANT_PERCENT"),
                0,
            )
            .min(100),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EmbeddingsConfig {
    pub access_token: String,
    pub api_base: Option<String>,
    pub allowed_models: Vec<String>,
    pub max_batch_size: usize,
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub port: u16,
    pub diagnostics_secret: Option<String>,
    pub redis_url: String,
    pub instance_prefix: String,
    pub allow_anonymous: bool,
    pub sources_sync_interval_secs: u64,
    pub sources_cache_ttl_secs: u64,
    pub actor_refresh_cooldown_secs: u64,
    pub negative_cache_ttl_secs: u64,
    pub flagged_prompt_ttl_secs: u64,
    pub dotcom: DotcomConfig,
    pub anthropic: ProviderConfig,
    pub openai: ProviderConfig,
    pub fireworks: ProviderConfig,
    pub embeddings: EmbeddingsConfig,
    pub event_buffer_size: usize,
    pub event_buffer_workers: usize,
    pub concurrency_percentage: f64,
    pub concurrency_interval_secs: u64,
    pub notify_webhook_url: Option<String>,
    pub notify_thresholds: Vec<u8>,
    pub auto_flush_streaming_responses: bool,
    pub dev_tokens: HashMap<String, String>,
    pub stream_timeout_secs: u64,
    pub unary_timeout_secs: u64,
}

impl GatewayConfig {
    pub fn from_env() -> Result<Self> {
        let redis_url = env::var("REDIS_URL").context("REDIS_URL must be set")?;
        let thresholds = parse_thresholds(
            &env::var("CODY_GATEWAY_RATE_LIMIT_NOTIFY_THRESHOLDS").unwrap_or_default(),
        );
        Ok(Self {
            port: env_parsed("CODY_GATEWAY_PORT", 9992),
            diagnostics_secret: env::var("CODY_GATEWAY_DIAGNOSTICS_SECRET").ok(),
            redis_url,
            instance_prefix: env::var("CODY_GATEWAY_INSTANCE_PREFIX")
                .unwrap_or_else(|_| "cody-gateway".to_string()),
            allow_anonymous: env_bool("CODY_GATEWAY_ALLOW_ANONYMOUS", false),
            sources_sync_interval_secs: env_parsed(
                "CODY_GATEWAY_SOURCES_SYNC_INTERVAL_SECONDS",
                600u64,
            )
            .max(10),
            sources_cache_ttl_secs: env_parsed(
                "CODY_GATEWAY_SOURCES_CACHE_TTL_SECONDS",
                86_400u64,
            )
            .max(60),
            actor_refresh_cooldown_secs: env_parsed(
                "CODY_GATEWAY_ACTOR_REFRESH_COOLDOWN_SECONDS",
                300u64,
            )
            .max(10),
            // bounds lookup load on invalid tokens; not operator-tunable
            negative_cache_ttl_secs: 60,
            flagged_prompt_ttl_secs: env_parsed(
                "CODY_GATEWAY_FLAGGED_PROMPT_TTL_SECONDS",
                3_600u64,
            )
            .max(60),
            dotcom: DotcomConfig {
                url: env::var("CODY_GATEWAY_DOTCOM_URL")
                    .unwrap_or_else(|_| "https://sourcegraph.com".to_string()),
                access_token: env::var("CODY_GATEWAY_DOTCOM_ACCESS_TOKEN").unwrap_or_default(),
                internal_mode: env_bool("CODY_GATEWAY_DOTCOM_INTERNAL_MODE", false),
            },
            anthropic: ProviderConfig::from_env("ANTHROPIC"),
            openai: ProviderConfig::from_env("OPENAI"),
            fireworks: ProviderConfig::from_env("FIREWORKS"),
            embeddings: EmbeddingsConfig {
                access_token: env::var("CODY_GATEWAY_EMBEDDINGS_ACCESS_TOKEN")
                    .or_else(|_| env::var("CODY_GATEWAY_OPENAI_ACCESS_TOKEN"))
                    .unwrap_or_default(),
                api_base: env::var("CODY_GATEWAY_EMBEDDINGS_API_BASE").ok(),
                allowed_models: env_csv("CODY_GATEWAY_ALLOWED_EMBEDDINGS_MODELS"),
                max_batch_size: env_parsed("CODY_GATEWAY_EMBEDDINGS_MAX_BATCH_SIZE", 128usize)
                    .max(1),
            },
            event_buffer_size: env_parsed("CODY_GATEWAY_EVENT_BUFFER_SIZE", 1_024usize).max(1),
            // zero means derive from the buffer size
            event_buffer_workers: env_parsed("CODY_GATEWAY_EVENT_BUFFER_WORKERS", 0usize),
            concurrency_percentage: env_parsed(
                "CODY_GATEWAY_ACTOR_CONCURRENCY_LIMIT_PERCENTAGE",
                0.5f64,
            )
            .clamp(0.0, 1.0),
            concurrency_interval_secs: env_parsed(
                "CODY_GATEWAY_ACTOR_CONCURRENCY_LIMIT_INTERVAL_SECONDS",
                10u64,
            )
            .max(1),
            notify_webhook_url: env::var("CODY_GATEWAY_RATE_LIMIT_NOTIFY_WEBHOOK_URL").ok(),
            notify_thresholds: thresholds,
            auto_flush_streaming_responses: env_bool(
                "CODY_GATEWAY_AUTO_FLUSH_STREAMING_RESPONSES",
                true,
            ),
            dev_tokens: parse_dev_tokens(
                &env::var("CODY_GATEWAY_DEV_TOKENS").unwrap_or_default(),
            ),
            stream_timeout_secs: env_parsed("CODY_GATEWAY_STREAM_TIMEOUT_SECONDS", 600u64).max(1),
            unary_timeout_secs: env_parsed("CODY_GATEWAY_UNARY_TIMEOUT_SECONDS", 120u64).max(1),
        })
    }
}

/// `token:name` pairs, comma separated.
fn parse_dev_tokens(raw: &str) -> HashMap<String, String> {
    raw.split(',')
        .filter_map(|pair| {
            let (token, name) = pair.trim().split_once(':')?;
            if token.is_empty() || name.is_empty() {
                return None;
            }
            Some((token.to_string(), name.to_string()))
        })
        .collect()
}

fn parse_thresholds(raw: &str) -> Vec<u8> {
    let mut thresholds: Vec<u8> = raw
        .split(',')
        .filter_map(|value| value.trim().parse::<u8>().ok())
        .filter(|value| *value > 0 && *value <= 100)
        .collect();
    if thresholds.is_empty() {
        thresholds = vec![80, 100];
    }
    thresholds.sort_unstable();
    thresholds.dedup();
    thresholds
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dev_tokens_parse_and_skip_malformed_pairs() {
        let tokens = parse_dev_tokens("sgd_abc:alice, sgd_def:bob, broken, :nope");
        assert_eq!(tokens.len(), 2);
        assert_eq!(tokens["sgd_abc"], "alice");
        assert_eq!(tokens["sgd_def"], "bob");
    }

    #[test]
    fn thresholds_default_and_normalize() {
        assert_eq!(parse_thresholds(""), vec![80, 100]);
        assert_eq!(parse_thresholds("100,80,80"), vec![80, 100]);
        assert_eq!(parse_thresholds("50"), vec![50]);
        // out-of-range entries are dropped
        assert_eq!(parse_thresholds("0,120"), vec![80, 100]);
    }
}
