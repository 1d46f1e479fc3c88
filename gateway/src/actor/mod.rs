use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};

pub mod cache;
pub mod dev;
pub mod product;
pub mod source;

/// Rate-limited category of upstream call. Closed set; request routing picks
/// one per path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Feature {
    ChatCompletions,
    CodeCompletions,
    Embeddings,
    Attribution,
}

impl Feature {
    pub const ALL: [Feature; 4] = [
        Feature::ChatCompletions,
        Feature::CodeCompletions,
        Feature::Embeddings,
        Feature::Attribution,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Feature::ChatCompletions => "chat_completions",
            Feature::CodeCompletions => "code_completions",
            Feature::Embeddings => "embeddings",
            Feature::Attribution => "attribution",
        }
    }
}

impl std::fmt::Display for Feature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Plan {
    Free,
    Enterprise,
    Internal,
    Dev,
    #[default]
    Unknown,
}

impl Plan {
    /// Internal and dev actors are never throttled.
    pub fn bypasses_rate_limits(&self) -> bool {
        matches!(self, Plan::Internal | Plan::Dev)
    }
}

/// Per-feature entitlement. `limit == 0` means the feature is disabled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimit {
    pub limit: u64,
    pub interval_seconds: u64,
    /// Empty set means the actor carries no model restriction of its own;
    /// the gateway-level allow-list still applies.
    #[serde(default)]
    pub allowed_models: HashSet<String>,
    /// Explicit concurrent cap; when absent the engine derives one from the
    /// configured concurrency percentage.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concurrent_requests: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concurrent_interval_seconds: Option<u64>,
}

impl RateLimit {
    pub fn disabled() -> Self {
        Self {
            limit: 0,
            interval_seconds: 86_400,
            allowed_models: HashSet::new(),
            concurrent_requests: None,
            concurrent_interval_seconds: None,
        }
    }

    pub fn enabled(&self) -> bool {
        self.limit > 0
    }

    pub fn unbounded(models: impl IntoIterator<Item = String>) -> Self {
        Self {
            limit: u64::MAX,
            interval_seconds: 86_400,
            allowed_models: models.into_iter().collect(),
            concurrent_requests: None,
            concurrent_interval_seconds: None,
        }
    }
}

/// An authenticated caller identity with feature entitlements. Serialized
/// into the KV cache keyed by the SHA-256 of the presented token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Actor {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub access_token_sha256: String,
    /// Name of the source that resolved this actor.
    pub source: String,
    pub last_updated: DateTime<Utc>,
    #[serde(default)]
    pub plan: Plan,
    #[serde(default)]
    pub rate_limits: HashMap<Feature, RateLimit>,
}

impl Actor {
    pub fn limit_for(&self, feature: Feature) -> Option<&RateLimit> {
        self.rate_limits.get(&feature)
    }

    /// Whether the actor itself permits `model` for `feature`. An actor with
    /// no recorded set for the feature defers entirely to the gateway list.
    pub fn model_allowed(&self, feature: Feature, model: &str) -> bool {
        match self.rate_limits.get(&feature) {
            Some(limit) if !limit.allowed_models.is_empty() => {
                limit.allowed_models.contains(model)
            }
            _ => true,
        }
    }

    /// A disabled actor has every feature limit at zero.
    pub fn disabled(&self) -> bool {
        !self.rate_limits.values().any(|limit| limit.enabled())
    }
}

/// Cache key material: hex SHA-256 of the raw bearer token.
pub fn access_token_sha256(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hex::encode(hasher.finalize())
}
