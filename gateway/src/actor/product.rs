use super::source::{ActorSource, SourceError};
use super::{access_token_sha256, Actor, Feature, Plan, RateLimit};
use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use reqwest::StatusCode;
use serde::Deserialize;
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::debug;

/// License-key tokens: `slk_` followed by the hex SHA-256 of a license key.
pub const LICENSE_TOKEN_PREFIX: &str = "slk_";

pub const SOURCE_NAME: &str = "product-subscriptions";

/// Subscription metadata as served by the dotcom gateway API. Rate limits and
/// plan reuse the gateway's own serde shapes.
#[derive(Debug, Clone, Deserialize)]
pub struct SubscriptionRecord {
    pub id: String,
    #[serde(default)]
    pub display_name: Option<String>,
    pub license_key_sha256: String,
    #[serde(default)]
    pub archived: bool,
    #[serde(default = "default_true")]
    pub access_enabled: bool,
    #[serde(default)]
    pub plan: Plan,
    #[serde(default)]
    pub rate_limits: HashMap<Feature, RateLimit>,
}

fn default_true() -> bool {
    true
}

/// Resolves `slk_` tokens against the product-subscription store exposed by
/// the dotcom API. A full snapshot is kept in memory and refreshed by the
/// registry sync loop, so steady-state lookups never leave the process.
pub struct ProductSubscriptionSource {
    client: reqwest::Client,
    dotcom_url: String,
    access_token: String,
    internal_mode: bool,
    snapshot: RwLock<HashMap<String, SubscriptionRecord>>,
}

impl ProductSubscriptionSource {
    pub fn new(
        client: reqwest::Client,
        dotcom_url: String,
        access_token: String,
        internal_mode: bool,
    ) -> Self {
        Self {
            client,
            dotcom_url: dotcom_url.trim_end_matches('/').to_string(),
            access_token,
            internal_mode,
            snapshot: RwLock::new(HashMap::new()),
        }
    }

    fn to_actor(&self, token: &str, record: &SubscriptionRecord) -> Result<Actor, SourceError> {
        if record.archived {
            return Err(SourceError::AccessDenied("subscription archived".into()));
        }
        let plan = if self.internal_mode { Plan::Internal } else { record.plan };
        // Disabled subscriptions still resolve; all-zero limits shut every
        // feature off at the rate-limit layer.
        let rate_limits = if record.access_enabled {
            record.rate_limits.clone()
        } else {
            Feature::ALL.iter().map(|f| (*f, RateLimit::disabled())).collect()
        };
        Ok(Actor {
            id: record.id.clone(),
            name: record.display_name.clone(),
            access_token_sha256: access_token_sha256(token),
            source: SOURCE_NAME.into(),
            last_updated: Utc::now(),
            plan,
            rate_limits,
        })
    }

    async fn fetch_one(&self, license_hash: &str) -> Result<SubscriptionRecord, SourceError> {
        let url = format!("{}/.api/gateway/subscriptions/{}", self.dotcom_url, license_hash);
        let resp = self
            .client
            .get(&url)
            .bearer_auth(&self.access_token)
            .send()
            .await
            .map_err(|err| SourceError::Transient(err.to_string()))?;
        match resp.status() {
            StatusCode::OK => resp
                .json::<SubscriptionRecord>()
                .await
                .map_err(|err| SourceError::Transient(format!("decoding subscription: {err}"))),
            StatusCode::NOT_FOUND => Err(SourceError::NotFound),
            status if status.is_server_error() => {
                Err(SourceError::Transient(format!("dotcom returned {status}")))
            }
            status => Err(SourceError::Transient(format!("unexpected dotcom status {status}"))),
        }
    }
}

#[async_trait]
impl ActorSource for ProductSubscriptionSource {
    fn name(&self) -> &'static str {
        SOURCE_NAME
    }

    async fn get(&self, token: &str) -> Result<Actor, SourceError> {
        let Some(license_hash) = token.strip_prefix(LICENSE_TOKEN_PREFIX) else {
            return Err(SourceError::NotFound);
        };

        {
            let snapshot = self.snapshot.read().await;
            if let Some(record) = snapshot.get(license_hash) {
                return self.to_actor(token, record);
            }
        }

        let record = self.fetch_one(license_hash).await?;
        let actor = self.to_actor(token, &record);
        self.snapshot.write().await.insert(license_hash.to_string(), record);
        actor
    }

    async fn sync(&self) -> anyhow::Result<()> {
        let url = format!("{}/.api/gateway/subscriptions", self.dotcom_url);
        let resp = self
            .client
            .get(&url)
            .bearer_auth(&self.access_token)
            .send()
            .await
            .context("Failed to fetch subscription snapshot")?;
        let resp = resp.error_for_status().context("Subscription snapshot request rejected")?;
        let records: Vec<SubscriptionRecord> =
            resp.json().await.context("Failed to decode subscription snapshot")?;
        let count = records.len();
        let latest: HashMap<String, SubscriptionRecord> = records
            .into_iter()
            .map(|record| (record.license_key_sha256.clone(), record))
            .collect();
        let mut snapshot = self.snapshot.write().await;
        *snapshot = latest;
        debug!(count, "Refreshed subscription snapshot");
        Ok(())
    }
}
