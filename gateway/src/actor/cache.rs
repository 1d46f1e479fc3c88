use super::source::{SourceError, SourceRegistry};
use super::{access_token_sha256, Actor};
use crate::kv::{Clock, KeyValue};
use chrono::DateTime;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

fn cache_key(token_sha256: &str) -> String {
    format!("actor:token:{token_sha256}")
}

/// What the KV holds per token hash. Negative outcomes are cached too, with a
/// short TTL, so invalid tokens cannot hammer the sources.
#[derive(Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
enum CacheRecord {
    Resolved { actor: Actor },
    NotFound,
    AccessDenied { reason: String },
}

pub struct ActorCache {
    kv: Arc<dyn KeyValue>,
    registry: Arc<SourceRegistry>,
    clock: Arc<dyn Clock>,
    cache_ttl_secs: u64,
    negative_ttl_secs: u64,
    refresh_cooldown_secs: u64,
    // serializes refreshes per token hash
    inflight: Mutex<HashSet<String>>,
}

impl ActorCache {
    pub fn new(
        kv: Arc<dyn KeyValue>,
        registry: Arc<SourceRegistry>,
        clock: Arc<dyn Clock>,
        cache_ttl_secs: u64,
        negative_ttl_secs: u64,
        refresh_cooldown_secs: u64,
    ) -> Arc<Self> {
        Arc::new(Self {
            kv,
            registry,
            clock,
            cache_ttl_secs,
            negative_ttl_secs,
            refresh_cooldown_secs,
            inflight: Mutex::new(HashSet::new()),
        })
    }

    /// Resolve a bearer token. Hits are served straight from KV; a hit older
    /// than the cooldown additionally schedules a background refresh. Misses
    /// query the source registry and populate the cache.
    pub async fn get(self: &Arc<Self>, token: &str) -> Result<Actor, SourceError> {
        let hash = access_token_sha256(token);
        let key = cache_key(&hash);

        let cached = match self.kv.get(&key).await {
            Ok(value) => value,
            Err(err) => {
                // Cache being down must not take auth down with it.
                warn!(?err, "Actor cache read failed; falling through to sources");
                None
            }
        };

        if let Some(raw) = cached {
            match serde_json::from_str::<CacheRecord>(&raw) {
                Ok(CacheRecord::Resolved { actor }) => {
                    let age = self.clock.now_unix() - actor.last_updated.timestamp();
                    if age >= self.refresh_cooldown_secs as i64 {
                        self.schedule_refresh(token.to_string(), hash);
                    }
                    return Ok(actor);
                }
                Ok(CacheRecord::NotFound) => return Err(SourceError::NotFound),
                Ok(CacheRecord::AccessDenied { reason }) => {
                    return Err(SourceError::AccessDenied(reason));
                }
                Err(err) => {
                    warn!(?err, "Discarding undecodable actor cache entry");
                }
            }
        }

        self.resolve_and_store(token, &hash).await
    }

    /// Drop a token's cache entry (revocation signal / diagnostics).
    pub async fn evict(&self, token: &str) -> anyhow::Result<()> {
        self.kv.del(&cache_key(&access_token_sha256(token))).await
    }

    async fn resolve_and_store(&self, token: &str, hash: &str) -> Result<Actor, SourceError> {
        match self.registry.resolve(token).await {
            Ok(actor) => {
                let actor = self.stamp(actor);
                self.store(hash, &CacheRecord::Resolved { actor: actor.clone() }, self.cache_ttl_secs)
                    .await;
                Ok(actor)
            }
            Err(SourceError::NotFound) => {
                self.store(hash, &CacheRecord::NotFound, self.negative_ttl_secs).await;
                Err(SourceError::NotFound)
            }
            Err(SourceError::AccessDenied(reason)) => {
                self.store(
                    hash,
                    &CacheRecord::AccessDenied { reason: reason.clone() },
                    self.negative_ttl_secs,
                )
                .await;
                Err(SourceError::AccessDenied(reason))
            }
            // Transient outcomes are never cached.
            Err(err @ SourceError::Transient(_)) => Err(err),
        }
    }

    fn schedule_refresh(self: &Arc<Self>, token: String, hash: String) {
        {
            let mut inflight = match self.inflight.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            if !inflight.insert(hash.clone()) {
                return;
            }
        }
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            match cache.registry.resolve(&token).await {
                Ok(actor) => {
                    let actor = cache.stamp(actor);
                    cache
                        .store(&hash, &CacheRecord::Resolved { actor }, cache.cache_ttl_secs)
                        .await;
                    debug!(token_hash = %hash, "Refreshed actor");
                }
                // A refresh that finds the token gone is the revocation
                // signal: replace the stale entry with a tombstone.
                Err(SourceError::NotFound) => {
                    cache.store(&hash, &CacheRecord::NotFound, cache.negative_ttl_secs).await;
                }
                Err(SourceError::AccessDenied(reason)) => {
                    cache
                        .store(
                            &hash,
                            &CacheRecord::AccessDenied { reason },
                            cache.negative_ttl_secs,
                        )
                        .await;
                }
                // Keep serving the stale entry until the sources recover.
                Err(SourceError::Transient(reason)) => {
                    warn!(token_hash = %hash, %reason, "Actor refresh failed transiently");
                }
            }
            let mut inflight = match cache.inflight.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            inflight.remove(&hash);
        });
    }

    /// Stamp resolution time; the cooldown clock runs against this.
    fn stamp(&self, mut actor: Actor) -> Actor {
        if let Some(now) = DateTime::from_timestamp(self.clock.now_unix(), 0) {
            actor.last_updated = now;
        }
        actor
    }

    async fn store(&self, hash: &str, record: &CacheRecord, ttl_secs: u64) {
        let raw = match serde_json::to_string(record) {
            Ok(raw) => raw,
            Err(err) => {
                warn!(?err, "Failed to serialize actor cache record");
                return;
            }
        };
        if let Err(err) = self.kv.set_ex(&cache_key(hash), &raw, ttl_secs).await {
            warn!(?err, "Failed to write actor cache record");
        }
    }
}
