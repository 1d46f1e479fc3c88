use crate::actor::{Actor, Feature, RateLimit};
use crate::kv::{Clock, KeyValue};
use crate::notify::{Notifier, UsageNotification};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum LimitError {
    /// Feature limit is zero or absent: the actor is not entitled at all.
    #[error("feature disabled for actor")]
    Disabled,
    #[error("rate limit exceeded")]
    RateLimited { limit: u64, retry_after_secs: u64, reset_unix: i64 },
    #[error("concurrency limit exceeded")]
    Concurrent { retry_after_secs: u64 },
    #[error(transparent)]
    Kv(#[from] anyhow::Error),
}

/// Successful sliding-window reservation; carries what the response headers
/// need. `bypass` reservations (internal/dev plans) skip header reporting.
#[derive(Debug, Clone, Copy)]
pub struct WindowReservation {
    pub limit: u64,
    pub used: u64,
    pub remaining: u64,
    pub reset_unix: i64,
    pub bypass: bool,
}

/// Per-actor per-feature sliding window plus a short-TTL concurrent gate.
pub struct RateLimiter {
    kv: Arc<dyn KeyValue>,
    clock: Arc<dyn Clock>,
    notifier: Arc<dyn Notifier>,
    concurrency_percentage: f64,
    concurrent_interval_secs: u64,
    notify_thresholds: Vec<u8>,
}

fn window_key(actor_id: &str, feature: Feature) -> String {
    format!("ratelimit:{actor_id}:{feature}")
}

fn count_key(actor_id: &str, feature: Feature) -> String {
    format!("ratelimit:{actor_id}:{feature}:count")
}

fn concurrent_key(actor_id: &str) -> String {
    format!("concurrent:{actor_id}")
}

impl RateLimiter {
    pub fn new(
        kv: Arc<dyn KeyValue>,
        clock: Arc<dyn Clock>,
        notifier: Arc<dyn Notifier>,
        concurrency_percentage: f64,
        concurrent_interval_secs: u64,
        notify_thresholds: Vec<u8>,
    ) -> Arc<Self> {
        Arc::new(Self {
            kv,
            clock,
            notifier,
            concurrency_percentage,
            concurrent_interval_secs,
            notify_thresholds,
        })
    }

    /// Reserve one unit in the actor's sliding window for `feature`.
    ///
    /// The window is a list of request timestamps plus an atomically
    /// incremented count mirror. Ties between concurrent reservations are
    /// broken by the post-increment value: whoever pushes the counter past
    /// the limit undoes its own append and is rejected.
    pub async fn reserve(
        self: &Arc<Self>,
        actor: &Actor,
        feature: Feature,
    ) -> Result<WindowReservation, LimitError> {
        if actor.plan.bypasses_rate_limits() {
            return Ok(WindowReservation {
                limit: u64::MAX,
                used: 0,
                remaining: u64::MAX,
                reset_unix: self.clock.now_unix(),
                bypass: true,
            });
        }
        let limit = actor.limit_for(feature).cloned().ok_or(LimitError::Disabled)?;
        if !limit.enabled() {
            return Err(LimitError::Disabled);
        }

        let now = self.clock.now_unix();
        let interval = limit.interval_seconds.max(1) as i64;
        let window_start = now - interval;
        let list_key = window_key(&actor.id, feature);
        let counter_key = count_key(&actor.id, feature);

        let raw = self.kv.lrange(&list_key, 0, -1).await.map_err(LimitError::Kv)?;
        let timestamps: Vec<i64> = raw.iter().filter_map(|ts| ts.parse().ok()).collect();
        let stale = timestamps.iter().take_while(|ts| **ts < window_start).count();
        if stale > 0 {
            self.kv.ltrim(&list_key, stale as isize, -1).await.map_err(LimitError::Kv)?;
            self.kv.incr_by(&counter_key, -(stale as i64)).await.map_err(LimitError::Kv)?;
        }
        let in_window = &timestamps[stale..];

        if in_window.len() as u64 >= limit.limit {
            let oldest = in_window.first().copied().unwrap_or(now);
            return Err(self.rejected(&limit, oldest, now));
        }

        self.kv.rpush(&list_key, &now.to_string()).await.map_err(LimitError::Kv)?;
        let count = self.kv.incr_by(&counter_key, 1).await.map_err(LimitError::Kv)?;
        self.kv.expire(&list_key, interval as u64).await.map_err(LimitError::Kv)?;
        self.kv.expire(&counter_key, interval as u64).await.map_err(LimitError::Kv)?;

        if count.max(0) as u64 > limit.limit {
            // Lost the race: compensate our own append (newest occurrence).
            self.kv.lrem(&list_key, -1, &now.to_string()).await.map_err(LimitError::Kv)?;
            self.kv.incr_by(&counter_key, -1).await.map_err(LimitError::Kv)?;
            let oldest = in_window.first().copied().unwrap_or(now);
            return Err(self.rejected(&limit, oldest, now));
        }

        let used = count.max(0) as u64;
        let window_anchor = in_window.first().copied().unwrap_or(now);
        self.maybe_notify(actor, feature, &limit, used, window_anchor);

        Ok(WindowReservation {
            limit: limit.limit,
            used,
            remaining: limit.limit.saturating_sub(used),
            reset_unix: window_anchor + interval,
            bypass: false,
        })
    }

    fn rejected(&self, limit: &RateLimit, oldest_in_window: i64, now: i64) -> LimitError {
        let interval = limit.interval_seconds.max(1) as i64;
        let reset = oldest_in_window + interval;
        LimitError::RateLimited {
            limit: limit.limit,
            retry_after_secs: (reset - now).clamp(1, interval) as u64,
            reset_unix: reset,
        }
    }

    /// Derived concurrent-request cap. Explicit caps on the actor win; the
    /// derived value is floored at 1 for any enabled feature.
    pub fn concurrent_cap(&self, limit: &RateLimit) -> u64 {
        if !limit.enabled() {
            return 0;
        }
        if let Some(explicit) = limit.concurrent_requests {
            return explicit.max(1);
        }
        let concurrent_interval =
            limit.concurrent_interval_seconds.unwrap_or(self.concurrent_interval_secs).max(1);
        let per_interval = self.concurrency_percentage * limit.limit as f64 * concurrent_interval as f64
            / limit.interval_seconds.max(1) as f64;
        (per_interval.ceil() as u64).max(1)
    }

    /// Acquire an in-flight slot. Returns `None` for bypass plans (no gate).
    /// The guard releases the slot exactly once, on explicit release or drop.
    pub async fn acquire_concurrent(
        self: &Arc<Self>,
        actor: &Actor,
        feature: Feature,
    ) -> Result<Option<ConcurrencyGuard>, LimitError> {
        if actor.plan.bypasses_rate_limits() {
            return Ok(None);
        }
        let limit = actor.limit_for(feature).cloned().ok_or(LimitError::Disabled)?;
        let cap = self.concurrent_cap(&limit);
        if cap == 0 {
            return Err(LimitError::Disabled);
        }
        let interval =
            limit.concurrent_interval_seconds.unwrap_or(self.concurrent_interval_secs).max(1);
        let key = concurrent_key(&actor.id);

        let current = self.kv.incr_by(&key, 1).await.map_err(LimitError::Kv)?;
        if current == 1 {
            self.kv.expire(&key, interval).await.map_err(LimitError::Kv)?;
        }
        if current.max(0) as u64 > cap {
            self.kv.incr_by(&key, -1).await.map_err(LimitError::Kv)?;
            let ttl = self.kv.ttl(&key).await.unwrap_or(-1);
            return Err(LimitError::Concurrent {
                retry_after_secs: if ttl > 0 { ttl as u64 } else { 1 },
            });
        }
        Ok(Some(ConcurrencyGuard {
            kv: Arc::clone(&self.kv),
            key,
            released: AtomicBool::new(false),
        }))
    }

    fn maybe_notify(
        self: &Arc<Self>,
        actor: &Actor,
        feature: Feature,
        limit: &RateLimit,
        used: u64,
        window_start: i64,
    ) {
        if limit.limit == 0 {
            return;
        }
        let pct = (used.saturating_mul(100) / limit.limit) as u8;
        let Some(&threshold) =
            self.notify_thresholds.iter().filter(|t| pct >= **t).max()
        else {
            return;
        };
        let engine = Arc::clone(self);
        let notification = UsageNotification {
            actor_id: actor.id.clone(),
            feature,
            usage_percentage: pct,
            limit: limit.limit,
        };
        let sentinel = format!(
            "notified:{}:{}:{}:{}",
            actor.id, feature, threshold, window_start
        );
        let interval = limit.interval_seconds.max(1);
        // Off the request path: dedupe and webhook delivery both go async.
        tokio::spawn(async move {
            match engine.kv.set_nx_ex(&sentinel, "1", interval).await {
                Ok(true) => {
                    if let Err(err) = engine.notifier.notify_usage(&notification).await {
                        warn!(?err, actor_id = %notification.actor_id, "Failed to deliver usage notification");
                    }
                }
                Ok(false) => {}
                Err(err) => warn!(?err, "Failed to write notification sentinel"),
            }
        });
    }
}

/// RAII slot in the concurrent gate. Explicit `release` decrements inline;
/// otherwise drop schedules the decrement so cancelled requests (client
/// disconnects drop the handler future) still give the slot back.
pub struct ConcurrencyGuard {
    kv: Arc<dyn KeyValue>,
    key: String,
    released: AtomicBool,
}

impl ConcurrencyGuard {
    pub async fn release(self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(err) = self.kv.incr_by(&self.key, -1).await {
            warn!(?err, key = %self.key, "Failed to release concurrency slot");
        }
    }
}

impl Drop for ConcurrencyGuard {
    fn drop(&mut self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        let kv = Arc::clone(&self.kv);
        let key = std::mem::take(&mut self.key);
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if let Err(err) = kv.incr_by(&key, -1).await {
                    warn!(?err, key = %key, "Failed to release concurrency slot");
                }
            });
        }
    }
}
