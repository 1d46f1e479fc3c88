use super::Actor;
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("token not found")]
    NotFound,
    #[error("access denied: {0}")]
    AccessDenied(String),
    #[error("transient source failure: {0}")]
    Transient(String),
}

/// Resolves a bearer token into an authoritative actor. Implementations own
/// any slow-changing state they need (e.g. a subscription snapshot) and
/// refresh it in `sync`.
#[async_trait]
pub trait ActorSource: Send + Sync {
    fn name(&self) -> &'static str;

    async fn get(&self, token: &str) -> Result<Actor, SourceError>;

    async fn sync(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Ordered set of sources. Resolution walks the list; the first source that
/// recognizes the token decides the outcome.
pub struct SourceRegistry {
    sources: Vec<Arc<dyn ActorSource>>,
}

impl SourceRegistry {
    pub fn new(sources: Vec<Arc<dyn ActorSource>>) -> Self {
        Self { sources }
    }

    /// NotFound lets iteration continue, AccessDenied short-circuits, and a
    /// Transient failure is remembered: when no later source succeeds the
    /// caller sees Transient rather than NotFound, so invalid-token caching
    /// never swallows an outage.
    pub async fn resolve(&self, token: &str) -> Result<Actor, SourceError> {
        let mut transient: Option<String> = None;
        for source in &self.sources {
            match source.get(token).await {
                Ok(actor) => return Ok(actor),
                Err(SourceError::NotFound) => continue,
                Err(SourceError::AccessDenied(reason)) => {
                    return Err(SourceError::AccessDenied(reason));
                }
                Err(SourceError::Transient(reason)) => {
                    warn!(source = source.name(), %reason, "Actor source failed transiently");
                    transient = Some(format!("{}: {}", source.name(), reason));
                }
            }
        }
        match transient {
            Some(reason) => Err(SourceError::Transient(reason)),
            None => Err(SourceError::NotFound),
        }
    }

    /// Periodic refresh of every source's slow-changing state. Failures are
    /// logged and never fatal.
    pub fn spawn_sync_loop(self: &Arc<Self>, every: Duration) -> tokio::task::JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                for source in &registry.sources {
                    match source.sync().await {
                        Ok(()) => debug!(source = source.name(), "Synced actor source"),
                        Err(err) => {
                            warn!(?err, source = source.name(), "Failed to sync actor source");
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actor::{access_token_sha256, Plan};
    use chrono::Utc;
    use std::collections::HashMap;

    struct StaticSource {
        name: &'static str,
        outcome: fn(&str) -> Result<Actor, SourceError>,
    }

    #[async_trait]
    impl ActorSource for StaticSource {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn get(&self, token: &str) -> Result<Actor, SourceError> {
            (self.outcome)(token)
        }
    }

    fn actor(token: &str) -> Actor {
        Actor {
            id: "a-1".into(),
            name: None,
            access_token_sha256: access_token_sha256(token),
            source: "static".into(),
            last_updated: Utc::now(),
            plan: Plan::Enterprise,
            rate_limits: HashMap::new(),
        }
    }

    fn registry(sources: Vec<Arc<dyn ActorSource>>) -> SourceRegistry {
        SourceRegistry::new(sources)
    }

    #[tokio::test]
    async fn first_match_wins_after_not_found() {
        let reg = registry(vec![
            Arc::new(StaticSource { name: "first", outcome: |_| Err(SourceError::NotFound) }),
            Arc::new(StaticSource { name: "second", outcome: |t| Ok(actor(t)) }),
        ]);
        let resolved = reg.resolve("slk_abc").await.unwrap();
        assert_eq!(resolved.id, "a-1");
    }

    #[tokio::test]
    async fn access_denied_short_circuits() {
        let reg = registry(vec![
            Arc::new(StaticSource {
                name: "first",
                outcome: |_| Err(SourceError::AccessDenied("archived".into())),
            }),
            Arc::new(StaticSource { name: "second", outcome: |t| Ok(actor(t)) }),
        ]);
        assert!(matches!(reg.resolve("slk_abc").await, Err(SourceError::AccessDenied(_))));
    }

    #[tokio::test]
    async fn transient_without_success_surfaces_as_transient() {
        let reg = registry(vec![
            Arc::new(StaticSource {
                name: "flaky",
                outcome: |_| Err(SourceError::Transient("dial tcp".into())),
            }),
            Arc::new(StaticSource { name: "second", outcome: |_| Err(SourceError::NotFound) }),
        ]);
        assert!(matches!(reg.resolve("slk_abc").await, Err(SourceError::Transient(_))));
    }

    #[tokio::test]
    async fn transient_then_success_still_resolves() {
        let reg = registry(vec![
            Arc::new(StaticSource {
                name: "flaky",
                outcome: |_| Err(SourceError::Transient("dial tcp".into())),
            }),
            Arc::new(StaticSource { name: "second", outcome: |t| Ok(actor(t)) }),
        ]);
        assert!(reg.resolve("slk_abc").await.is_ok());
    }

    #[tokio::test]
    async fn all_not_found_is_not_found() {
        let reg = registry(vec![
            Arc::new(StaticSource { name: "first", outcome: |_| Err(SourceError::NotFound) }),
            Arc::new(StaticSource { name: "second", outcome: |_| Err(SourceError::NotFound) }),
        ]);
        assert!(matches!(reg.resolve("slk_abc").await, Err(SourceError::NotFound)));
    }
}
