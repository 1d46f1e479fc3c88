use super::source::{ActorSource, SourceError};
use super::{access_token_sha256, Actor, Feature, Plan, RateLimit};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;

/// Service-scoped dev tokens: `sgd_` followed by an opaque secret.
pub const DEV_TOKEN_PREFIX: &str = "sgd_";

pub const SOURCE_NAME: &str = "dev-tokens";

/// Config-declared dev/internal tokens. These resolve to unbounded actors on
/// the dev plan and bypass rate limiting entirely.
pub struct DevTokenSource {
    tokens: HashMap<String, String>,
}

impl DevTokenSource {
    /// `entries` is `token -> display name`, parsed from configuration.
    pub fn new(entries: HashMap<String, String>) -> Self {
        Self { tokens: entries }
    }
}

#[async_trait]
impl ActorSource for DevTokenSource {
    fn name(&self) -> &'static str {
        SOURCE_NAME
    }

    async fn get(&self, token: &str) -> Result<Actor, SourceError> {
        if !token.starts_with(DEV_TOKEN_PREFIX) {
            return Err(SourceError::NotFound);
        }
        let Some(name) = self.tokens.get(token) else {
            return Err(SourceError::NotFound);
        };
        let rate_limits =
            Feature::ALL.iter().map(|f| (*f, RateLimit::unbounded(Vec::new()))).collect();
        Ok(Actor {
            id: format!("dev-{name}"),
            name: Some(name.clone()),
            access_token_sha256: access_token_sha256(token),
            source: SOURCE_NAME.into(),
            last_updated: Utc::now(),
            plan: Plan::Dev,
            rate_limits,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unknown_prefix_is_not_found() {
        let source = DevTokenSource::new(HashMap::new());
        assert!(matches!(source.get("slk_abc").await, Err(SourceError::NotFound)));
    }

    #[tokio::test]
    async fn declared_token_resolves_to_dev_plan() {
        let mut entries = HashMap::new();
        entries.insert("sgd_local".to_string(), "local".to_string());
        let source = DevTokenSource::new(entries);
        let actor = source.get("sgd_local").await.unwrap();
        assert_eq!(actor.id, "dev-local");
        assert!(actor.plan.bypasses_rate_limits());
        assert!(actor.limit_for(Feature::ChatCompletions).unwrap().enabled());
    }
}
