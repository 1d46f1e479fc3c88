use crate::actor::Feature;
use crate::kv::KeyValue;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::warn;

pub const REASON_MAX_TOKENS: &str = "max_tokens_exceeded";
pub const REASON_PROMPT_TOKENS: &str = "prompt_token_cap_exceeded";
pub const REASON_BLOCKED_PATTERN: &str = "blocked_pattern";
pub const REASON_NO_ALLOWED_PATTERN: &str = "no_allowed_prompt_pattern";
pub const REASON_SOFT_CAP: &str = "soft_cap_exceeded";
pub const REASON_RESPONSE_TOKENS: &str = "response_token_cap_exceeded";

/// Per-provider filter configuration. Zero-valued caps are treated as
/// unconfigured and skip their check.
#[derive(Debug, Clone, Default)]
pub struct FlaggingConfig {
    pub allowed_prompt_patterns: Vec<String>,
    pub blocked_prompt_patterns: Vec<String>,
    pub request_blocking_enabled: bool,
    pub prompt_token_flagging_limit: u32,
    pub prompt_token_blocking_limit: u32,
    pub max_tokens_to_sample: u32,
    pub max_tokens_to_sample_flagging_limit: u32,
    pub response_token_blocking_limit: u32,
}

/// Provider-independent view of a parsed request, inputs to the pipeline.
#[derive(Debug, Clone)]
pub struct PromptSummary {
    /// Prompt text concatenated across message parts.
    pub prompt: String,
    pub max_response_tokens: u32,
    /// Provider-supplied token count, when the request body carries one.
    pub native_prompt_tokens: Option<u32>,
}

impl PromptSummary {
    /// Chars/4 rounded up unless the provider gave us a real count.
    pub fn prompt_tokens(&self) -> u32 {
        match self.native_prompt_tokens {
            Some(count) => count,
            None => {
                let chars = self.prompt.chars().count() as u32;
                chars.div_ceil(4)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Flag,
    Block,
}

#[derive(Debug, Clone)]
pub struct Verdict {
    pub decision: Decision,
    pub reasons: Vec<&'static str>,
}

impl Verdict {
    fn allow() -> Self {
        Self { decision: Decision::Allow, reasons: Vec::new() }
    }

    fn block(reason: &'static str) -> Self {
        Self { decision: Decision::Block, reasons: vec![reason] }
    }

    pub fn blocked(&self) -> bool {
        self.decision == Decision::Block
    }

    pub fn flagged(&self) -> bool {
        self.decision != Decision::Allow
    }

    pub fn primary_reason(&self) -> &'static str {
        self.reasons.first().copied().unwrap_or("unknown")
    }
}

/// Evaluate the configured filters, cheapest first. Blocks short-circuit;
/// flag reasons accumulate.
pub fn evaluate(config: &FlaggingConfig, summary: &PromptSummary) -> Verdict {
    if config.max_tokens_to_sample > 0 && summary.max_response_tokens > config.max_tokens_to_sample
    {
        return Verdict::block(REASON_MAX_TOKENS);
    }

    let prompt_tokens = summary.prompt_tokens();
    if config.prompt_token_blocking_limit > 0
        && prompt_tokens > config.prompt_token_blocking_limit
    {
        return Verdict::block(REASON_PROMPT_TOKENS);
    }

    let mut flags: Vec<&'static str> = Vec::new();
    let lowered = summary.prompt.to_lowercase();
    let blocked_hit = config
        .blocked_prompt_patterns
        .iter()
        .any(|pattern| !pattern.is_empty() && lowered.contains(&pattern.to_lowercase()));
    if blocked_hit {
        if config.request_blocking_enabled {
            return Verdict::block(REASON_BLOCKED_PATTERN);
        }
        flags.push(REASON_BLOCKED_PATTERN);
    }

    if !config.allowed_prompt_patterns.is_empty() {
        let any_allowed = config
            .allowed_prompt_patterns
            .iter()
            .any(|pattern| !pattern.is_empty() && lowered.contains(&pattern.to_lowercase()));
        if !any_allowed {
            flags.push(REASON_NO_ALLOWED_PATTERN);
        }
    }

    let soft_prompt = config.prompt_token_flagging_limit > 0
        && prompt_tokens > config.prompt_token_flagging_limit;
    let soft_response = config.max_tokens_to_sample_flagging_limit > 0
        && summary.max_response_tokens > config.max_tokens_to_sample_flagging_limit;
    if soft_prompt || soft_response {
        flags.push(REASON_SOFT_CAP);
    }

    if flags.is_empty() {
        Verdict::allow()
    } else {
        Verdict { decision: Decision::Flag, reasons: flags }
    }
}

/// Post-completion check against the response-token cap; feeds the usage
/// event's flagged reasons, never the response itself.
pub fn response_token_flag(config: &FlaggingConfig, completion_tokens: u32) -> Option<&'static str> {
    if config.response_token_blocking_limit > 0
        && completion_tokens > config.response_token_blocking_limit
    {
        Some(REASON_RESPONSE_TOKENS)
    } else {
        None
    }
}

const PROMPT_PREFIX_MAX_CHARS: usize = 256;
const RECENT_FLAGGED_KEY: &str = "flagged_prompts:recent";
const RECENT_FLAGGED_KEEP: isize = 100;

#[derive(Debug, Serialize, Deserialize)]
pub struct FlaggedPromptRecord {
    pub actor_id: String,
    pub feature: Feature,
    pub reason: String,
    pub prompt_prefix: String,
}

/// Writes blocked-prompt evidence for operator review, TTL-bounded.
pub struct FlaggedPromptRecorder {
    kv: Arc<dyn KeyValue>,
    ttl_secs: u64,
}

impl FlaggedPromptRecorder {
    pub fn new(kv: Arc<dyn KeyValue>, ttl_secs: u64) -> Self {
        Self { kv, ttl_secs }
    }

    pub async fn record(
        &self,
        request_id: &str,
        actor_id: &str,
        feature: Feature,
        reason: &str,
        prompt: &str,
    ) {
        let prefix: String = prompt.chars().take(PROMPT_PREFIX_MAX_CHARS).collect();
        let record = FlaggedPromptRecord {
            actor_id: actor_id.to_string(),
            feature,
            reason: reason.to_string(),
            prompt_prefix: prefix,
        };
        let raw = match serde_json::to_string(&record) {
            Ok(raw) => raw,
            Err(err) => {
                warn!(?err, "Failed to serialize flagged prompt record");
                return;
            }
        };
        let key = format!("flagged_prompt:{request_id}");
        if let Err(err) = self.kv.set_ex(&key, &raw, self.ttl_secs).await {
            warn!(?err, "Failed to record flagged prompt");
            return;
        }
        // recent-IDs ring for the diagnostics listing
        if let Err(err) = self.kv.rpush(RECENT_FLAGGED_KEY, request_id).await {
            warn!(?err, "Failed to append flagged prompt id");
            return;
        }
        let _ = self.kv.ltrim(RECENT_FLAGGED_KEY, -RECENT_FLAGGED_KEEP, -1).await;
        let _ = self.kv.expire(RECENT_FLAGGED_KEY, self.ttl_secs).await;
    }

    pub async fn recent(&self) -> Vec<(String, FlaggedPromptRecord)> {
        let ids = match self.kv.lrange(RECENT_FLAGGED_KEY, 0, -1).await {
            Ok(ids) => ids,
            Err(err) => {
                warn!(?err, "Failed to list flagged prompt ids");
                return Vec::new();
            }
        };
        let mut records = Vec::new();
        for id in ids {
            let key = format!("flagged_prompt:{id}");
            if let Ok(Some(raw)) = self.kv.get(&key).await {
                if let Ok(record) = serde_json::from_str::<FlaggedPromptRecord>(&raw) {
                    records.push((id, record));
                }
            }
        }
        records
    }
}
