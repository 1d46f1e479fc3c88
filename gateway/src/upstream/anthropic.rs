use super::{
    concat_message_text, parse_body, required_str, AuthStyle, ParsedRequest, Provider, Usage,
    UsageAccumulator,
};
use crate::actor::Feature;
use crate::config::ProviderConfig;
use crate::flagging::{FlaggingConfig, PromptSummary};
use common_http_errors::GatewayError;
use serde_json::Value;
use uuid::Uuid;

pub const PROVIDER_NAME: &str = "anthropic";

const DEFAULT_API_BASE: &str = "https://api.anthropic.com";

/// Fronts both Anthropic API shapes: legacy text completions
/// (`prompt` / `max_tokens_to_sample` / `/v1/complete`) and messages
/// (`messages` / `max_tokens` / `/v1/messages`).
pub struct AnthropicAdapter {
    api_base: String,
    access_token: String,
    allowed_models: Vec<String>,
    flagging: FlaggingConfig,
}

impl AnthropicAdapter {
    pub fn new(config: &ProviderConfig) -> Self {
        Self {
            api_base: config
                .api_base
                .clone()
                .unwrap_or_else(|| DEFAULT_API_BASE.to_string()),
            access_token: config.access_token.clone(),
            allowed_models: config.allowed_models.clone(),
            flagging: config.flagging.clone(),
        }
    }
}

impl Provider for AnthropicAdapter {
    fn name(&self) -> &'static str {
        PROVIDER_NAME
    }

    fn allowed_models(&self) -> &[String] {
        &self.allowed_models
    }

    fn access_token(&self) -> &str {
        &self.access_token
    }

    fn auth_style(&self) -> AuthStyle {
        AuthStyle::XApiKey
    }

    fn flagging(&self) -> &FlaggingConfig {
        &self.flagging
    }

    fn parse(
        &self,
        body: &[u8],
        _actor_id: &str,
        request_id: Uuid,
    ) -> Result<ParsedRequest, GatewayError> {
        let value = parse_body(body, request_id)?;
        let model = required_str(&value, "model", request_id)?;
        let stream = value.get("stream").and_then(|v| v.as_bool()).unwrap_or(false);

        let messages_shape = value.get("messages").is_some();
        let (prompt, max_response_tokens, endpoint) = if messages_shape {
            let prompt = concat_message_text(&value);
            let max = value.get("max_tokens").and_then(|v| v.as_u64()).unwrap_or(0) as u32;
            (prompt, max, format!("{}/v1/messages", self.api_base))
        } else {
            let prompt = value
                .get("prompt")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            let max =
                value.get("max_tokens_to_sample").and_then(|v| v.as_u64()).unwrap_or(0) as u32;
            (prompt, max, format!("{}/v1/complete", self.api_base))
        };

        Ok(ParsedRequest {
            upstream_model: model.clone(),
            model,
            feature: Feature::ChatCompletions,
            stream,
            summary: PromptSummary { prompt, max_response_tokens, native_prompt_tokens: None },
            body: value,
            endpoint,
        })
    }

    fn accumulator(&self) -> Box<dyn UsageAccumulator> {
        Box::new(AnthropicAccumulator::default())
    }

    fn unary_usage(&self, body: &[u8], summary: &PromptSummary) -> Usage {
        let Ok(value) = serde_json::from_slice::<Value>(body) else {
            return Usage { prompt_tokens: summary.prompt_tokens(), ..Usage::default() };
        };
        if let Some(usage) = value.get("usage") {
            return Usage {
                prompt_tokens: read_u32(usage, "input_tokens")
                    .unwrap_or_else(|| summary.prompt_tokens()),
                completion_tokens: read_u32(usage, "output_tokens").unwrap_or(0),
                cache_read_tokens: read_u32(usage, "cache_read_input_tokens"),
                cache_write_tokens: read_u32(usage, "cache_creation_input_tokens"),
            };
        }
        // legacy /v1/complete: no counts anywhere, estimate from the text
        let completion = value.get("completion").and_then(|v| v.as_str()).unwrap_or_default();
        Usage {
            prompt_tokens: summary.prompt_tokens(),
            completion_tokens: heuristic_tokens(completion.chars().count()),
            cache_read_tokens: None,
            cache_write_tokens: None,
        }
    }
}

fn read_u32(value: &Value, field: &str) -> Option<u32> {
    value.get(field).and_then(|v| v.as_u64()).map(|v| v as u32)
}

fn heuristic_tokens(chars: usize) -> u32 {
    (chars as u32).div_ceil(4)
}

/// Accumulates across both stream dialects: `completion` deltas from
/// `/v1/complete`, and `message_start` / `content_block_delta` /
/// `message_delta` from `/v1/messages`.
#[derive(Default)]
struct AnthropicAccumulator {
    completion_chars: usize,
    input_tokens: Option<u32>,
    output_tokens: Option<u32>,
    cache_read_tokens: Option<u32>,
    cache_write_tokens: Option<u32>,
}

impl UsageAccumulator for AnthropicAccumulator {
    fn observe(&mut self, event_data: &str) {
        if event_data == "[DONE]" {
            return;
        }
        let Ok(value) = serde_json::from_str::<Value>(event_data) else {
            return;
        };
        if let Some(completion) = value.get("completion").and_then(|v| v.as_str()) {
            self.completion_chars += completion.chars().count();
        }
        if let Some(text) = value
            .pointer("/delta/text")
            .and_then(|v| v.as_str())
        {
            self.completion_chars += text.chars().count();
        }
        if let Some(usage) = value.pointer("/message/usage") {
            self.input_tokens = read_u32(usage, "input_tokens").or(self.input_tokens);
            self.cache_read_tokens =
                read_u32(usage, "cache_read_input_tokens").or(self.cache_read_tokens);
            self.cache_write_tokens =
                read_u32(usage, "cache_creation_input_tokens").or(self.cache_write_tokens);
        }
        if let Some(usage) = value.get("usage") {
            // message_delta carries cumulative output_tokens
            if let Some(output) = read_u32(usage, "output_tokens") {
                self.output_tokens = Some(output);
            }
            self.input_tokens = read_u32(usage, "input_tokens").or(self.input_tokens);
        }
    }

    fn finish(&mut self, summary: &PromptSummary) -> Usage {
        Usage {
            prompt_tokens: self.input_tokens.unwrap_or_else(|| summary.prompt_tokens()),
            completion_tokens: self
                .output_tokens
                .unwrap_or_else(|| heuristic_tokens(self.completion_chars)),
            cache_read_tokens: self.cache_read_tokens,
            cache_write_tokens: self.cache_write_tokens,
        }
    }
}
