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

pub const PROVIDER_NAME: &str = "openai";

const DEFAULT_API_BASE: &str = "https://api.openai.com";

pub struct OpenAiAdapter {
    api_base: String,
    access_token: String,
    allowed_models: Vec<String>,
    flagging: FlaggingConfig,
}

impl OpenAiAdapter {
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

impl Provider for OpenAiAdapter {
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
        AuthStyle::Bearer
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
        let mut value = parse_body(body, request_id)?;
        let model = required_str(&value, "model", request_id)?;
        let stream = value.get("stream").and_then(|v| v.as_bool()).unwrap_or(false);
        let max_response_tokens =
            value.get("max_tokens").and_then(|v| v.as_u64()).unwrap_or(0) as u32;

        let chat = value.get("messages").is_some();
        let (prompt, feature, endpoint) = if chat {
            // ask for the final usage chunk on streams
            if stream && value.get("stream_options").is_none() {
                value["stream_options"] = serde_json::json!({ "include_usage": true });
            }
            (
                concat_message_text(&value),
                Feature::ChatCompletions,
                format!("{}/v1/chat/completions", self.api_base),
            )
        } else {
            // prompt-style completions serve autocomplete traffic
            let prompt = value
                .get("prompt")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            (prompt, Feature::CodeCompletions, format!("{}/v1/completions", self.api_base))
        };

        Ok(ParsedRequest {
            upstream_model: model.clone(),
            model,
            feature,
            stream,
            summary: PromptSummary { prompt, max_response_tokens, native_prompt_tokens: None },
            body: value,
            endpoint,
        })
    }

    fn accumulator(&self) -> Box<dyn UsageAccumulator> {
        Box::new(OpenAiAccumulator::default())
    }

    fn unary_usage(&self, body: &[u8], summary: &PromptSummary) -> Usage {
        openai_shaped_unary_usage(body, summary)
    }
}

/// Shared by the OpenAI and Fireworks adapters; both speak the same response
/// schema.
pub(super) fn openai_shaped_unary_usage(body: &[u8], summary: &PromptSummary) -> Usage {
    let Ok(value) = serde_json::from_slice::<Value>(body) else {
        return Usage { prompt_tokens: summary.prompt_tokens(), ..Usage::default() };
    };
    if let Some(usage) = value.get("usage") {
        let prompt = usage.get("prompt_tokens").and_then(|v| v.as_u64()).map(|v| v as u32);
        let completion =
            usage.get("completion_tokens").and_then(|v| v.as_u64()).map(|v| v as u32);
        if prompt.is_some() || completion.is_some() {
            return Usage {
                prompt_tokens: prompt.unwrap_or_else(|| summary.prompt_tokens()),
                completion_tokens: completion.unwrap_or(0),
                cache_read_tokens: None,
                cache_write_tokens: None,
            };
        }
    }
    let text = value
        .pointer("/choices/0/message/content")
        .or_else(|| value.pointer("/choices/0/text"))
        .and_then(|v| v.as_str())
        .unwrap_or_default();
    Usage {
        prompt_tokens: summary.prompt_tokens(),
        completion_tokens: (text.chars().count() as u32).div_ceil(4),
        cache_read_tokens: None,
        cache_write_tokens: None,
    }
}

/// Sums streamed content deltas and picks up the final `usage` chunk when the
/// upstream includes one.
#[derive(Default)]
pub(super) struct OpenAiAccumulator {
    completion_chars: usize,
    prompt_tokens: Option<u32>,
    completion_tokens: Option<u32>,
}

impl UsageAccumulator for OpenAiAccumulator {
    fn observe(&mut self, event_data: &str) {
        if event_data == "[DONE]" {
            return;
        }
        let Ok(value) = serde_json::from_str::<Value>(event_data) else {
            return;
        };
        if let Some(text) = value
            .pointer("/choices/0/delta/content")
            .or_else(|| value.pointer("/choices/0/text"))
            .and_then(|v| v.as_str())
        {
            self.completion_chars += text.chars().count();
        }
        if let Some(usage) = value.get("usage") {
            if let Some(prompt) = usage.get("prompt_tokens").and_then(|v| v.as_u64()) {
                self.prompt_tokens = Some(prompt as u32);
            }
            if let Some(completion) = usage.get("completion_tokens").and_then(|v| v.as_u64()) {
                self.completion_tokens = Some(completion as u32);
            }
        }
    }

    fn finish(&mut self, summary: &PromptSummary) -> Usage {
        Usage {
            prompt_tokens: self.prompt_tokens.unwrap_or_else(|| summary.prompt_tokens()),
            completion_tokens: self
                .completion_tokens
                .unwrap_or((self.completion_chars as u32).div_ceil(4)),
            cache_read_tokens: None,
            cache_write_tokens: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn adapter() -> OpenAiAdapter {
        OpenAiAdapter {
            api_base: DEFAULT_API_BASE.into(),
            access_token: "sk-test".into(),
            allowed_models: vec!["gpt-4".into()],
            flagging: FlaggingConfig::default(),
        }
    }

    #[test]
    fn chat_requests_get_usage_chunks_injected() {
        let body = serde_json::json!({
            "model": "gpt-4",
            "messages": [{"role": "user", "content": "hello"}],
            "max_tokens": 64,
            "stream": true,
        });
        let parsed = adapter()
            .parse(body.to_string().as_bytes(), "actor-1", Uuid::new_v4())
            .unwrap();
        assert_eq!(parsed.feature, Feature::ChatCompletions);
        assert!(parsed.endpoint.ends_with("/v1/chat/completions"));
        assert_eq!(
            parsed.body.pointer("/stream_options/include_usage"),
            Some(&Value::Bool(true))
        );
    }

    #[test]
    fn prompt_style_maps_to_code_completions() {
        let body = serde_json::json!({
            "model": "gpt-3.5-turbo-instruct",
            "prompt": "def add(a, b):",
            "max_tokens": 32,
        });
        let parsed = adapter()
            .parse(body.to_string().as_bytes(), "actor-1", Uuid::new_v4())
            .unwrap();
        assert_eq!(parsed.feature, Feature::CodeCompletions);
        assert!(parsed.endpoint.ends_with("/v1/completions"));
        assert_eq!(parsed.summary.prompt, "def add(a, b):");
    }

    #[test]
    fn stream_usage_chunk_wins_over_heuristic() {
        let mut acc = OpenAiAccumulator::default();
        acc.observe(r#"{"choices":[{"delta":{"content":"a very long answer indeed"}}]}"#);
        acc.observe(r#"{"choices":[],"usage":{"prompt_tokens":7,"completion_tokens":3}}"#);
        acc.observe("[DONE]");
        let summary = PromptSummary {
            prompt: "q".into(),
            max_response_tokens: 64,
            native_prompt_tokens: None,
        };
        let usage = acc.finish(&summary);
        assert_eq!(usage.prompt_tokens, 7);
        assert_eq!(usage.completion_tokens, 3);
    }

    #[test]
    fn unary_usage_reads_native_counts() {
        let body = serde_json::json!({
            "choices": [{"message": {"content": "hi"}}],
            "usage": {"prompt_tokens": 11, "completion_tokens": 2},
        });
        let summary = PromptSummary {
            prompt: "hello".into(),
            max_response_tokens: 64,
            native_prompt_tokens: None,
        };
        let usage = adapter().unary_usage(body.to_string().as_bytes(), &summary);
        assert_eq!(usage.prompt_tokens, 11);
        assert_eq!(usage.completion_tokens, 2);
    }
}
