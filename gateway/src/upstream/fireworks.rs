use super::openai::{openai_shaped_unary_usage, OpenAiAccumulator};
use super::{
    concat_message_text, parse_body, required_str, stable_percent, AuthStyle, ParsedRequest,
    Provider, Usage, UsageAccumulator,
};
use crate::actor::Feature;
use crate::config::ProviderConfig;
use crate::flagging::{FlaggingConfig, PromptSummary};
use common_http_errors::GatewayError;
use uuid::Uuid;

pub const PROVIDER_NAME: &str = "fireworks";

const DEFAULT_API_BASE: &str = "https://api.fireworks.ai";

/// Client-facing virtual model for community Starcoder traffic.
pub const VIRTUAL_STARCODER: &str = "starcoder";
const STARCODER_COMMUNITY: &str = "accounts/fireworks/models/starcoder-16b";
const STARCODER_SINGLE_TENANT: &str = "accounts/sourcegraph/models/starcoder-16b";

/// Fireworks serves the code-completion models; the wire shape is
/// OpenAI-compatible, with virtual-model routing on top.
pub struct FireworksAdapter {
    api_base: String,
    access_token: String,
    allowed_models: Vec<String>,
    flagging: FlaggingConfig,
    /// Percentage of community Starcoder traffic pinned to the
    /// single-tenant deployment.
    starcoder_single_tenant_percent: u8,
}

impl FireworksAdapter {
    pub fn new(config: &ProviderConfig) -> Self {
        Self {
            api_base: config
                .api_base
                .clone()
                .unwrap_or_else(|| DEFAULT_API_BASE.to_string()),
            access_token: config.access_token.clone(),
            allowed_models: config.allowed_models.clone(),
            flagging: config.flagging.clone(),
            starcoder_single_tenant_percent: config.starcoder_single_tenant_percent,
        }
    }

    /// Virtual models resolve deterministically per `(actor, request)`, so a
    /// retried request always lands on the same deployment.
    fn route_model(&self, model: &str, actor_id: &str, request_id: Uuid) -> String {
        if model != VIRTUAL_STARCODER {
            return model.to_string();
        }
        let bucket = stable_percent(actor_id, request_id);
        if bucket < self.starcoder_single_tenant_percent {
            STARCODER_SINGLE_TENANT.to_string()
        } else {
            STARCODER_COMMUNITY.to_string()
        }
    }
}

impl Provider for FireworksAdapter {
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
        actor_id: &str,
        request_id: Uuid,
    ) -> Result<ParsedRequest, GatewayError> {
        let mut value = parse_body(body, request_id)?;
        let model = required_str(&value, "model", request_id)?;
        let stream = value.get("stream").and_then(|v| v.as_bool()).unwrap_or(false);
        let max_response_tokens =
            value.get("max_tokens").and_then(|v| v.as_u64()).unwrap_or(0) as u32;

        let upstream_model = self.route_model(&model, actor_id, request_id);
        value["model"] = serde_json::Value::String(upstream_model.clone());

        let chat = value.get("messages").is_some();
        let (prompt, feature, endpoint) = if chat {
            (
                concat_message_text(&value),
                Feature::ChatCompletions,
                format!("{}/inference/v1/chat/completions", self.api_base),
            )
        } else {
            let prompt = value
                .get("prompt")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            (
                prompt,
                Feature::CodeCompletions,
                format!("{}/inference/v1/completions", self.api_base),
            )
        };

        Ok(ParsedRequest {
            model,
            upstream_model,
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
