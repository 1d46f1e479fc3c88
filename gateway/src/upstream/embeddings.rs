use super::{AuthStyle, Dispatcher, Usage};
use crate::config::EmbeddingsConfig;
use crate::flagging::PromptSummary;
use common_http_errors::GatewayError;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const PROVIDER_NAME: &str = "openai-embeddings";

const DEFAULT_API_BASE: &str = "https://api.openai.com";

#[derive(Debug, Deserialize)]
pub struct EmbeddingsRequest {
    pub model: String,
    pub input: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct Embedding {
    pub index: usize,
    pub data: Vec<f32>,
}

#[derive(Debug, Serialize)]
pub struct EmbeddingsResponse {
    pub embeddings: Vec<Embedding>,
    pub model: String,
    #[serde(rename = "modelDimensions")]
    pub model_dimensions: usize,
}

struct ModelInfo {
    upstream_name: &'static str,
    dimensions: usize,
}

/// Client-facing names are provider-qualified; the upstream call uses the
/// provider's own identifier.
fn model_info(model: &str) -> Option<ModelInfo> {
    match model {
        "openai/text-embedding-ada-002" => {
            Some(ModelInfo { upstream_name: "text-embedding-ada-002", dimensions: 1536 })
        }
        "openai/text-embedding-3-small" => {
            Some(ModelInfo { upstream_name: "text-embedding-3-small", dimensions: 1536 })
        }
        _ => None,
    }
}

pub struct EmbeddingsAdapter {
    api_base: String,
    access_token: String,
    allowed_models: Vec<String>,
    max_batch_size: usize,
}

impl EmbeddingsAdapter {
    pub fn new(config: &EmbeddingsConfig) -> Self {
        Self {
            api_base: config
                .api_base
                .clone()
                .unwrap_or_else(|| DEFAULT_API_BASE.to_string()),
            access_token: config.access_token.clone(),
            allowed_models: config.allowed_models.clone(),
            max_batch_size: config.max_batch_size,
        }
    }

    pub fn allowed_models(&self) -> &[String] {
        &self.allowed_models
    }

    pub fn max_batch_size(&self) -> usize {
        self.max_batch_size
    }

    pub fn parse(
        &self,
        body: &[u8],
        request_id: Uuid,
    ) -> Result<(EmbeddingsRequest, PromptSummary), GatewayError> {
        let request: EmbeddingsRequest =
            serde_json::from_slice(body).map_err(|err| GatewayError::InvalidRequest {
                request_id: Some(request_id),
                code: "invalid_request",
                message: Some(format!("malformed JSON body: {err}")),
            })?;
        if request.input.is_empty() {
            return Err(GatewayError::InvalidRequest {
                request_id: Some(request_id),
                code: "invalid_request",
                message: Some("input must not be empty".into()),
            });
        }
        if request.input.len() > self.max_batch_size {
            return Err(GatewayError::InvalidRequest {
                request_id: Some(request_id),
                code: "batch_too_large",
                message: Some(format!(
                    "at most {} inputs per request, got {}",
                    self.max_batch_size,
                    request.input.len()
                )),
            });
        }
        let summary = PromptSummary {
            prompt: request.input.join("\n"),
            max_response_tokens: 0,
            native_prompt_tokens: None,
        };
        Ok((request, summary))
    }

    pub async fn dispatch(
        &self,
        dispatcher: &Dispatcher,
        request: &EmbeddingsRequest,
        summary: &PromptSummary,
        request_id: Uuid,
    ) -> Result<(EmbeddingsResponse, Usage), GatewayError> {
        let info = model_info(&request.model).ok_or_else(|| GatewayError::ModelNotAllowed {
            request_id: Some(request_id),
            model: request.model.clone(),
        })?;
        let body = serde_json::json!({
            "model": info.upstream_name,
            "input": request.input,
        });
        let url = format!("{}/v1/embeddings", self.api_base);
        let (_, bytes) = dispatcher
            .unary(&url, &self.access_token, AuthStyle::Bearer, &body, request_id)
            .await?;

        #[derive(Deserialize)]
        struct UpstreamEmbedding {
            index: usize,
            embedding: Vec<f32>,
        }
        #[derive(Deserialize)]
        struct UpstreamUsage {
            #[serde(default)]
            prompt_tokens: u32,
        }
        #[derive(Deserialize)]
        struct UpstreamResponse {
            data: Vec<UpstreamEmbedding>,
            #[serde(default)]
            usage: Option<UpstreamUsage>,
        }

        let upstream: UpstreamResponse =
            serde_json::from_slice(&bytes).map_err(|err| GatewayError::UpstreamError {
                request_id: Some(request_id),
                message: Some(format!("decoding embeddings response: {err}")),
            })?;

        let usage = Usage {
            prompt_tokens: upstream
                .usage
                .map(|u| u.prompt_tokens)
                .unwrap_or_else(|| summary.prompt_tokens()),
            completion_tokens: 0,
            cache_read_tokens: None,
            cache_write_tokens: None,
        };
        let mut embeddings: Vec<Embedding> = upstream
            .data
            .into_iter()
            .map(|entry| Embedding { index: entry.index, data: entry.embedding })
            .collect();
        embeddings.sort_by_key(|entry| entry.index);

        Ok((
            EmbeddingsResponse {
                embeddings,
                model: request.model.clone(),
                model_dimensions: info.dimensions,
            },
            usage,
        ))
    }
}
