//! OpenAI Chat Completions API provider

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::LlmProvider;
use crate::{
    error::{Error, Result},
    stream::{TokenStream, token_stream},
    types::{ChatMessage, CompletionRequest, ModelConfig},
};

/// Environment variable holding the API key
pub const API_KEY_ENV_VAR: &str = "OPENAI_API_KEY";

/// OpenAI API client. Works with any backend speaking the Chat Completions
/// protocol (set `ModelConfig::base_url` accordingly).
pub struct OpenAIProvider {
    client: reqwest::Client,
    api_key: String,
}

impl OpenAIProvider {
    /// Create a new OpenAI provider with an API key
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: api_key.into(),
        }
    }

    /// Create from environment variable
    pub fn from_env() -> Result<Self> {
        let api_key = super::get_api_key(None, API_KEY_ENV_VAR)?;
        Ok(Self::new(api_key))
    }

    async fn send(
        &self,
        model: &ModelConfig,
        request: &CompletionRequest,
        stream: bool,
    ) -> Result<reqwest::Response> {
        let body = build_request(model, request, stream);
        let url = format!("{}/chat/completions", model.base_url.trim_end_matches('/'));

        tracing::debug!("POST {} (model: {}, stream: {})", url, model.id, stream);
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let text = response.text().await.unwrap_or_default();
        if status == reqwest::StatusCode::UNAUTHORIZED {
            return Err(Error::InvalidApiKey);
        }
        Err(api_error(status, &text))
    }
}

#[async_trait]
impl LlmProvider for OpenAIProvider {
    async fn stream(
        &self,
        model: &ModelConfig,
        request: &CompletionRequest,
    ) -> Result<TokenStream> {
        let response = self.send(model, request, true).await?;
        Ok(token_stream(response.bytes_stream()))
    }

    async fn complete(&self, model: &ModelConfig, request: &CompletionRequest) -> Result<String> {
        let response = self.send(model, request, false).await?;
        let completion: CompletionResponse = response.json().await?;
        completion
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| Error::UnexpectedResponse("completion has no message content".into()))
    }
}

fn build_request<'a>(
    model: &'a ModelConfig,
    request: &'a CompletionRequest,
    stream: bool,
) -> OpenAIRequest<'a> {
    OpenAIRequest {
        model: &model.id,
        messages: &request.messages,
        stream,
        temperature: model.temperature,
        max_tokens: model.max_tokens,
    }
}

/// Turn an error response body into an `Error::Api`, falling back to the raw text.
fn api_error(status: reqwest::StatusCode, body: &str) -> Error {
    match serde_json::from_str::<ErrorResponse>(body) {
        Ok(parsed) => Error::api(
            parsed
                .error
                .error_type
                .unwrap_or_else(|| status.as_u16().to_string()),
            parsed.error.message,
        ),
        Err(_) => Error::api(status.as_u16().to_string(), body.to_string()),
    }
}

// Request/Response types

#[derive(Debug, Serialize)]
struct OpenAIRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    stream: bool,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    choices: Vec<CompletionChoice>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    message: CompletionMessage,
}

#[derive(Debug, Deserialize)]
struct CompletionMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    message: String,
    #[serde(rename = "type")]
    error_type: Option<String>,
}
