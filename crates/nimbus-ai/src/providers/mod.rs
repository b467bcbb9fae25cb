//! Chat completion backends

pub mod openai;

use crate::{CompletionRequest, Error, ModelConfig, Result, TokenStream, stream::collect_completion};
use async_trait::async_trait;

/// Trait for chat completion backends
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Stream a completion as text deltas
    async fn stream(&self, model: &ModelConfig, request: &CompletionRequest)
    -> Result<TokenStream>;

    /// Fetch a whole completion in one piece
    async fn complete(&self, model: &ModelConfig, request: &CompletionRequest) -> Result<String> {
        let tokens = self.stream(model, request).await?;
        collect_completion(tokens, None).await
    }
}

/// Get an API key from a provided value or the environment
pub fn get_api_key(provided: Option<&str>, env_var: &str) -> Result<String> {
    if let Some(key) = provided.filter(|k| !k.trim().is_empty()) {
        return Ok(key.to_string());
    }

    match std::env::var(env_var) {
        Ok(key) if !key.trim().is_empty() => Ok(key),
        _ => Err(Error::InvalidApiKey),
    }
}
