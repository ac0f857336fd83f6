use crate::error::{LlmError, Result};
use crate::openai::OpenAiClient;
use crate::types::{ChatMessage, ChatResponse};
use std::time::Duration;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Full chat-completions URL, e.g. `https://openrouter.ai/api/v1/chat/completions`.
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    /// Sent as the OpenRouter `models` list; ignored by plain OpenAI.
    pub fallback_models: Vec<String>,
    pub timeout: Option<Duration>,
}

#[derive(Clone)]
pub struct LlmClient {
    inner: OpenAiClient,
    model: String,
}

impl LlmClient {
    #[tracing::instrument(level = "debug", skip_all)]
    pub fn new(config: ClientConfig) -> Result<Self> {
        if config.base_url.trim().is_empty() {
            return Err(LlmError::InvalidInput("base_url is required".to_string()));
        }
        if config.model.trim().is_empty() {
            return Err(LlmError::InvalidInput("model is required".to_string()));
        }

        let http = reqwest::Client::builder()
            .timeout(config.timeout.unwrap_or(DEFAULT_TIMEOUT))
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!(%e, "reqwest client build failed; falling back to default client");
                reqwest::Client::new()
            });

        Ok(Self {
            inner: OpenAiClient::new(
                http,
                &config.base_url,
                &config.api_key,
                &config.model,
                config.fallback_models,
            ),
            model: config.model,
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    #[tracing::instrument(level = "info", skip_all, fields(model = %self.model))]
    pub async fn chat(&self, messages: &[ChatMessage]) -> Result<ChatResponse> {
        if messages.is_empty() {
            return Err(LlmError::InvalidInput("messages must not be empty".to_string()));
        }
        self.inner.chat(messages).await
    }
}
