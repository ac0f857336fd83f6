use crate::error::{LlmError, Result};
use crate::types::{ChatMessage, ChatResponse, Role, Usage};
use serde::{Deserialize, Serialize};

#[derive(Clone)]
pub struct OpenAiClient {
    http: reqwest::Client,
    url: String,
    api_key: String,
    model: String,
    fallback_models: Vec<String>,
}

impl OpenAiClient {
    pub fn new(
        http: reqwest::Client,
        url: &str,
        api_key: &str,
        model: &str,
        fallback_models: Vec<String>,
    ) -> Self {
        Self {
            http,
            url: url.to_string(),
            api_key: api_key.to_string(),
            model: model.to_string(),
            fallback_models,
        }
    }

    #[tracing::instrument(level = "info", skip_all)]
    pub async fn chat(&self, messages: &[ChatMessage]) -> Result<ChatResponse> {
        let req = OpenAiChatRequest::new(&self.model, &self.fallback_models, messages);
        tracing::debug!(
            url = %self.url,
            primary_model = %self.model,
            fallback_models = ?self.fallback_models,
            "sending chat completion request"
        );

        let response = self
            .http
            .post(&self.url)
            .bearer_auth(&self.api_key)
            .json(&req)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(LlmError::Http(format!(
                "chat completion status={status} body={}",
                truncate(&body, 1024)
            )));
        }

        let parsed: OpenAiChatResponse = serde_json::from_str(&body)?;
        let resp = ChatResponse::try_from(parsed)?;
        tracing::debug!(used_model = %resp.model, usage = ?resp.usage, "received chat completion");
        Ok(resp)
    }
}

fn truncate(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let mut end = max_bytes;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

#[derive(Debug, Serialize)]
struct OpenAiChatRequest {
    model: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    models: Vec<String>,
    messages: Vec<OpenAiMessage>,
}

impl OpenAiChatRequest {
    fn new(model: &str, fallback_models: &[String], messages: &[ChatMessage]) -> Self {
        Self {
            model: model.to_string(),
            models: fallback_models.to_vec(),
            messages: messages.iter().map(to_openai_message).collect(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct OpenAiMessage {
    role: String,
    #[serde(default)]
    content: Option<String>,
}

fn to_openai_message(m: &ChatMessage) -> OpenAiMessage {
    let role = match m.role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
    };
    OpenAiMessage {
        role: role.to_string(),
        content: Some(m.content.clone()),
    }
}

#[derive(Debug, Deserialize)]
struct OpenAiChatResponse {
    #[serde(default)]
    choices: Vec<OpenAiChoice>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    usage: Option<OpenAiUsage>,
}

#[derive(Debug, Deserialize)]
struct OpenAiChoice {
    message: OpenAiMessage,
}

#[derive(Debug, Deserialize)]
struct OpenAiUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
    #[serde(default)]
    total_tokens: u32,
}

impl TryFrom<OpenAiChatResponse> for ChatResponse {
    type Error = LlmError;

    fn try_from(v: OpenAiChatResponse) -> Result<Self> {
        if v.choices.len() != 1 {
            return Err(LlmError::ResponseFormat(format!(
                "unexpected number of choices: {}",
                v.choices.len()
            )));
        }
        let Some(choice) = v.choices.into_iter().next() else {
            return Err(LlmError::ResponseFormat("missing choice".to_string()));
        };

        let content = choice.message.content.unwrap_or_default();
        let content = content.trim();
        if content.is_empty() {
            return Err(LlmError::ResponseFormat("empty message content".to_string()));
        }

        let usage = v
            .usage
            .map(|u| Usage {
                prompt_tokens: u.prompt_tokens,
                completion_tokens: u.completion_tokens,
                total_tokens: u.total_tokens,
            })
            .unwrap_or_default();

        Ok(ChatResponse {
            content: content.to_string(),
            model: v.model.unwrap_or_else(|| "unknown".to_string()),
            usage,
        })
    }
}
