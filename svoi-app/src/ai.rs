//! AI-generated replies.

use crate::metrics;
use anyhow::Context;
use async_trait::async_trait;
use lazy_static::lazy_static;
use regex::Regex;
use std::time::Instant;
use svoi_channels::Sender;
use svoi_llm::{ChatMessage, LlmClient};
use tokio_util::sync::CancellationToken;

#[async_trait]
pub trait AiResponder: Send + Sync {
    /// Produce a reply to `prompt` written by `sender`. Empty output is an
    /// error; cancellation aborts the request.
    async fn generate(
        &self,
        prompt: &str,
        sender: &Sender,
        cancel: &CancellationToken,
    ) -> anyhow::Result<String>;
}

pub struct LlmResponder {
    client: LlmClient,
    system_prompt: String,
}

impl LlmResponder {
    pub fn new(client: LlmClient, system_prompt: impl Into<String>) -> Self {
        Self {
            client,
            system_prompt: system_prompt.into(),
        }
    }
}

lazy_static! {
    static ref GO_TEMPLATE_FIELD: Regex =
        Regex::new(r"\{\{\s*\.(Username|FirstName|LastName)\s*\}\}").expect("valid regex");
}

/// Substitute sender fields. Both `{username}` style and Go template style
/// (`{{.Username}}`, `{{.FirstName}}`, `{{.LastName}}`) placeholders work, so
/// prompts written for the previous deployment need no edits.
pub fn render_system_prompt(template: &str, sender: &Sender) -> String {
    let username = sender.username.as_deref().unwrap_or_default();
    let last_name = sender.last_name.as_deref().unwrap_or_default();
    let rendered = GO_TEMPLATE_FIELD.replace_all(template, |caps: &regex::Captures<'_>| {
        match &caps[1] {
            "Username" => username,
            "FirstName" => sender.first_name.as_str(),
            _ => last_name,
        }
        .to_string()
    });
    rendered
        .replace("{username}", username)
        .replace("{first_name}", &sender.first_name)
        .replace("{last_name}", last_name)
}

#[async_trait]
impl AiResponder for LlmResponder {
    #[tracing::instrument(level = "info", skip_all, fields(sender_id = %sender.id, model = %self.client.model()))]
    async fn generate(
        &self,
        prompt: &str,
        sender: &Sender,
        cancel: &CancellationToken,
    ) -> anyhow::Result<String> {
        let system = render_system_prompt(&self.system_prompt, sender);
        tracing::debug!(system_prompt = %system, "rendered system prompt");
        let messages = [ChatMessage::system(system), ChatMessage::user(prompt)];

        let started = Instant::now();
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(anyhow::anyhow!("ai generation cancelled")),
            res = self.client.chat(&messages) => res.context("ai chat completion"),
        };
        metrics::record_ai_generation(result.is_ok(), started.elapsed());

        let response = result?;
        metrics::record_ai_tokens(
            &response.model,
            response.usage.prompt_tokens,
            response.usage.completion_tokens,
            response.usage.total_tokens,
        );
        tracing::debug!(
            used_model = %response.model,
            prompt_tokens = response.usage.prompt_tokens,
            completion_tokens = response.usage.completion_tokens,
            "ai response received"
        );
        Ok(response.content)
    }
}
