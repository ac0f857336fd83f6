//! Chat-completions client for OpenAI-compatible endpoints (OpenRouter,
//! OpenAI, local gateways).
//!
//! Pure HTTP client, no bot dependency.

mod client;
mod error;
mod openai;
mod types;

pub use client::{ClientConfig, LlmClient};
pub use error::{LlmError, Result};
pub use types::{ChatMessage, ChatResponse, Role, Usage};
