//! Text generation provider abstraction.
//!
//! The [`Generator`] trait is the contract the answering path depends on:
//! build provider-shaped chat messages, trim input text to the configured
//! budget, and turn a prompt plus chat history into an answer.
//!
//! | Config Value | Provider | Endpoint |
//! |-------------|----------|----------|
//! | `"disabled"` | [`DisabledGenerator`] | none, every call fails |
//! | `"openai"` | [`OpenAIGenerator`] | `POST {url}/chat/completions` |
//! | `"cohere"` | [`CohereGenerator`] | `POST {url}/chat` (v2) |
//!
//! HTTP providers share the embedding module's retry policy.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::config::GenerationConfig;
use crate::embedding::{api_key_from_env, base_url, http_client, post_json_with_retry};
use crate::error::{RagError, Result};

const OPENAI_DEFAULT_URL: &str = "https://api.openai.com/v1";
const COHERE_DEFAULT_URL: &str = "https://api.cohere.com/v2";

/// Author of a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

/// Capability contract for generation providers.
#[async_trait]
pub trait Generator: Send + Sync {
    fn model_name(&self) -> &str;

    /// Input budget in characters applied by [`Generator::process_text`].
    fn max_input_chars(&self) -> usize;

    /// Truncate to the input budget, then trim surrounding whitespace.
    fn process_text(&self, text: &str) -> String {
        truncate_chars(text, self.max_input_chars()).trim().to_string()
    }

    fn construct_message(&self, text: &str, role: Role) -> ChatMessage {
        ChatMessage {
            role: role.as_str().to_string(),
            content: text.to_string(),
        }
    }

    /// Generate an answer for `prompt`, sent as a user turn after `history`.
    async fn generate(&self, prompt: &str, history: &[ChatMessage]) -> Result<String>;
}

/// Prefix of `text` holding at most `max` characters.
pub fn truncate_chars(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

// ============ Disabled ============

/// Generator used when `generation.provider = "disabled"`. Answering then
/// always takes the extractive fallback.
pub struct DisabledGenerator {
    max_input_chars: usize,
}

impl DisabledGenerator {
    pub fn new(max_input_chars: usize) -> Self {
        Self { max_input_chars }
    }
}

#[async_trait]
impl Generator for DisabledGenerator {
    fn model_name(&self) -> &str {
        "disabled"
    }
    fn max_input_chars(&self) -> usize {
        self.max_input_chars
    }
    async fn generate(&self, _prompt: &str, _history: &[ChatMessage]) -> Result<String> {
        Err(RagError::provider("Generation provider is disabled"))
    }
}

// ============ OpenAI ============

pub struct OpenAIGenerator {
    model: String,
    url: String,
    api_key: String,
    max_input_chars: usize,
    max_output_tokens: u32,
    temperature: f32,
    client: reqwest::Client,
}

impl OpenAIGenerator {
    pub fn new(config: &GenerationConfig) -> Result<Self> {
        Ok(Self {
            model: generation_model(config)?,
            url: base_url(config.url.as_deref(), OPENAI_DEFAULT_URL),
            api_key: api_key_from_env("OPENAI_API_KEY")?,
            max_input_chars: config.max_input_chars,
            max_output_tokens: config.max_output_tokens,
            temperature: config.temperature,
            client: http_client(config.timeout_secs)?,
        })
    }
}

#[async_trait]
impl Generator for OpenAIGenerator {
    fn model_name(&self) -> &str {
        &self.model
    }
    fn max_input_chars(&self) -> usize {
        self.max_input_chars
    }

    async fn generate(&self, prompt: &str, history: &[ChatMessage]) -> Result<String> {
        let mut messages = history.to_vec();
        messages.push(self.construct_message(prompt, Role::User));

        let body = serde_json::json!({
            "model": self.model,
            "messages": messages,
            "temperature": self.temperature,
            "max_completion_tokens": self.max_output_tokens,
        });
        let json = post_json_with_retry(
            &self.client,
            &format!("{}/chat/completions", self.url),
            &self.api_key,
            &body,
            0,
            "OpenAI",
        )
        .await?;
        parse_openai_chat(&json)
    }
}

fn parse_openai_chat(json: &serde_json::Value) -> Result<String> {
    json.pointer("/choices/0/message/content")
        .and_then(|c| c.as_str())
        .map(str::to_string)
        .ok_or_else(|| RagError::provider("Invalid response from OpenAI: no choices"))
}

// ============ Cohere ============

pub struct CohereGenerator {
    model: String,
    url: String,
    api_key: String,
    max_input_chars: usize,
    max_output_tokens: u32,
    temperature: f32,
    client: reqwest::Client,
}

impl CohereGenerator {
    pub fn new(config: &GenerationConfig) -> Result<Self> {
        Ok(Self {
            model: generation_model(config)?,
            url: base_url(config.url.as_deref(), COHERE_DEFAULT_URL),
            api_key: api_key_from_env("COHERE_API_KEY")?,
            max_input_chars: config.max_input_chars,
            max_output_tokens: config.max_output_tokens,
            temperature: config.temperature,
            client: http_client(config.timeout_secs)?,
        })
    }
}

#[async_trait]
impl Generator for CohereGenerator {
    fn model_name(&self) -> &str {
        &self.model
    }
    fn max_input_chars(&self) -> usize {
        self.max_input_chars
    }

    async fn generate(&self, prompt: &str, history: &[ChatMessage]) -> Result<String> {
        let mut messages = history.to_vec();
        messages.push(self.construct_message(&self.process_text(prompt), Role::User));

        let body = serde_json::json!({
            "model": self.model,
            "messages": messages,
            "temperature": self.temperature,
            "max_tokens": self.max_output_tokens,
        });
        let json = post_json_with_retry(
            &self.client,
            &format!("{}/chat", self.url),
            &self.api_key,
            &body,
            0,
            "Cohere",
        )
        .await?;
        parse_cohere_chat(&json)
    }
}

/// v2 responses carry `message.content[0].text`; older ones a top-level `text`.
fn parse_cohere_chat(json: &serde_json::Value) -> Result<String> {
    json.pointer("/message/content/0/text")
        .or_else(|| json.get("text"))
        .and_then(|t| t.as_str())
        .map(str::to_string)
        .ok_or_else(|| RagError::provider("Unexpected response shape from Cohere chat"))
}

fn generation_model(config: &GenerationConfig) -> Result<String> {
    config.model.clone().ok_or_else(|| {
        RagError::config(format!(
            "generation.model required for {} provider",
            config.provider
        ))
    })
}

/// Create the [`Generator`] named by `config.provider`.
pub fn create_generator(config: &GenerationConfig) -> Result<Arc<dyn Generator>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledGenerator::new(config.max_input_chars))),
        "openai" => Ok(Arc::new(OpenAIGenerator::new(config)?)),
        "cohere" => Ok(Arc::new(CohereGenerator::new(config)?)),
        other => Err(RagError::config(format!(
            "Unknown generation provider: {}",
            other
        ))),
    }
}
