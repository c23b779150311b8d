//! LLM provider abstraction and the OpenAI-compatible chat client

use async_trait::async_trait;
use regex::Regex;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::OnceLock;
use std::time::Duration;
use tracing::{debug, error};

use crate::config::CompanionConfig;
use crate::{CoreError, Result};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Message role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: Role::System, content: content.into() }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self { role: Role::User, content: content.into() }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: Role::Assistant, content: content.into() }
    }
}

/// Per-call sampling settings
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionOptions {
    /// Overrides the provider's default model
    pub model: Option<String>,
    pub temperature: f32,
    pub max_tokens: u32,
}

impl CompletionOptions {
    pub fn new(temperature: f32, max_tokens: u32) -> Self {
        Self { model: None, temperature, max_tokens }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }
}

/// Trait for LLM providers
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Send a conversation and get the reply text
    async fn complete(&self, messages: &[ChatMessage], options: &CompletionOptions)
        -> Result<String>;

    /// Get the provider name
    fn name(&self) -> &str;

    /// Get the default model
    fn model(&self) -> &str;
}

/// Chat client for any OpenAI-compatible `/chat/completions` endpoint
pub struct ChatClient {
    http: reqwest::Client,
    api_url: String,
    api_key: SecretString,
    model: String,
}

impl ChatClient {
    pub fn new(api_key: SecretString, api_url: impl Into<String>, model: impl Into<String>) -> Result<Self> {
        let http = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            http,
            api_url: api_url.into(),
            api_key,
            model: model.into(),
        })
    }

    pub fn from_config(config: &CompanionConfig) -> Result<Self> {
        let key = config
            .api_key
            .as_ref()
            .filter(|_| config.has_api_key())
            .ok_or_else(|| {
                CoreError::Config(
                    "No API key. Set COMPANION_API_KEY (or GROQ_API_KEY) or run `companion key set`"
                        .to_string(),
                )
            })?;
        Self::new(
            SecretString::new(key.expose_secret().clone()),
            config.api_url.clone(),
            config.chat_model.clone(),
        )
    }
}

#[async_trait]
impl LlmProvider for ChatClient {
    async fn complete(
        &self,
        messages: &[ChatMessage],
        options: &CompletionOptions,
    ) -> Result<String> {
        let model = options.model.as_deref().unwrap_or(&self.model);
        debug!(model, messages = messages.len(), "Sending chat completion");

        let resp = self
            .http
            .post(&self.api_url)
            .header("Authorization", format!("Bearer {}", self.api_key.expose_secret()))
            .header("Content-Type", "application/json")
            .json(&serde_json::json!({
                "model": model,
                "messages": messages,
                "temperature": options.temperature,
                "max_tokens": options.max_tokens,
                "stream": false,
            }))
            .send()
            .await?;

        let status = resp.status();
        let json: Value = resp.json().await?;
        if !status.is_success() && json.get("error").is_none() {
            error!(%status, "Chat completion failed");
            return Err(CoreError::Llm(format!("API returned HTTP {}", status)));
        }
        parse_completion(&json)
    }

    fn name(&self) -> &str {
        "openai-compatible"
    }

    fn model(&self) -> &str {
        &self.model
    }
}

/// Pull the reply text out of a chat completion response body
pub fn parse_completion(json: &Value) -> Result<String> {
    if let Some(err) = json.get("error") {
        let msg = err["message"]
            .as_str()
            .or_else(|| err.as_str())
            .unwrap_or("Unknown API error");
        error!(message = msg, "API error response");
        return Err(CoreError::Llm(msg.to_string()));
    }

    let content = json["choices"][0]["message"]["content"]
        .as_str()
        .ok_or_else(|| CoreError::Llm("Response has no message content".to_string()))?;
    Ok(strip_reasoning(content))
}

static THINK_RE: OnceLock<Regex> = OnceLock::new();

/// Remove `<think>…</think>` blocks that reasoning models prepend to replies.
/// An unterminated block swallows the rest of the text.
pub fn strip_reasoning(text: &str) -> String {
    let re = THINK_RE
        .get_or_init(|| Regex::new(r"(?s)<think>.*?</think>").expect("think pattern is valid"));
    let without = re.replace_all(text, "");
    let visible = match without.find("<think>") {
        Some(idx) => &without[..idx],
        None => &without,
    };
    visible.trim().to_string()
}
