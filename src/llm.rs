//! Chat-completion clients.
//!
//! The conflict detector talks to the model through [`LlmClient`] only.
//! [`OpenAiCompatibleClient`] covers Groq and OpenAI (same wire format,
//! different base URL and key). [`DisabledLlm`] stands in when no provider is
//! configured and fails every call with a dependency error.
//!
//! Every HTTP call is bounded by `llm.timeout_secs`; transient failures are
//! retried with the same backoff policy as the embedding providers.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::json;

use crate::config::LlmConfig;
use crate::embedding::send_with_retry;
use crate::error::KbError;

/// One chat-completion call.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub system: Option<String>,
    pub user: String,
    /// Overrides the client's configured model.
    pub model: Option<String>,
    pub max_tokens: u32,
    pub temperature: f32,
}

impl CompletionRequest {
    pub fn user(prompt: impl Into<String>, max_tokens: u32, temperature: f32) -> Self {
        Self {
            system: None,
            user: prompt.into(),
            model: None,
            max_tokens,
            temperature,
        }
    }
}

/// Model answer plus the token count the backend reported.
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub text: String,
    pub tokens: u32,
}

#[async_trait]
pub trait LlmClient: Send + Sync {
    fn model_name(&self) -> &str;
    fn is_available(&self) -> bool {
        true
    }
    async fn complete(&self, request: &CompletionRequest) -> Result<Completion>;
}

/// Placeholder used when `[llm].provider = "disabled"`.
pub struct DisabledLlm;

#[async_trait]
impl LlmClient for DisabledLlm {
    fn model_name(&self) -> &str {
        "disabled"
    }
    fn is_available(&self) -> bool {
        false
    }
    async fn complete(&self, _request: &CompletionRequest) -> Result<Completion> {
        Err(KbError::llm_unavailable().into())
    }
}

/// Client for `POST {base_url}/chat/completions`.
pub struct OpenAiCompatibleClient {
    label: String,
    model: String,
    endpoint: String,
    api_key: String,
    max_retries: u32,
    client: reqwest::Client,
}

impl OpenAiCompatibleClient {
    /// Fails when the API key variable is unset or empty.
    pub fn new(config: &LlmConfig) -> Result<Self> {
        let key_env = config.key_env();
        let api_key = std::env::var(&key_env)
            .ok()
            .filter(|k| !k.is_empty())
            .ok_or_else(|| {
                KbError::DependencyUnavailable(
                    format!("{} environment variable not set", key_env),
                    format!("export {} or set [llm].provider = \"disabled\"", key_env),
                )
            })?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            label: config.provider.clone(),
            model: config.model.clone(),
            endpoint: format!("{}/chat/completions", config.base_url()),
            api_key,
            max_retries: config.max_retries,
            client,
        })
    }
}

#[async_trait]
impl LlmClient for OpenAiCompatibleClient {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<Completion> {
        let mut messages = Vec::with_capacity(2);
        if let Some(system) = &request.system {
            messages.push(json!({"role": "system", "content": system}));
        }
        messages.push(json!({"role": "user", "content": request.user}));

        let body = json!({
            "model": request.model.as_deref().unwrap_or(&self.model),
            "messages": messages,
            "max_tokens": request.max_tokens,
            "temperature": request.temperature,
        });
        let http = self
            .client
            .post(&self.endpoint)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body);

        let started = std::time::Instant::now();
        let json = send_with_retry(http, self.max_retries, &self.label).await?;
        let completion = parse_chat_response(&json)?;
        tracing::debug!(
            provider = %self.label,
            tokens = completion.tokens,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "chat completion"
        );
        Ok(completion)
    }
}

fn parse_chat_response(json: &serde_json::Value) -> Result<Completion> {
    let text = json
        .pointer("/choices/0/message/content")
        .and_then(|c| c.as_str())
        .ok_or_else(|| KbError::Upstream("chat response has no choices[0].message.content".into()))?
        .trim()
        .to_string();
    let tokens = json
        .pointer("/usage/total_tokens")
        .and_then(|t| t.as_u64())
        .unwrap_or(0) as u32;
    Ok(Completion { text, tokens })
}

/// Build the configured client. Missing credentials fail here, not per call.
pub fn create_llm(config: &LlmConfig) -> Result<Box<dyn LlmClient>> {
    match config.provider.as_str() {
        "disabled" => Ok(Box::new(DisabledLlm)),
        "groq" | "openai" => Ok(Box::new(OpenAiCompatibleClient::new(config)?)),
        other => anyhow::bail!("Unknown llm provider: '{}'", other),
    }
}
