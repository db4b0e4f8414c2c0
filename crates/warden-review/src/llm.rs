use std::time::Duration;

use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use warden_core::{LlmConfig, WardenError};

/// A message in a chat conversation with the LLM.
///
/// # Examples
///
/// ```
/// use warden_review::llm::{ChatMessage, Role};
///
/// let msg = ChatMessage::user("Review this diff");
/// assert!(matches!(msg.role, Role::User));
/// ```
#[derive(Debug, Clone, Serialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

/// Role in the chat conversation.
///
/// # Examples
///
/// ```
/// use warden_review::llm::Role;
///
/// assert_eq!(serde_json::to_string(&Role::System).unwrap(), "\"system\"");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// OpenAI-compatible chat completions client.
///
/// Works with any provider that exposes the `/v1/chat/completions` endpoint:
/// OpenAI, Ollama, vLLM, LiteLLM, etc. Requests are bounded by the configured
/// timeout and reported as [`WardenError::GenerationTimeout`] when it expires.
///
/// # Examples
///
/// ```
/// use warden_core::LlmConfig;
/// use warden_review::llm::LlmClient;
///
/// let config = LlmConfig {
///     api_key: Some("test-key".into()),
///     ..LlmConfig::default()
/// };
/// let client = LlmClient::new(&config).unwrap();
/// assert_eq!(client.model(), "gpt-4o-mini");
/// ```
pub struct LlmClient {
    client: reqwest::Client,
    config: LlmConfig,
}

impl LlmClient {
    /// # Errors
    ///
    /// Returns [`WardenError::Config`] if the HTTP client cannot be built.
    pub fn new(config: &LlmConfig) -> Result<Self, WardenError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| WardenError::Config(format!("failed to create HTTP client: {e}")))?;
        Ok(Self {
            client,
            config: config.clone(),
        })
    }

    pub fn model(&self) -> &str {
        &self.config.model
    }

    fn base_url(&self) -> &str {
        match (&self.config.base_url, self.config.provider.as_str()) {
            (Some(url), _) => url.trim_end_matches('/'),
            (None, "ollama") => "http://localhost:11434",
            (None, _) => "https://api.openai.com",
        }
    }

    /// Send a chat completion request and return the text response.
    ///
    /// # Errors
    ///
    /// - [`WardenError::GenerationTimeout`] when the configured timeout expires
    /// - [`WardenError::Rejected`] when the provider refuses the key or request
    /// - [`WardenError::RateLimited`] / [`WardenError::Transient`] for throttling,
    ///   server and network errors, and empty completions
    pub async fn chat(&self, messages: Vec<ChatMessage>) -> Result<String, WardenError> {
        let url = format!("{}/v1/chat/completions", self.base_url());

        let body = serde_json::json!({
            "model": self.config.model,
            "messages": messages,
            "temperature": self.config.temperature,
            "max_tokens": self.config.max_output_tokens,
        });

        let mut request = self.client.post(&url);
        if let Some(api_key) = &self.config.api_key {
            request = request.bearer_auth(api_key);
        }

        let response = request.json(&body).send().await.map_err(|e| {
            if e.is_timeout() {
                WardenError::GenerationTimeout(self.config.timeout())
            } else {
                WardenError::Transient(format!("LLM request failed: {e}"))
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_secs);
            let body_text = response.text().await.unwrap_or_default();
            let message = format!("LLM API error {status}: {}", body_text.trim());
            return Err(match status {
                StatusCode::TOO_MANY_REQUESTS => WardenError::RateLimited {
                    retry_after,
                    message,
                },
                s if s.is_server_error() => WardenError::Transient(message),
                _ => WardenError::Rejected(message),
            });
        }

        let response_body: serde_json::Value = response.json().await.map_err(|e| {
            if e.is_timeout() {
                WardenError::GenerationTimeout(self.config.timeout())
            } else {
                WardenError::Transient(format!("failed to parse LLM response: {e}"))
            }
        })?;

        let content = response_body
            .get("choices")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("message"))
            .and_then(|m| m.get("content"))
            .and_then(|c| c.as_str())
            .unwrap_or_default();

        if content.trim().is_empty() {
            return Err(WardenError::Transient(
                "LLM returned an empty completion".into(),
            ));
        }
        Ok(content.to_string())
    }
}
