//! Provider-agnostic LLM client
//!
//! A minimal text-in / text-out adapter used for routing, orchestration
//! analysis, and synthesis. The client takes its full configuration by value
//! and holds no reference to any process-wide registry, so routing can run
//! before any project has been selected.

use crate::config::CoreConfig;
use async_trait::async_trait;
use serde_json::{Value, json};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Default HTTP timeout for a single model call
const CALL_TIMEOUT: Duration = Duration::from_secs(120);

/// Errors from the LLM client
#[derive(Debug, Error)]
pub enum LlmError {
    /// Missing or invalid configuration; raised only at construction
    #[error("LLM configuration error: {field} - {reason}")]
    Config {
        /// Offending field
        field: String,
        /// Why it is invalid
        reason: String,
    },

    /// Network or HTTP transport failure
    #[error("LLM transport error: {source}")]
    Transport {
        /// Source HTTP error
        #[from]
        source: reqwest::Error,
    },

    /// Non-2xx status or malformed response body
    #[error("LLM provider error ({status}): {message}")]
    Provider {
        /// HTTP status code, or 0 for malformed bodies
        status: u16,
        /// Provider-supplied detail
        message: String,
    },
}

/// Supported providers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provider {
    /// Anthropic messages API
    Anthropic,
    /// OpenAI-compatible chat completions API
    OpenAi,
    /// Ollama generate API
    Ollama,
    /// Argo bridge (OpenAI-compatible, site-local)
    Argo,
}

impl FromStr for Provider {
    type Err = LlmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "anthropic" => Ok(Self::Anthropic),
            "openai" => Ok(Self::OpenAi),
            "ollama" => Ok(Self::Ollama),
            "argo" => Ok(Self::Argo),
            other => Err(LlmError::Config {
                field: "provider".to_string(),
                reason: format!("Unknown provider: {other}"),
            }),
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Anthropic => "anthropic",
            Self::OpenAi => "openai",
            Self::Ollama => "ollama",
            Self::Argo => "argo",
        };
        f.write_str(name)
    }
}

/// Single-call text completion interface
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Sends one prompt and returns the model's text response
    ///
    /// Idempotent per call; no shared state between calls. Implementations
    /// must be safe for concurrent use.
    async fn call(
        &self,
        prompt: &str,
        max_tokens: u32,
        temperature: f64,
    ) -> Result<String, LlmError>;
}

/// HTTP-backed implementation of [`LlmClient`]
#[derive(Debug)]
pub struct HttpLlmClient {
    provider: Provider,
    model_id: String,
    api_key: Option<String>,
    base_url: Option<String>,
    http: reqwest::Client,
}

impl HttpLlmClient {
    /// Creates a client, validating the provider configuration
    ///
    /// # Errors
    /// Returns `LlmError::Config` when the provider is unknown, the model id
    /// is empty, a required API key is missing, or a required base URL is
    /// missing (Ollama and Argo).
    pub fn new(
        provider: &str,
        model_id: &str,
        api_key: Option<String>,
        base_url: Option<String>,
    ) -> Result<Self, LlmError> {
        if provider.trim().is_empty() {
            return Err(LlmError::Config {
                field: "provider".to_string(),
                reason: "Provider is required".to_string(),
            });
        }
        let provider = Provider::from_str(provider)?;

        if model_id.trim().is_empty() {
            return Err(LlmError::Config {
                field: "model_id".to_string(),
                reason: "Model ID is required".to_string(),
            });
        }

        match provider {
            Provider::Ollama if base_url.is_none() => {
                return Err(LlmError::Config {
                    field: "base_url".to_string(),
                    reason: "Base URL required for Ollama".to_string(),
                });
            }
            Provider::Argo if base_url.is_none() => {
                return Err(LlmError::Config {
                    field: "base_url".to_string(),
                    reason: "Base URL required for Argo".to_string(),
                });
            }
            Provider::Anthropic | Provider::OpenAi | Provider::Argo if api_key.is_none() => {
                return Err(LlmError::Config {
                    field: "api_key".to_string(),
                    reason: format!("API key required for {provider}"),
                });
            }
            _ => {}
        }

        let http = reqwest::Client::builder()
            .timeout(CALL_TIMEOUT)
            .build()
            .map_err(|source| LlmError::Transport { source })?;

        Ok(Self {
            provider,
            model_id: model_id.to_string(),
            api_key,
            base_url,
            http,
        })
    }

    /// Creates a client from the `models.classifier` / `api.providers`
    /// sections of a [`CoreConfig`]
    ///
    /// # Errors
    /// Returns `LlmError::Config` when the classifier section is incomplete
    /// or the provider is unknown.
    pub fn from_config(config: &CoreConfig) -> Result<Self, LlmError> {
        let classifier = &config.models.classifier;
        let provider = config.classifier_provider();
        Self::new(
            &classifier.provider,
            &classifier.model_id,
            provider.and_then(|p| p.api_key.clone()),
            provider.and_then(|p| p.base_url.clone()),
        )
    }

    /// The configured provider
    #[must_use]
    pub fn provider(&self) -> Provider {
        self.provider
    }

    /// The configured model id
    #[must_use]
    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    /// The configured base URL, if any
    #[must_use]
    pub fn base_url(&self) -> Option<&str> {
        self.base_url.as_deref()
    }

    fn anthropic_request(&self, prompt: &str, max_tokens: u32, temperature: f64) -> (String, Value) {
        let base = self
            .base_url
            .as_deref()
            .unwrap_or("https://api.anthropic.com");
        let url = format!("{}/v1/messages", base.trim_end_matches('/'));
        let body = json!({
            "model": self.model_id,
            "max_tokens": max_tokens,
            "temperature": temperature,
            "messages": [{"role": "user", "content": prompt}],
        });
        (url, body)
    }

    fn chat_completions_request(
        &self,
        prompt: &str,
        max_tokens: u32,
        temperature: f64,
    ) -> (String, Value) {
        let base = self
            .base_url
            .as_deref()
            .unwrap_or("https://api.openai.com/v1");
        let url = format!("{}/chat/completions", base.trim_end_matches('/'));
        let body = json!({
            "model": self.model_id,
            "max_tokens": max_tokens,
            "temperature": temperature,
            "messages": [{"role": "user", "content": prompt}],
            "stream": false,
        });
        (url, body)
    }

    fn ollama_request(&self, prompt: &str, max_tokens: u32, temperature: f64) -> (String, Value) {
        // base_url presence is validated at construction
        let base = self.base_url.as_deref().unwrap_or_default();
        let url = format!("{}/api/generate", base.trim_end_matches('/'));
        let body = json!({
            "model": self.model_id,
            "prompt": prompt,
            "stream": false,
            "options": {"temperature": temperature, "num_predict": max_tokens},
        });
        (url, body)
    }

    fn extract_text(&self, body: &Value) -> Result<String, LlmError> {
        let text = match self.provider {
            Provider::Anthropic => body
                .get("content")
                .and_then(|c| c.get(0))
                .and_then(|c| c.get("text"))
                .and_then(Value::as_str),
            Provider::OpenAi | Provider::Argo => body
                .get("choices")
                .and_then(|c| c.get(0))
                .and_then(|c| c.get("message"))
                .and_then(|m| m.get("content"))
                .and_then(Value::as_str),
            Provider::Ollama => body.get("response").and_then(Value::as_str),
        };

        text.map(str::to_string).ok_or_else(|| LlmError::Provider {
            status: 0,
            message: format!("Malformed {} response: missing text field", self.provider),
        })
    }
}

#[async_trait]
impl LlmClient for HttpLlmClient {
    async fn call(
        &self,
        prompt: &str,
        max_tokens: u32,
        temperature: f64,
    ) -> Result<String, LlmError> {
        let (url, body) = match self.provider {
            Provider::Anthropic => self.anthropic_request(prompt, max_tokens, temperature),
            Provider::OpenAi | Provider::Argo => {
                self.chat_completions_request(prompt, max_tokens, temperature)
            }
            Provider::Ollama => self.ollama_request(prompt, max_tokens, temperature),
        };

        debug!(provider = %self.provider, model = %self.model_id, "calling LLM");

        let mut request = self.http.post(&url).json(&body);
        match (self.provider, self.api_key.as_deref()) {
            (Provider::Anthropic, Some(key)) => {
                request = request
                    .header("x-api-key", key)
                    .header("anthropic-version", "2023-06-01");
            }
            (_, Some(key)) => {
                request = request.header("Authorization", format!("Bearer {key}"));
            }
            (_, None) => {}
        }

        let response = request
            .send()
            .await
            .map_err(|source| LlmError::Transport { source })?;

        let status = response.status();
        if !status.is_success() {
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(LlmError::Provider {
                status: status.as_u16(),
                message,
            });
        }

        let body: Value = response
            .json()
            .await
            .map_err(|source| LlmError::Transport { source })?;
        self.extract_text(&body)
    }
}
