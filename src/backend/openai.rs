//! OpenAI-compatible API backend
//!
//! Implements InferenceBackend by making HTTP calls to any OpenAI-compatible
//! API endpoint (OpenAI, Ollama, vLLM, LM Studio, etc.).

use async_trait::async_trait;
use parking_lot::RwLock;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::OpenAiSettings;
use crate::error::{Error, Result};
use crate::types::{ChatMessage, ChatResponse, ChatRole, TokenUsage};

use super::{BackendHealth, InferenceBackend};

// ─────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────

/// Configuration for OpenAI-compatible API backend
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenAiConfig {
    /// API base URL (e.g., "https://api.openai.com/v1", "http://localhost:11434/v1")
    pub base_url: String,

    /// API key (empty string for local servers like Ollama)
    pub api_key: String,

    /// Model used when a request names none
    pub default_model: String,

    /// Request timeout in seconds
    pub timeout_secs: u64,

    /// Maximum retries on transient errors
    pub max_retries: u32,
}

impl Default for OpenAiConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:11434/v1".to_string(),
            api_key: String::new(),
            default_model: "llama3".to_string(),
            timeout_secs: 120,
            max_retries: 2,
        }
    }
}

impl From<&OpenAiSettings> for OpenAiConfig {
    fn from(settings: &OpenAiSettings) -> Self {
        Self {
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            api_key: settings.api_key.clone(),
            default_model: settings.default_model.clone(),
            timeout_secs: settings.timeout_secs,
            max_retries: settings.max_retries,
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// OpenAI API types (request/response)
// ─────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
    usage: Option<ApiUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
    total_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct ModelsResponse {
    data: Vec<ModelEntry>,
}

#[derive(Debug, Deserialize)]
struct ModelEntry {
    id: String,
}

// ─────────────────────────────────────────────────────────────────
// OpenAI Backend
// ─────────────────────────────────────────────────────────────────

/// OpenAI-compatible API backend for inference
pub struct OpenAiBackend {
    config: OpenAiConfig,
    client: Client,
    total_requests: RwLock<u64>,
    total_tokens: RwLock<u64>,
}

impl OpenAiBackend {
    /// Create a new OpenAI backend with the given configuration
    pub fn new(config: OpenAiConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        info!(
            base_url = %config.base_url,
            model = %config.default_model,
            "OpenAI-compatible backend created"
        );

        Ok(Self {
            config,
            client,
            total_requests: RwLock::new(0),
            total_tokens: RwLock::new(0),
        })
    }

    pub fn config(&self) -> &OpenAiConfig {
        &self.config
    }

    /// (requests, tokens) served so far
    pub fn totals(&self) -> (u64, u64) {
        (*self.total_requests.read(), *self.total_tokens.read())
    }

    /// Build the authorization header value (if API key is set)
    fn auth_header(&self) -> Option<String> {
        if self.config.api_key.is_empty() {
            None
        } else {
            Some(format!("Bearer {}", self.config.api_key))
        }
    }

    fn resolve_model<'a>(&'a self, model_id: &'a str) -> &'a str {
        if model_id.is_empty() {
            &self.config.default_model
        } else {
            model_id
        }
    }

    /// Make a chat completion request with retry logic
    async fn chat_completion(&self, model: &str, messages: &[ChatMessage]) -> Result<ChatResponse> {
        let request_body = ChatCompletionRequest { model, messages };
        let url = format!("{}/chat/completions", self.config.base_url);
        let mut last_error: Option<Error> = None;

        for attempt in 0..=self.config.max_retries {
            if attempt > 0 {
                let backoff = Duration::from_millis(500 * 2u64.pow(attempt - 1));
                debug!(attempt, ?backoff, "Retrying after error");
                tokio::time::sleep(backoff).await;
            }

            let mut req = self.client.post(&url).json(&request_body);
            if let Some(ref auth) = self.auth_header() {
                req = req.header("Authorization", auth);
            }

            match req.send().await {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        match response.json::<ChatCompletionResponse>().await {
                            Ok(parsed) => return self.finish(parsed),
                            Err(e) => {
                                last_error = Some(Error::Execution(format!(
                                    "Failed to parse API response: {}",
                                    e
                                )));
                            }
                        }
                    } else if status.as_u16() == 429 || status.is_server_error() {
                        let body = response.text().await.unwrap_or_default();
                        warn!(status = %status, attempt, "Retryable API error: {}", body);
                        last_error = Some(Error::Execution(format!("API error {}: {}", status, body)));
                    } else {
                        let body = response.text().await.unwrap_or_default();
                        return Err(Error::Execution(format!("API error {}: {}", status, body)));
                    }
                }
                Err(e) => {
                    if e.is_timeout() || e.is_connect() {
                        warn!(attempt, error = %e, "Retryable connection error");
                        last_error = Some(Error::Execution(format!("Connection error: {}", e)));
                    } else {
                        return Err(Error::Execution(format!("Request error: {}", e)));
                    }
                }
            }
        }

        Err(last_error
            .unwrap_or_else(|| Error::Execution("All retry attempts exhausted".to_string())))
    }

    fn finish(&self, parsed: ChatCompletionResponse) -> Result<ChatResponse> {
        *self.total_requests.write() += 1;

        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| Error::Execution("No choices in API response".to_string()))?;

        let usage = match parsed.usage {
            Some(u) => {
                *self.total_tokens.write() += u.total_tokens as u64;
                TokenUsage {
                    prompt_tokens: u.prompt_tokens,
                    completion_tokens: u.completion_tokens,
                    total_tokens: u.total_tokens,
                }
            }
            None => TokenUsage::default(),
        };

        Ok(ChatResponse {
            message: ChatMessage {
                role: ChatRole::Assistant,
                content: choice.message.content.unwrap_or_default(),
            },
            usage,
        })
    }
}

#[async_trait]
impl InferenceBackend for OpenAiBackend {
    fn name(&self) -> &'static str {
        "openai"
    }

    async fn chat(&self, model_id: &str, messages: Vec<ChatMessage>) -> Result<ChatResponse> {
        let model = self.resolve_model(model_id);
        debug!(model = %model, turns = messages.len(), "Chat completion");
        self.chat_completion(model, &messages).await
    }

    async fn list_models(&self) -> Result<Vec<String>> {
        let url = format!("{}/models", self.config.base_url);
        let mut req = self.client.get(&url);
        if let Some(ref auth) = self.auth_header() {
            req = req.header("Authorization", auth);
        }

        let response = req.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::Execution(format!("API returned status {}", status)));
        }

        let parsed: ModelsResponse = response.json().await?;
        Ok(parsed.data.into_iter().map(|m| m.id).collect())
    }

    async fn health_check(&self) -> Result<BackendHealth> {
        match self.list_models().await {
            Ok(models) => Ok(BackendHealth {
                operational: true,
                models,
                error: None,
            }),
            Err(e) => Ok(BackendHealth::unavailable(e.to_string())),
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────
