//! Mock backend for testing
//!
//! Provides a mock implementation of InferenceBackend for unit testing.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::types::{ChatMessage, ChatResponse, TokenUsage};

use super::{BackendHealth, InferenceBackend};

// ─────────────────────────────────────────────────────────────────
// Mock Backend Configuration
// ─────────────────────────────────────────────────────────────────

/// Configuration for mock backend behavior
#[derive(Debug, Clone)]
pub struct MockConfig {
    /// Simulated latency per chat call (ms)
    pub latency_ms: u64,

    /// Fail every chat call
    pub fail_chat: bool,

    /// Never return from chat
    pub hang: bool,

    /// Fixed response text; otherwise the last user turn is echoed
    pub fixed_response: Option<String>,

    /// Models reported by `list_models`
    pub models: Vec<String>,
}

impl Default for MockConfig {
    fn default() -> Self {
        Self {
            latency_ms: 0,
            fail_chat: false,
            hang: false,
            fixed_response: None,
            models: vec!["mock-model".to_string()],
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Mock Backend
// ─────────────────────────────────────────────────────────────────

/// Mock implementation of InferenceBackend for testing
pub struct MockBackend {
    config: MockConfig,
    call_counts: RwLock<CallCounts>,
}

/// Track method call counts for verification
#[derive(Debug, Default)]
struct CallCounts {
    chat: u32,
    list_models: u32,
    health_check: u32,
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MockBackend {
    /// Create a new mock backend with default configuration
    pub fn new() -> Self {
        Self::with_config(MockConfig::default())
    }

    /// Create a new mock backend with custom configuration
    pub fn with_config(config: MockConfig) -> Self {
        Self {
            config,
            call_counts: RwLock::new(CallCounts::default()),
        }
    }

    /// Get the number of times a method was called
    pub fn call_count(&self, method: &str) -> u32 {
        let counts = self.call_counts.read();
        match method {
            "chat" => counts.chat,
            "list_models" => counts.list_models,
            "health_check" => counts.health_check,
            _ => 0,
        }
    }

    /// Reset all call counts
    pub fn reset_counts(&self) {
        *self.call_counts.write() = CallCounts::default();
    }

    fn reply_for(&self, model_id: &str, messages: &[ChatMessage]) -> String {
        if let Some(ref fixed) = self.config.fixed_response {
            return fixed.clone();
        }
        let last = messages.last().map(|m| m.content.as_str()).unwrap_or("");
        format!("[{}] {}", model_id, last)
    }
}

#[async_trait]
impl InferenceBackend for MockBackend {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn chat(&self, model_id: &str, messages: Vec<ChatMessage>) -> Result<ChatResponse> {
        self.call_counts.write().chat += 1;

        if self.config.hang {
            std::future::pending::<()>().await;
        }
        if self.config.latency_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.config.latency_ms)).await;
        }
        if self.config.fail_chat {
            return Err(Error::Execution("Mock chat failure".to_string()));
        }

        let content = self.reply_for(model_id, &messages);
        let prompt_tokens: u32 = messages
            .iter()
            .map(|m| m.content.split_whitespace().count() as u32)
            .sum();
        let completion_tokens = content.split_whitespace().count() as u32;

        Ok(ChatResponse {
            message: ChatMessage::assistant(content),
            usage: TokenUsage {
                prompt_tokens,
                completion_tokens,
                total_tokens: prompt_tokens + completion_tokens,
            },
        })
    }

    async fn list_models(&self) -> Result<Vec<String>> {
        self.call_counts.write().list_models += 1;
        Ok(self.config.models.clone())
    }

    async fn health_check(&self) -> Result<BackendHealth> {
        self.call_counts.write().health_check += 1;
        Ok(BackendHealth {
            operational: !self.config.fail_chat,
            models: self.config.models.clone(),
            error: self.config.fail_chat.then(|| "configured to fail".to_string()),
        })
    }
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────
