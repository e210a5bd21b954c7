//! Backend trait definitions
//!
//! Defines the InferenceBackend trait that answers peer `chat` requests.

use async_trait::async_trait;
use std::sync::Arc;

use crate::error::Result;
use crate::types::{ChatMessage, ChatResponse};

// ─────────────────────────────────────────────────────────────────
// Backend Health
// ─────────────────────────────────────────────────────────────────

/// Health status of a backend
#[derive(Debug, Clone)]
pub struct BackendHealth {
    /// Whether the backend is operational
    pub operational: bool,

    /// Models the backend reported, if it was reachable
    pub models: Vec<String>,

    /// Any error message
    pub error: Option<String>,
}

impl Default for BackendHealth {
    fn default() -> Self {
        Self {
            operational: true,
            models: Vec::new(),
            error: None,
        }
    }
}

impl BackendHealth {
    pub fn unavailable(error: impl Into<String>) -> Self {
        Self {
            operational: false,
            models: Vec::new(),
            error: Some(error.into()),
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Streaming
// ─────────────────────────────────────────────────────────────────

/// Receives content fragments as they are produced
pub type StreamCallback = Box<dyn Fn(&str) + Send + Sync>;

// ─────────────────────────────────────────────────────────────────
// Inference Backend Trait
// ─────────────────────────────────────────────────────────────────

/// Core trait for inference backends
#[async_trait]
pub trait InferenceBackend: Send + Sync {
    /// Get the backend name
    fn name(&self) -> &'static str;

    /// Run one chat completion against `model_id`
    async fn chat(&self, model_id: &str, messages: Vec<ChatMessage>) -> Result<ChatResponse>;

    /// Streaming chat. Backends without incremental output deliver the
    /// whole reply as a single fragment.
    async fn chat_stream(
        &self,
        model_id: &str,
        messages: Vec<ChatMessage>,
        callback: StreamCallback,
    ) -> Result<ChatResponse> {
        let response = self.chat(model_id, messages).await?;
        callback(&response.message.content);
        Ok(response)
    }

    /// Models this backend can serve
    async fn list_models(&self) -> Result<Vec<String>>;

    /// Check backend health
    async fn health_check(&self) -> Result<BackendHealth>;
}

/// Shared reference to a backend
pub type SharedBackend = Arc<dyn InferenceBackend>;
