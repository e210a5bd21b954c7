//! Queue handler that runs chat requests on a backend

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use crate::error::{Error, Result};
use crate::queue::RequestHandler;
use crate::types::ChatRequest;

use super::SharedBackend;

/// Executes queued `chat` payloads; the resource key is the model id
pub struct ChatRequestHandler {
    backend: SharedBackend,
}

impl ChatRequestHandler {
    pub fn new(backend: SharedBackend) -> Self {
        Self { backend }
    }
}

#[async_trait]
impl RequestHandler for ChatRequestHandler {
    async fn handle(&self, resource_key: &str, payload: Value) -> Result<Value> {
        let request: ChatRequest = serde_json::from_value(payload).map_err(|e| Error::ProtocolMalformed {
            message: format!("invalid chat payload: {}", e),
        })?;

        let model = if request.model_id.is_empty() {
            resource_key
        } else {
            request.model_id.as_str()
        };
        debug!(backend = self.backend.name(), model = %model, "Running chat request");

        let response = self.backend.chat(model, request.messages).await?;
        Ok(serde_json::to_value(response)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MockBackend;
    use serde_json::json;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_runs_chat_payload() {
        let handler = ChatRequestHandler::new(Arc::new(MockBackend::new()));
        let out = handler
            .handle(
                "phi3",
                json!({"modelId": "phi3", "messages": [{"role": "user", "content": "hello"}]}),
            )
            .await
            .unwrap();

        assert_eq!(out["message"]["content"], "[phi3] hello");
        assert_eq!(out["message"]["role"], "assistant");
    }

    #[tokio::test]
    async fn test_rejects_malformed_payload() {
        let handler = ChatRequestHandler::new(Arc::new(MockBackend::new()));
        let err = handler.handle("phi3", json!({"prompt": "x"})).await.unwrap_err();
        assert!(matches!(err, Error::ProtocolMalformed { .. }));
    }
}
