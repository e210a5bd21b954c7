//! Backend module for AI inference
//!
//! The inference abstraction behind hosted models, an OpenAI-compatible
//! HTTP implementation, and the queue handler that feeds it.

mod handler;
mod mock;
mod openai;
mod traits;

pub use handler::ChatRequestHandler;
pub use mock::{MockBackend, MockConfig};
pub use openai::{OpenAiBackend, OpenAiConfig};
pub use traits::*;
