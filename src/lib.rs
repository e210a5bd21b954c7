//! LLMesh node library
//!
//! Lets devices that share an account pool one local language-model
//! endpoint. A relay handles discovery and connection setup; chat traffic
//! then flows over direct peer data channels and is arbitrated per model
//! on the hosting side.

pub mod backend;
pub mod config;
pub mod error;
pub mod events;
pub mod ice;
pub mod logging;
pub mod node;
pub mod peer;
pub mod protocol;
pub mod queue;
pub mod signaling;
pub mod system;
pub mod types;
pub mod version;

pub use error::{Error, Result};
pub use node::MeshNode;
