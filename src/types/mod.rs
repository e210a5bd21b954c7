//! Shared type definitions
//!
//! Chat payloads exchanged between peers and handed to inference backends.

mod chat;

pub use chat::*;
