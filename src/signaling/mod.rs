//! Signaling relay client
//!
//! One persistent WebSocket to the coordination relay. The client
//! authenticates, registers, announces hosting state, and republishes
//! roster updates and forwarded connection-setup signals on typed
//! channels. It never touches peer connections itself.

mod client;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::protocol::{PeerInfo, Signal};

pub use client::*;

/// Display status exposed to callers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MeshStatus {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Error,
}

impl std::fmt::Display for MeshStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            MeshStatus::Disconnected => "disconnected",
            MeshStatus::Connecting => "connecting",
            MeshStatus::Connected => "connected",
            MeshStatus::Reconnecting => "reconnecting",
            MeshStatus::Error => "error",
        };
        f.write_str(s)
    }
}

/// Roster changes reported by the relay
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RosterEvent {
    /// A peer came online
    Joined(PeerInfo),
    /// A peer went away
    Left { peer_id: String },
    /// Full list, sent after registration or on request
    Snapshot(Vec<PeerInfo>),
    /// A peer changed what it hosts
    HostingChanged(PeerInfo),
}

/// Connection-setup envelope forwarded from another peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalEvent {
    pub from: String,
    pub signal: Signal,
}

/// Outbound path for connection-setup envelopes
#[async_trait]
pub trait SignalSink: Send + Sync {
    async fn send_signal(&self, target: &str, signal: Signal) -> Result<()>;
}
