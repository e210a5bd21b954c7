//! Peer registry: what we know about each remote peer
//!
//! Populated from relay roster events and from connection attempts.
//! Records are dropped on `peer-left`, explicit disconnect, or a
//! terminal connection error.

use std::collections::HashMap;
use std::time::Instant;

use parking_lot::RwLock;
use serde::Serialize;

use crate::protocol::PeerInfo;

// ─────────────────────────────────────────────────────────────────
// Peer Record
// ─────────────────────────────────────────────────────────────────

/// Connection state of a known peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerState {
    /// Seen on the roster, no transport
    Known,
    Connecting,
    Connected,
}

/// Information about a known peer
#[derive(Debug, Clone)]
pub struct PeerRecord {
    pub peer_id: String,
    pub state: PeerState,
    pub is_hosting: bool,

    /// Models the peer advertises
    pub models: Vec<String>,

    pub platform: Option<String>,

    /// Last time we heard from this peer
    pub last_activity: Instant,

    /// Last measured ping round-trip (ms)
    pub latency_ms: Option<u32>,
}

impl PeerRecord {
    pub fn new(peer_id: impl Into<String>) -> Self {
        Self {
            peer_id: peer_id.into(),
            state: PeerState::Known,
            is_hosting: false,
            models: Vec::new(),
            platform: None,
            last_activity: Instant::now(),
            latency_ms: None,
        }
    }

    pub fn serves(&self, model: &str) -> bool {
        self.is_hosting && self.models.iter().any(|m| m == model)
    }
}

// ─────────────────────────────────────────────────────────────────
// Peer Registry
// ─────────────────────────────────────────────────────────────────

/// Thread-safe registry of known peers
#[derive(Default)]
pub struct PeerRegistry {
    peers: RwLock<HashMap<String, PeerRecord>>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create or refresh a record from roster data; connection state is kept
    pub fn upsert(&self, info: &PeerInfo) {
        let mut peers = self.peers.write();
        let record = peers
            .entry(info.peer_id.clone())
            .or_insert_with(|| PeerRecord::new(&info.peer_id));
        record.is_hosting = info.is_hosting;
        record.models = info.models.clone();
        if info.platform.is_some() {
            record.platform = info.platform.clone();
        }
        record.last_activity = Instant::now();
    }

    /// Make sure a record exists, e.g. on first signal from a peer
    pub fn ensure(&self, peer_id: &str) {
        self.peers
            .write()
            .entry(peer_id.to_string())
            .or_insert_with(|| PeerRecord::new(peer_id));
    }

    pub fn set_state(&self, peer_id: &str, state: PeerState) {
        if let Some(peer) = self.peers.write().get_mut(peer_id) {
            peer.state = state;
            peer.last_activity = Instant::now();
        }
    }

    pub fn remove(&self, peer_id: &str) -> Option<PeerRecord> {
        self.peers.write().remove(peer_id)
    }

    pub fn get(&self, peer_id: &str) -> Option<PeerRecord> {
        self.peers.read().get(peer_id).cloned()
    }

    pub fn all_peers(&self) -> Vec<PeerRecord> {
        self.peers.read().values().cloned().collect()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.read().len()
    }

    /// Hosting peers, optionally narrowed to one model
    pub fn hosting_peers(&self, model: Option<&str>) -> Vec<PeerRecord> {
        self.peers
            .read()
            .values()
            .filter(|p| match model {
                Some(m) => p.serves(m),
                None => p.is_hosting,
            })
            .cloned()
            .collect()
    }

    /// Touch a peer's last_activity timestamp
    pub fn touch(&self, peer_id: &str) {
        if let Some(peer) = self.peers.write().get_mut(peer_id) {
            peer.last_activity = Instant::now();
        }
    }

    pub fn update_latency(&self, peer_id: &str, latency_ms: u32) {
        if let Some(peer) = self.peers.write().get_mut(peer_id) {
            peer.latency_ms = Some(latency_ms);
            peer.last_activity = Instant::now();
        }
    }

    /// Lowest-latency connected peer serving `model`
    pub fn best_host_for(&self, model: &str) -> Option<PeerRecord> {
        self.peers
            .read()
            .values()
            .filter(|p| p.state == PeerState::Connected && p.serves(model))
            .min_by_key(|p| p.latency_ms.unwrap_or(u32::MAX))
            .cloned()
    }
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────
