//! Signaling relay messages
//!
//! JSON objects discriminated by `type`. Field names are camelCase except
//! where the relay already fixed them otherwise.

use serde::{Deserialize, Serialize};

use crate::system::DeviceInfo;

// ─────────────────────────────────────────────────────────────────
// Connection setup envelopes
// ─────────────────────────────────────────────────────────────────

/// ICE candidate as exchanged between peers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_m_line_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

/// Opaque connection-setup envelope forwarded by the relay
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Signal {
    Offer { sdp: String },
    Answer { sdp: String },
    Candidate { candidate: IceCandidate },
}

impl Signal {
    /// Only an offer can create a connection on the receiving side
    pub fn is_offer(&self) -> bool {
        matches!(self, Signal::Offer { .. })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Signal::Offer { .. } => "offer",
            Signal::Answer { .. } => "answer",
            Signal::Candidate { .. } => "candidate",
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Roster
// ─────────────────────────────────────────────────────────────────

/// Peer entry in `existing-peers`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerInfo {
    pub peer_id: String,
    #[serde(default)]
    pub is_hosting: bool,
    #[serde(default)]
    pub models: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
}

/// Capabilities advertised at registration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Capabilities {
    pub data_channel: bool,
    pub inference: bool,
    pub node_version: String,
}

// ─────────────────────────────────────────────────────────────────
// Relay messages
// ─────────────────────────────────────────────────────────────────

/// Every message exchanged with the relay
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum RelayMessage {
    // ─── Node → Relay ───────────────────────────────────────────
    #[serde(rename = "auth", rename_all = "camelCase")]
    Auth { token: String, peer_id: String },

    #[serde(rename = "register", rename_all = "camelCase")]
    Register {
        platform: String,
        capabilities: Capabilities,
        is_hosting: bool,
        models: Vec<String>,
    },

    #[serde(rename = "request-peer-list")]
    RequestPeerList,

    // ─── Relay → Node ───────────────────────────────────────────
    #[serde(rename = "auth_response", rename_all = "camelCase")]
    AuthResponse {
        success: bool,
        #[serde(default)]
        peer_id: Option<String>,
        #[serde(default)]
        error: Option<String>,
    },

    #[serde(rename = "registered", rename_all = "camelCase")]
    Registered { peer_id: String },

    #[serde(rename = "peer-joined", rename_all = "camelCase")]
    PeerJoined {
        peer_id: String,
        #[serde(default)]
        is_hosting: bool,
        #[serde(default)]
        models: Vec<String>,
    },

    #[serde(rename = "peer-left", rename_all = "camelCase")]
    PeerLeft { peer_id: String },

    #[serde(rename = "existing-peers")]
    ExistingPeers { peers: Vec<PeerInfo> },

    #[serde(rename = "models-requested", rename_all = "camelCase")]
    ModelsRequested {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from_peer_id: Option<String>,
    },

    #[serde(rename = "error")]
    Error { message: String },

    // ─── Both directions ────────────────────────────────────────
    /// Outbound carries `targetPeerId`, inbound carries `fromPeerId`
    #[serde(rename = "webrtc-signal", rename_all = "camelCase")]
    WebrtcSignal {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target_peer_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from_peer_id: Option<String>,
        signal: Signal,
    },

    /// Outbound announces our state; inbound reports another peer's
    #[serde(rename = "hosting-status", rename_all = "camelCase")]
    HostingStatus {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        peer_id: Option<String>,
        is_hosting: bool,
        #[serde(default)]
        models: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        device_info: Option<DeviceInfo>,
    },

    /// Anything this build does not understand
    #[serde(other)]
    Unknown,
}

impl RelayMessage {
    pub fn type_name(&self) -> &'static str {
        match self {
            RelayMessage::Auth { .. } => "auth",
            RelayMessage::AuthResponse { .. } => "auth_response",
            RelayMessage::Register { .. } => "register",
            RelayMessage::Registered { .. } => "registered",
            RelayMessage::RequestPeerList => "request-peer-list",
            RelayMessage::PeerJoined { .. } => "peer-joined",
            RelayMessage::PeerLeft { .. } => "peer-left",
            RelayMessage::ExistingPeers { .. } => "existing-peers",
            RelayMessage::ModelsRequested { .. } => "models-requested",
            RelayMessage::Error { .. } => "error",
            RelayMessage::WebrtcSignal { .. } => "webrtc-signal",
            RelayMessage::HostingStatus { .. } => "hosting-status",
            RelayMessage::Unknown => "unknown",
        }
    }

    /// Outbound signal addressed to `target`
    pub fn signal_to(target: impl Into<String>, signal: Signal) -> Self {
        RelayMessage::WebrtcSignal {
            target_peer_id: Some(target.into()),
            from_peer_id: None,
            signal,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_auth_wire_format() {
        let msg = RelayMessage::Auth {
            token: "t0k".into(),
            peer_id: "node-a".into(),
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value, json!({"type": "auth", "token": "t0k", "peerId": "node-a"}));
    }

    #[test]
    fn test_auth_response_failure() {
        let msg: RelayMessage =
            serde_json::from_str(r#"{"type":"auth_response","success":false,"error":"bad token"}"#).unwrap();
        match msg {
            RelayMessage::AuthResponse { success, error, peer_id } => {
                assert!(!success);
                assert_eq!(error.as_deref(), Some("bad token"));
                assert!(peer_id.is_none());
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_inbound_offer_signal() {
        let raw = r#"{"type":"webrtc-signal","fromPeerId":"node-b","signal":{"type":"offer","sdp":"v=0"}}"#;
        let msg: RelayMessage = serde_json::from_str(raw).unwrap();
        match msg {
            RelayMessage::WebrtcSignal { from_peer_id, signal, target_peer_id } => {
                assert_eq!(from_peer_id.as_deref(), Some("node-b"));
                assert!(target_peer_id.is_none());
                assert!(signal.is_offer());
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_candidate_field_names() {
        let signal = Signal::Candidate {
            candidate: IceCandidate {
                candidate: "candidate:1 1 udp 2122260223 10.0.0.2 54321 typ host".into(),
                sdp_mid: Some("0".into()),
                sdp_m_line_index: Some(0),
                username_fragment: None,
            },
        };
        let value = serde_json::to_value(&signal).unwrap();
        assert_eq!(value["type"], "candidate");
        assert_eq!(value["candidate"]["sdpMLineIndex"], 0);
        assert_eq!(value["candidate"]["sdpMid"], "0");
    }

    #[test]
    fn test_existing_peers_defaults() {
        let raw = r#"{"type":"existing-peers","peers":[{"peerId":"a"},{"peerId":"b","isHosting":true,"models":["phi3"]}]}"#;
        let msg: RelayMessage = serde_json::from_str(raw).unwrap();
        let RelayMessage::ExistingPeers { peers } = msg else {
            panic!("expected existing-peers");
        };
        assert_eq!(peers.len(), 2);
        assert!(!peers[0].is_hosting);
        assert_eq!(peers[1].models, vec!["phi3"]);
    }

    #[test]
    fn test_unknown_type_is_tolerated() {
        let msg: RelayMessage = serde_json::from_str(r#"{"type":"server-stats"}"#).unwrap();
        assert_eq!(msg, RelayMessage::Unknown);
    }

    #[test]
    fn test_request_peer_list_is_bare() {
        let value = serde_json::to_value(RelayMessage::RequestPeerList).unwrap();
        assert_eq!(value, json!({"type": "request-peer-list"}));
    }
}
