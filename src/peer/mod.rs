//! Peer-to-peer layer
//!
//! Peers find each other through the signaling relay, then talk over a
//! direct data channel:
//! - `manager` owns one link per peer and its lifecycle
//! - `router` correlates requests with replies over those links
//! - `link` is the transport strategy, chosen once at startup
//! - `registry` tracks what each known peer advertises

pub mod link;
pub mod manager;
pub mod registry;
pub mod router;
pub mod webrtc;

#[cfg(test)]
pub(crate) mod testing;

pub use link::{LinkEvent, LinkSetup, MemoryLinkFactory, MemoryNetwork, PeerLink, PeerLinkFactory};
pub use manager::{InboundMessage, PeerConnectionManager, PeerEvent, PeerManagerConfig};
pub use registry::{PeerRecord, PeerRegistry, PeerState};
pub use router::{InboundRequest, RequestRouter};
pub use webrtc::WebRtcLinkFactory;
