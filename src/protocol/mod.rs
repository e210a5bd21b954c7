//! Wire protocols
//!
//! - `signaling`: JSON messages exchanged with the coordination relay
//! - `peer`: request/response envelopes carried over a peer data channel

pub mod peer;
pub mod signaling;

pub use peer::{PeerMessage, REQUEST_CHAT, REQUEST_MODELS};
pub use signaling::{Capabilities, IceCandidate, PeerInfo, RelayMessage, Signal};
