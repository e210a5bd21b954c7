//! NAT traversal configuration
//!
//! Resolves the STUN/TURN server list handed to every new peer connection.
//! Relay credentials come from a token-issuing endpoint and are cached
//! until most of their lifetime has passed.

mod credentials;
mod resolver;

pub use credentials::{CredentialResponse, CredentialSource, HttpCredentialSource, RawIceServer};
pub use resolver::{IceConfigResolver, IceServer, IceServerSet};
