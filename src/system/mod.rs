//! Host inspection
//!
//! Collects device information announced to the relay and runs the
//! capability probe that selects the peer connection timeout profile.

mod probe;

pub use probe::*;
