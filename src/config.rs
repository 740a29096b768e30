//! `ConsensusProp` — the configuration object the engine is built from.
//!
//! Loading it from a file or CLI flags is explicitly out of scope; this is
//! just the plain struct an embedder populates and hands to [`crate::Node::new`].

use crate::types::Endpoint;
use std::time::Duration;

#[derive(Clone, Debug)]
pub struct ConsensusProp {
    /// Local node identity.
    pub this: Endpoint,
    /// Initial peer list, including `this`.
    pub members: Vec<Endpoint>,
    /// Per-phase RPC deadline for Prepare/Accept.
    pub round_timeout: Duration,
    /// Phase 1/2 retry budget per propose.
    pub retry: u32,
    /// Election timer randomisation window, lower bound.
    pub election_jitter_min: Duration,
    /// Election timer randomisation window, upper bound.
    pub election_jitter_max: Duration,
    /// Heartbeat period.
    pub heartbeat_interval: Duration,
    /// RPC deadline used for the Confirm broadcast.
    pub confirm_timeout: Duration,
    /// RPC deadline used for heartbeat Ping.
    pub heartbeat_timeout: Duration,
}

impl Default for ConsensusProp {
    fn default() -> ConsensusProp {
        ConsensusProp {
            this: Endpoint::new("self", "127.0.0.1", 0),
            members: Vec::new(),
            round_timeout: Duration::from_millis(500),
            retry: 3,
            election_jitter_min: Duration::from_millis(600),
            election_jitter_max: Duration::from_millis(800),
            heartbeat_interval: Duration::from_millis(100),
            confirm_timeout: Duration::from_millis(1000),
            heartbeat_timeout: Duration::from_millis(100),
        }
    }
}

impl ConsensusProp {
    pub fn new(this: Endpoint, members: Vec<Endpoint>) -> ConsensusProp {
        ConsensusProp { this, members, ..ConsensusProp::default() }
    }
}
