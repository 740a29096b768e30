//! Error kinds surfaced at the edges of the consensus core.
//!
//! Routine Paxos refusals (stale proposal number, a quorum of RPC timeouts)
//! are not errors — they are represented by [`crate::types::NegotiationOutcome`]
//! and handled as expected protocol traffic. `ConsensusError` is reserved for
//! conditions the caller cannot recover from by retrying the round.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConsensusError {
    #[error("this node is not the master; proposals must go to {0:?}")]
    NotMaster(Option<crate::types::NodeId>),

    #[error("member {0:?} is not part of the current view")]
    InvalidMember(crate::types::NodeId),

    #[error("storage operation failed: {0}")]
    Storage(String),
}
