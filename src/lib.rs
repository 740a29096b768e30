//! A Multi-Paxos replicated state machine core.
//!
//! Three cooperating roles share one [`membership::Membership`] view:
//!
//! - [`proposer::Proposer`] drives Prepare/Accept/Confirm for whichever node
//!   currently holds mastership.
//! - [`learner::Learner`] durably records decisions and applies them to the
//!   embedder's [`storage::StateMachine`] in strict instance order, closing
//!   gaps by asking the proposer to re-drive a stalled instance.
//! - [`master::Master`] elects a leader and keeps it alive with heartbeats.
//!
//! [`registry::Node`] wires the three together with an [`acceptor::Acceptor`]
//! and is the type an embedder actually constructs; everything else is
//! exported for testing against fakes or swapping out one role's wiring.
//!
//! The wire transport, log durability format, and state machine semantics
//! are all supplied by the embedder through the [`rpc::Transport`],
//! [`storage::LogStorage`] and [`storage::StateMachine`] traits — this crate
//! only implements the consensus core itself.

pub mod acceptor;
pub mod config;
pub mod error;
pub mod learner;
pub mod master;
pub mod membership;
pub mod proposer;
pub mod quorum;
pub mod registry;
pub mod rpc;
pub mod storage;
pub mod timer;
pub mod types;

pub use config::ConsensusProp;
pub use error::ConsensusError;
pub use registry::Node;
pub use types::{Endpoint, InstanceId, NodeId, Proposal, ProposalNo};
