//! Shared data types: peer identity, proposals, instances and proposal numbers.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identity of a cluster member. Wraps a plain string so it can be used as
/// both a map key and a wire-format field without pulling in a UUID crate.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub String);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        NodeId(s.to_string())
    }
}

impl From<String> for NodeId {
    fn from(s: String) -> Self {
        NodeId(s)
    }
}

/// Immutable identity of a peer, as carried in the membership view.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub id: NodeId,
    pub ip: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(id: impl Into<NodeId>, ip: impl Into<String>, port: u16) -> Endpoint {
        Endpoint { id: id.into(), ip: ip.into(), port }
    }
}

/// Slot index in the replicated log.
pub type InstanceId = u64;

/// A globally-monotonic 64-bit tag used to order proposers on one instance.
pub type ProposalNo = u64;

/// An opaque, serializable payload carrying a logical group name and user
/// bytes, or the distinguished no-op used to seal an abandoned instance
/// during recovery.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Proposal {
    Value { group: String, data: bytes::Bytes },
    Noop,
}

impl Proposal {
    pub fn noop() -> Proposal {
        Proposal::Noop
    }

    pub fn is_noop(&self) -> bool {
        matches!(self, Proposal::Noop)
    }
}

/// Lifecycle state of one instance, advancing monotonically per id.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum InstanceState {
    Prepared,
    Accepted,
    Confirmed,
}

/// One slot in the replicated log. Once `state == Confirmed`, `granted_value`
/// and `granted_proposal_no` are immutable; `applied` transitions
/// false -> true exactly once.
///
/// `promised_proposal_no` and `granted_proposal_no` are tracked separately:
/// a Prepare can raise the promise without there being an accepted value yet,
/// and a later Prepare must not be answered with a promise number where an
/// older, still-accepted value should have been.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Instance {
    pub id: InstanceId,
    pub state: InstanceState,
    pub promised_proposal_no: ProposalNo,
    pub granted_proposal_no: ProposalNo,
    pub granted_value: Vec<Proposal>,
    pub applied: bool,
}

impl Instance {
    pub fn new(id: InstanceId) -> Instance {
        Instance {
            id,
            state: InstanceState::Prepared,
            promised_proposal_no: 0,
            granted_proposal_no: 0,
            granted_value: Vec::new(),
            applied: false,
        }
    }
}

/// Final disposition of a propose/recovery round.
#[derive(Clone, Debug, PartialEq)]
pub enum NegotiationOutcome {
    /// A value was decided for the instance (not necessarily the caller's).
    Pass(Vec<Proposal>),
    /// A quorum of acceptors refused every retry.
    Refuse,
    /// The round could not conclude within `round_timeout * retry`.
    Unknown,
}

/// Transient per-attempt scratch space threaded through the Prepare/Accept
/// phases of a single propose or recovery round.
#[derive(Clone, Debug)]
pub struct ProposeContext {
    pub instance_id: InstanceId,
    pub proposals: Vec<Proposal>,
    pub times: u32,
}

impl ProposeContext {
    pub fn new(instance_id: InstanceId, proposals: Vec<Proposal>, times: u32) -> ProposeContext {
        ProposeContext { instance_id, proposals, times }
    }
}
