//! The RPC transport contract: a best-effort asynchronous request/response
//! bus with per-call timeouts. Wire format, connection management and retries
//! below the per-call deadline are someone else's problem — this module only
//! names the requests/responses the core sends and the trait it sends them
//! through.

use crate::types::{Endpoint, InstanceId, NodeId, Proposal, ProposalNo};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PrepareReq {
    pub instance_id: InstanceId,
    pub proposal_no: ProposalNo,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PrepareResp {
    pub ok: bool,
    pub max_accepted_proposal_no: ProposalNo,
    pub accepted_value: Option<Vec<Proposal>>,
    /// Set when the acceptor already holds a `Confirmed` instance for this
    /// id; `accepted_value` then carries the decided value and the Proposer
    /// short-circuits straight to it instead of driving Accept.
    pub confirmed: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AcceptReq {
    pub instance_id: InstanceId,
    pub proposal_no: ProposalNo,
    pub values: Vec<Proposal>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AcceptResp {
    pub ok: bool,
    pub highest_proposal_no_seen: ProposalNo,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConfirmReq {
    pub node_id: NodeId,
    pub instance_id: InstanceId,
    pub values: Vec<Proposal>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PingReq {
    pub node_id: NodeId,
    pub proposal_no: ProposalNo,
    pub member_configuration_version: u32,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct PongResp {
    pub ok: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeMemberOp {
    Add,
    Remove,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChangeMemberReq {
    pub op: ChangeMemberOp,
    pub change_target: Endpoint,
}

#[derive(Debug)]
pub enum RpcError {
    Timeout,
    Transport(String),
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RpcError::Timeout => write!(f, "rpc timed out"),
            RpcError::Transport(msg) => write!(f, "transport error: {}", msg),
        }
    }
}

impl std::error::Error for RpcError {}

/// Sends consensus RPCs to a named peer. Implementations own connection
/// pooling, retries below the deadline, and serialization; the core only
/// ever calls through this trait, never a concrete transport.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn prepare(&self, peer: &Endpoint, req: PrepareReq) -> Result<PrepareResp, RpcError>;
    async fn accept(&self, peer: &Endpoint, req: AcceptReq) -> Result<AcceptResp, RpcError>;
    /// Fire-and-forget: failures are logged by the caller, never retried here.
    async fn confirm(&self, peer: &Endpoint, req: ConfirmReq) -> Result<(), RpcError>;
    async fn ping(&self, peer: &Endpoint, req: PingReq) -> Result<PongResp, RpcError>;
    async fn change_member(&self, peer: &Endpoint, req: ChangeMemberReq) -> Result<(), RpcError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Proposal;

    #[test]
    fn it_serializes_prepare_req() {
        let json = r#"{"instance_id":7,"proposal_no":42}"#;
        let req = PrepareReq { instance_id: 7, proposal_no: 42 };
        assert_eq!(&serde_json::to_string(&req).unwrap(), json);
    }

    #[test]
    fn it_serializes_accept_req_with_a_value_proposal() {
        let json = r#"{"instance_id":1,"proposal_no":3,"values":[{"Value":{"group":"kv","data":[104,105]}}]}"#;
        let req = AcceptReq {
            instance_id: 1,
            proposal_no: 3,
            values: vec![Proposal::Value { group: "kv".into(), data: bytes::Bytes::from_static(b"hi") }],
        };
        assert_eq!(&serde_json::to_string(&req).unwrap(), json);
    }

    #[test]
    fn it_serializes_confirm_req_with_a_noop() {
        let json = r#"{"node_id":"a","instance_id":2,"values":["Noop"]}"#;
        let req = ConfirmReq { node_id: NodeId::from("a"), instance_id: 2, values: vec![Proposal::Noop] };
        assert_eq!(&serde_json::to_string(&req).unwrap(), json);
    }

    #[test]
    fn it_round_trips_ping_req_through_bincode() {
        let req = PingReq { node_id: NodeId::from("a"), proposal_no: 9, member_configuration_version: 4 };
        let bytes = bincode::serialize(&req).unwrap();
        let back: PingReq = bincode::deserialize(&bytes).unwrap();
        assert_eq!(back.node_id, req.node_id);
        assert_eq!(back.proposal_no, req.proposal_no);
        assert_eq!(back.member_configuration_version, req.member_configuration_version);
    }
}
