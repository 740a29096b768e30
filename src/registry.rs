//! Wires the four roles together and exposes `Node`, the single facade an
//! embedder builds once per process and drives from its own RPC server.
//!
//! Construction happens in two passes because `Proposer` and `Learner`
//! reference each other: `Learner` needs a `Proposer` to re-drive recovery,
//! and `Proposer` needs a `Learner` to deliver local Confirms. `Proposer` is
//! built first and wired to its `Learner` after the fact via
//! [`crate::proposer::Proposer::set_learner`]. `Membership` and `Master` have
//! the same shape of cycle, broken the same way via
//! [`crate::membership::MasterNotifier`].

use crate::acceptor::Acceptor;
use crate::config::ConsensusProp;
use crate::error::ConsensusError;
use crate::learner::Learner;
use crate::master::Master;
use crate::membership::Membership;
use crate::proposer::Proposer;
use crate::rpc::{
    AcceptReq, AcceptResp, ChangeMemberOp, ChangeMemberReq, ConfirmReq, PingReq, PongResp, PrepareReq, PrepareResp,
    Transport,
};
use crate::storage::{LogStorage, StateMachine};
use crate::types::{Endpoint, NegotiationOutcome, NodeId};
use std::sync::Arc;

/// A fully wired consensus engine for one node. Holds the four roles plus the
/// acceptor state; an embedder calls `propose` for client writes and routes
/// inbound RPCs to the `handle_*` methods from its own server loop.
pub struct Node {
    self_id: NodeId,
    membership: Arc<Membership>,
    proposer: Arc<Proposer>,
    learner: Arc<Learner>,
    master: Arc<Master>,
    acceptor: Acceptor,
}

impl Node {
    pub fn new(
        prop: &ConsensusProp,
        transport: Arc<dyn Transport>,
        storage: Arc<dyn LogStorage>,
        state_machine: Arc<dyn StateMachine>,
    ) -> Arc<Node> {
        let self_id = prop.this.id.clone();
        let membership = Membership::new(prop.members.clone());

        let proposer = Proposer::new(
            self_id.clone(),
            membership.clone(),
            transport.clone(),
            prop.round_timeout,
            prop.confirm_timeout,
            prop.retry,
        );

        let learner = Learner::new(self_id.clone(), membership.clone(), storage.clone(), state_machine, proposer.clone());
        proposer.set_learner(learner.clone());

        let master = Master::new(
            self_id,
            membership.clone(),
            proposer.clone(),
            transport,
            prop.election_jitter_min,
            prop.election_jitter_max,
            prop.heartbeat_interval,
            prop.heartbeat_timeout,
            prop.round_timeout,
            prop.retry,
        );
        membership.set_master_notifier(master.clone());

        let acceptor = Acceptor::new(storage);

        let node = Arc::new(Node { self_id: prop.this.id.clone(), membership, proposer, learner, master, acceptor });
        node.master.start();
        node
    }

    /// Client entry point: proposes `data` under `group` to the current
    /// master's log. Fails fast with [`ConsensusError::NotMaster`] if this
    /// node isn't it — the caller is expected to forward to the master named
    /// in the error.
    pub async fn propose(&self, group: String, data: bytes::Bytes) -> Result<NegotiationOutcome, ConsensusError> {
        self.proposer.propose(group, data).await
    }

    /// Proposes a single-node membership change through the master.
    pub async fn change_member(&self, op: ChangeMemberOp, target: Endpoint) -> Result<(), ConsensusError> {
        self.master.change_member(op, target).await
    }

    pub fn membership(&self) -> &Arc<Membership> {
        &self.membership
    }

    pub fn is_master(&self) -> bool {
        self.proposer.is_master()
    }

    /// Inbound Phase 1 RPC handler, synchronous since acceptor state lives
    /// entirely behind `LogStorage`'s own locking.
    pub fn handle_prepare(&self, req: PrepareReq) -> PrepareResp {
        self.acceptor.handle_prepare(req)
    }

    /// Inbound Phase 2 RPC handler.
    pub fn handle_accept(&self, req: AcceptReq) -> AcceptResp {
        self.acceptor.handle_accept(req)
    }

    /// Inbound Phase 3 RPC handler.
    pub async fn handle_confirm(&self, req: ConfirmReq) {
        self.learner.handle_confirm_request(req).await;
    }

    /// Inbound heartbeat RPC handler.
    pub fn handle_ping(&self, req: PingReq) -> PongResp {
        PongResp { ok: self.master.on_receive_heartbeat(req, false) }
    }

    /// Inbound membership-change RPC handler, invoked on every node so a
    /// non-master can validate and forward, per `ChangeMemberReq`'s RPC
    /// contract in the wire interface.
    pub async fn handle_change_member(&self, req: ChangeMemberReq) -> Result<(), ConsensusError> {
        self.master.change_member(req.op, req.change_target).await
    }

    pub fn node_id(&self) -> &NodeId {
        &self.self_id
    }

    /// Stops background timers and flushes the apply queue. Call before
    /// dropping a `Node` to avoid losing an in-flight state machine image.
    pub async fn shutdown(&self) {
        self.learner.shutdown().await;
    }
}
