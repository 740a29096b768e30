//! The Proposer role: drives Prepare/Accept/Confirm for the master, and
//! boosts stale instances on behalf of the Learner's recovery path.

use crate::learner::Learner;
use crate::membership::Membership;
use crate::rpc::{AcceptReq, ConfirmReq, PrepareReq, Transport};
use crate::timer::jitter;
use crate::types::{InstanceId, NegotiationOutcome, NodeId, Proposal, ProposalNo, ProposeContext};
use crate::error::ConsensusError;
use crate::quorum::{QuorumState, QuorumTracker};
use futures::future::join_all;
use log::{debug, info, warn};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;

enum PrepareOutcome {
    Granted(Vec<Proposal>),
    Confirmed(Vec<Proposal>),
    Refused,
}

enum AcceptOutcome {
    Granted,
    Refused,
}

pub struct Proposer {
    self_id: NodeId,
    membership: Arc<Membership>,
    transport: Arc<dyn Transport>,
    round_timeout: Duration,
    confirm_timeout: Duration,
    retry: u32,
    cur_proposal_no: AtomicU64,
    next_instance_id: AtomicU64,
    learner: OnceCell<Arc<Learner>>,
}

impl Proposer {
    pub fn new(
        self_id: NodeId,
        membership: Arc<Membership>,
        transport: Arc<dyn Transport>,
        round_timeout: Duration,
        confirm_timeout: Duration,
        retry: u32,
    ) -> Arc<Proposer> {
        Arc::new(Proposer {
            self_id,
            membership,
            transport,
            round_timeout,
            confirm_timeout,
            retry,
            cur_proposal_no: AtomicU64::new(0),
            next_instance_id: AtomicU64::new(1),
            learner: OnceCell::new(),
        })
    }

    /// Wired once, after the Learner exists, to break the Proposer/Learner
    /// construction cycle. See `Node::new`.
    pub fn set_learner(&self, learner: Arc<Learner>) {
        // `set` fails only if already set; wiring happens exactly once.
        let _ = self.learner.set(learner);
    }

    pub fn is_master(&self) -> bool {
        self.membership.master().map(|m| m.id) == Some(self.self_id.clone())
    }

    pub fn current_proposal_no(&self) -> ProposalNo {
        self.cur_proposal_no.load(Ordering::SeqCst)
    }

    /// Ensures `next_instance_id` never regresses below `id + 1`, e.g. when a
    /// peer's Confirm for a higher instance is observed.
    pub fn note_decided(&self, id: InstanceId) {
        let mut cur = self.next_instance_id.load(Ordering::SeqCst);
        while id + 1 > cur {
            match self.next_instance_id.compare_exchange(
                cur,
                id + 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => break,
                Err(actual) => cur = actual,
            }
        }
    }

    fn next_proposal_no(&self) -> ProposalNo {
        self.cur_proposal_no.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn bump_proposal_no(&self, seen: ProposalNo) {
        let mut cur = self.cur_proposal_no.load(Ordering::SeqCst);
        while seen > cur {
            match self.cur_proposal_no.compare_exchange(cur, seen, Ordering::SeqCst, Ordering::SeqCst) {
                Ok(_) => break,
                Err(actual) => cur = actual,
            }
        }
    }

    /// `propose(group, data)` — client entry point. Only the master drives a
    /// fresh instance; everyone else fails fast so the caller can forward to
    /// the master.
    pub async fn propose(&self, group: String, data: bytes::Bytes) -> Result<NegotiationOutcome, ConsensusError> {
        if !self.is_master() {
            return Err(ConsensusError::NotMaster(self.membership.master().map(|m| m.id)));
        }
        self.propose_unchecked(group, data).await
    }

    /// Same pipeline as `propose`, without the master gate. Needed by the
    /// Master role's own election proposal: electing a master is exactly how
    /// a node becomes master, so that proposal can't be gated on already
    /// being one.
    pub(crate) async fn propose_unchecked(
        &self,
        group: String,
        data: bytes::Bytes,
    ) -> Result<NegotiationOutcome, ConsensusError> {
        let instance_id = self.next_instance_id.load(Ordering::SeqCst);
        let mut ctx = ProposeContext::new(instance_id, vec![Proposal::Value { group, data }], self.retry);
        let outcome = self.run_round(&mut ctx).await;
        if let NegotiationOutcome::Pass(_) = &outcome {
            self.note_decided(instance_id);
        }
        Ok(outcome)
    }

    /// Re-drives consensus for `instance_id` with `default_proposals` as the
    /// candidate value, used by the Learner to collapse a gap.
    pub async fn try_boost(&self, instance_id: InstanceId, default_proposals: Vec<Proposal>) -> NegotiationOutcome {
        let mut ctx = ProposeContext::new(instance_id, default_proposals, self.retry);
        let outcome = self.run_round(&mut ctx).await;
        if let NegotiationOutcome::Pass(_) = &outcome {
            self.note_decided(instance_id);
        }
        outcome
    }

    async fn run_round(&self, ctx: &mut ProposeContext) -> NegotiationOutcome {
        loop {
            if ctx.times == 0 {
                return NegotiationOutcome::Unknown;
            }
            match self.force_prepare(ctx).await {
                PrepareOutcome::Confirmed(value) => {
                    self.confirm(ctx.instance_id, value.clone()).await;
                    return NegotiationOutcome::Pass(value);
                }
                PrepareOutcome::Granted(value) => {
                    ctx.proposals = value;
                    match self.accept(ctx).await {
                        AcceptOutcome::Granted => {
                            self.confirm(ctx.instance_id, ctx.proposals.clone()).await;
                            return NegotiationOutcome::Pass(ctx.proposals.clone());
                        }
                        AcceptOutcome::Refused => {
                            ctx.times -= 1;
                            self.backoff().await;
                        }
                    }
                }
                PrepareOutcome::Refused => {
                    ctx.times -= 1;
                    if ctx.times == 0 {
                        return NegotiationOutcome::Refuse;
                    }
                    self.backoff().await;
                }
            }
        }
    }

    async fn backoff(&self) {
        tokio::time::sleep(jitter(Duration::from_millis(5), Duration::from_millis(25))).await;
    }

    /// Phase 1 — broadcasts Prepare to every peer and collects responses into
    /// a quorum. Exposed so the Learner's recovery path can re-drive the same
    /// pipeline used by `propose`.
    pub(crate) async fn force_prepare(&self, ctx: &ProposeContext) -> PrepareOutcome {
        let proposal_no = self.next_proposal_no();
        info!("instance {}: phase 1 prepare with proposal_no {}", ctx.instance_id, proposal_no);
        let peers = self.membership.peers_excluding(&self.self_id);
        let req = PrepareReq { instance_id: ctx.instance_id, proposal_no };

        let mut tracker = QuorumTracker::new(self.membership.member_count());
        // Self always grants its own prepare.
        tracker.grant(self.self_id.clone());

        let round_timeout = self.round_timeout;
        let futs = peers.iter().map(|peer| {
            let transport = self.transport.clone();
            let req = req.clone();
            let peer = peer.clone();
            async move {
                let result = tokio::time::timeout(round_timeout, transport.prepare(&peer, req)).await;
                (peer.id, result)
            }
        });

        let mut best: Option<(ProposalNo, Vec<Proposal>)> = None;
        let mut confirmed_value: Option<Vec<Proposal>> = None;
        let mut highest_refusal = proposal_no;

        for (peer_id, result) in join_all(futs).await {
            match result {
                Ok(Ok(resp)) => {
                    if resp.confirmed {
                        if let Some(v) = resp.accepted_value {
                            confirmed_value = Some(v);
                        }
                    }
                    if resp.ok {
                        tracker.grant(peer_id);
                        if let Some(v) = resp.accepted_value {
                            let better = match &best {
                                Some((no, _)) => resp.max_accepted_proposal_no > *no,
                                None => true,
                            };
                            if better {
                                best = Some((resp.max_accepted_proposal_no, v));
                            }
                        }
                    } else {
                        tracker.refuse(peer_id);
                        highest_refusal = highest_refusal.max(resp.max_accepted_proposal_no);
                    }
                }
                Ok(Err(err)) => {
                    debug!("prepare rpc to {:?} failed: {}", peer_id, err);
                    tracker.refuse(peer_id);
                }
                Err(_elapsed) => {
                    warn!("prepare rpc to {:?} timed out", peer_id);
                    tracker.refuse(peer_id);
                }
            }
        }

        if let Some(value) = confirmed_value {
            return PrepareOutcome::Confirmed(value);
        }

        match tracker.state() {
            QuorumState::Pass => {
                // Pick-highest rule: an acceptor's already-accepted value
                // wins over the candidate this round started with. Absent
                // any accepted value anywhere, keep proposing our own.
                let value = best.map(|(_, v)| v).unwrap_or_else(|| ctx.proposals.clone());
                PrepareOutcome::Granted(value)
            }
            _ => {
                self.bump_proposal_no(highest_refusal);
                PrepareOutcome::Refused
            }
        }
    }

    /// Phase 2 — broadcasts Accept with the (possibly pick-highest-adjusted)
    /// value carried in `ctx.proposals`.
    pub(crate) async fn accept(&self, ctx: &ProposeContext) -> AcceptOutcome {
        let proposal_no = self.cur_proposal_no.load(Ordering::SeqCst);
        let peers = self.membership.peers_excluding(&self.self_id);
        let req = AcceptReq { instance_id: ctx.instance_id, proposal_no, values: ctx.proposals.clone() };

        let mut tracker = QuorumTracker::new(self.membership.member_count());
        tracker.grant(self.self_id.clone());

        let round_timeout = self.round_timeout;
        let futs = peers.iter().map(|peer| {
            let transport = self.transport.clone();
            let req = req.clone();
            let peer = peer.clone();
            async move {
                let result = tokio::time::timeout(round_timeout, transport.accept(&peer, req)).await;
                (peer.id, result)
            }
        });

        let mut highest_refusal = proposal_no;
        for (peer_id, result) in join_all(futs).await {
            match result {
                Ok(Ok(resp)) if resp.ok => {
                    tracker.grant(peer_id);
                }
                Ok(Ok(resp)) => {
                    tracker.refuse(peer_id);
                    highest_refusal = highest_refusal.max(resp.highest_proposal_no_seen);
                }
                Ok(Err(err)) => {
                    debug!("accept rpc to {:?} failed: {}", peer_id, err);
                    tracker.refuse(peer_id);
                }
                Err(_elapsed) => {
                    warn!("accept rpc to {:?} timed out", peer_id);
                    tracker.refuse(peer_id);
                }
            }
        }

        match tracker.state() {
            QuorumState::Pass => AcceptOutcome::Granted,
            _ => {
                self.bump_proposal_no(highest_refusal);
                AcceptOutcome::Refused
            }
        }
    }

    /// Phase 3 — fire-and-forget broadcast, plus local delivery to the
    /// Learner so this node's own log advances without waiting on the wire.
    async fn confirm(&self, instance_id: InstanceId, values: Vec<Proposal>) {
        let peers = self.membership.peers_excluding(&self.self_id);
        let req = ConfirmReq { node_id: self.self_id.clone(), instance_id, values: values.clone() };

        let confirm_timeout = self.confirm_timeout;
        let futs = peers.iter().map(|peer| {
            let transport = self.transport.clone();
            let req = req.clone();
            let peer = peer.clone();
            async move {
                let result = tokio::time::timeout(confirm_timeout, transport.confirm(&peer, req)).await;
                if !matches!(result, Ok(Ok(()))) {
                    warn!("confirm to {:?} did not succeed; relying on its own catch-up", peer.id);
                }
            }
        });
        join_all(futs).await;

        if let Some(learner) = self.learner.get() {
            learner.confirm(instance_id, values).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acceptor::Acceptor;
    use crate::rpc::{ChangeMemberReq, ConfirmReq, PingReq, PongResp, RpcError};
    use crate::storage::InMemoryLog;
    use crate::types::Endpoint;
    use std::collections::HashMap;

    /// Routes Prepare/Accept straight into a peer's own `Acceptor`, skipping
    /// Confirm/Ping/ChangeMember entirely — `Proposer` on its own never calls
    /// them on anything but the local `Learner`.
    struct PeerAcceptors {
        acceptors: HashMap<NodeId, Acceptor>,
    }

    #[async_trait::async_trait]
    impl Transport for PeerAcceptors {
        async fn prepare(&self, peer: &Endpoint, req: PrepareReq) -> Result<PrepareResp, RpcError> {
            Ok(self.acceptors.get(&peer.id).unwrap().handle_prepare(req))
        }
        async fn accept(&self, peer: &Endpoint, req: AcceptReq) -> Result<AcceptResp, RpcError> {
            Ok(self.acceptors.get(&peer.id).unwrap().handle_accept(req))
        }
        async fn confirm(&self, _peer: &Endpoint, _req: ConfirmReq) -> Result<(), RpcError> {
            Ok(())
        }
        async fn ping(&self, _peer: &Endpoint, _req: PingReq) -> Result<PongResp, RpcError> {
            Ok(PongResp { ok: true })
        }
        async fn change_member(&self, _peer: &Endpoint, _req: ChangeMemberReq) -> Result<(), RpcError> {
            Ok(())
        }
    }

    fn ep(id: &str) -> Endpoint {
        Endpoint::new(id, "127.0.0.1", 0)
    }

    fn val(s: &str) -> Vec<Proposal> {
        vec![Proposal::Value { group: "g".into(), data: bytes::Bytes::from(s.as_bytes().to_vec()) }]
    }

    fn build(self_id: &str, peer_ids: &[&str]) -> Arc<Proposer> {
        let mut members = vec![ep(self_id)];
        let mut acceptors = HashMap::new();
        for id in peer_ids {
            members.push(ep(id));
            acceptors.insert(NodeId::from(*id), Acceptor::new(Arc::new(InMemoryLog::new())));
        }
        let membership = Membership::new(members);
        let transport = Arc::new(PeerAcceptors { acceptors });
        Proposer::new(
            NodeId::from(self_id),
            membership,
            transport,
            Duration::from_millis(50),
            Duration::from_millis(50),
            3,
        )
    }

    #[tokio::test]
    async fn propose_fails_fast_when_not_master() {
        let p = build("a", &["b", "c"]);
        let err = p.propose("kv".into(), bytes::Bytes::from_static(b"x")).await.unwrap_err();
        assert!(matches!(err, ConsensusError::NotMaster(None)));
    }

    #[tokio::test]
    async fn propose_unchecked_bypasses_the_master_gate() {
        // Nobody is master yet — this is exactly the state the Master role's
        // own election proposal runs in, so `propose_unchecked` must still
        // succeed.
        let p = build("a", &["b", "c"]);
        let outcome = p.propose_unchecked("kv".into(), bytes::Bytes::from_static(b"x")).await.unwrap();
        assert!(matches!(outcome, NegotiationOutcome::Pass(_)));
    }

    #[tokio::test]
    async fn solo_node_keeps_its_own_candidate_when_nothing_was_previously_accepted() {
        let p = build("a", &[]);
        let outcome = p.try_boost(1, val("candidate")).await;
        assert_eq!(outcome, NegotiationOutcome::Pass(val("candidate")));
    }

    #[tokio::test]
    async fn pick_highest_prefers_a_peers_already_accepted_value_over_the_candidate() {
        // Seed peer "b" with an already-accepted value at a high proposal
        // number, simulating a prior, incomplete round this node never saw.
        let seeded = Acceptor::new(Arc::new(InMemoryLog::new()));
        seeded.handle_prepare(PrepareReq { instance_id: 1, proposal_no: 100 });
        seeded.handle_accept(AcceptReq { instance_id: 1, proposal_no: 100, values: val("already-accepted") });
        let transport = PeerAcceptors { acceptors: HashMap::from([(NodeId::from("b"), seeded)]) };
        let p = Proposer::new(
            NodeId::from("a"),
            Membership::new(vec![ep("a"), ep("b")]),
            Arc::new(transport),
            Duration::from_millis(50),
            Duration::from_millis(50),
            3,
        );
        let outcome = p.try_boost(1, val("my-own-candidate")).await;
        assert_eq!(outcome, NegotiationOutcome::Pass(val("already-accepted")));
    }

    #[test]
    fn note_decided_never_regresses_next_instance_id() {
        let p = build("a", &[]);
        p.note_decided(10);
        p.note_decided(3);
        assert_eq!(p.next_instance_id.load(Ordering::SeqCst), 11);
    }
}
