//! The Master role: elects a distinguished proposer via a tiny internal
//! state machine (`MasterSM`) and maintains its liveness with heartbeats.
//!
//! Election and heartbeat timers are mutually exclusive: exactly one of the
//! two is ever running for a given node at a given time.

use crate::membership::{MasterNotifier, Membership};
use crate::proposer::Proposer;
use crate::quorum::{QuorumState, QuorumTracker};
use crate::rpc::{ChangeMemberOp, ChangeMemberReq, PingReq, Transport};
use crate::timer::{jitter, RepeatingTimer};
use crate::types::{Endpoint, NegotiationOutcome, NodeId};
use crate::error::ConsensusError;
use futures::stream::{FuturesUnordered, StreamExt};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

/// Proposal group reserved for leadership elections.
pub const MASTER_GROUP: &str = "__master__";

/// The value proposed to (and decided by) `MASTER_GROUP`: "elect me".
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ElectionOp {
    pub node_id: NodeId,
}

/// Upper bound on how long the quorum wait for one heartbeat round may take
/// before the follower set is treated as unreachable. Matches the 100ms Ping
/// deadline with headroom for local scheduling jitter.
const HEARTBEAT_QUORUM_WAIT: Duration = Duration::from_millis(110);

pub struct Master {
    self_weak: Weak<Master>,
    self_id: NodeId,
    membership: Arc<Membership>,
    proposer: Arc<Proposer>,
    transport: Arc<dyn Transport>,
    election_timer: RepeatingTimer,
    heartbeat_timer: RepeatingTimer,
    electing: AtomicBool,
    election_jitter_min: Duration,
    election_jitter_max: Duration,
    heartbeat_interval: Duration,
    heartbeat_timeout: Duration,
    round_timeout: Duration,
    retry: u32,
}

impl Master {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        self_id: NodeId,
        membership: Arc<Membership>,
        proposer: Arc<Proposer>,
        transport: Arc<dyn Transport>,
        election_jitter_min: Duration,
        election_jitter_max: Duration,
        heartbeat_interval: Duration,
        heartbeat_timeout: Duration,
        round_timeout: Duration,
        retry: u32,
    ) -> Arc<Master> {
        Arc::new_cyclic(|weak| Master {
            self_weak: weak.clone(),
            self_id,
            membership,
            proposer,
            transport,
            election_timer: RepeatingTimer::new(),
            heartbeat_timer: RepeatingTimer::new(),
            electing: AtomicBool::new(false),
            election_jitter_min,
            election_jitter_max,
            heartbeat_interval,
            heartbeat_timeout,
            round_timeout,
            retry,
        })
    }

    fn arc(&self) -> Arc<Master> {
        self.self_weak.upgrade().expect("Master always outlives its own timers")
    }

    /// Boots the role as a follower: every node starts its election timer and
    /// only switches to heartbeats once a decision actually elects it.
    pub fn start(&self) {
        self.arm_election_timer(true);
    }

    fn arm_election_timer(&self, initial_boot: bool) {
        let master = self.arc();
        let min = self.election_jitter_min;
        let max = self.election_jitter_max;
        let first = AtomicBool::new(initial_boot);
        self.election_timer.start(
            move || {
                if first.swap(false, Ordering::SeqCst) {
                    Duration::from_secs(1)
                } else {
                    jitter(min, max)
                }
            },
            move || {
                let master = master.clone();
                async move { master.election().await }
            },
        );
    }

    fn arm_heartbeat_timer(&self) {
        let master = self.arc();
        let interval = self.heartbeat_interval;
        self.heartbeat_timer.start(
            move || interval,
            move || {
                let master = master.clone();
                async move { master.send_heartbeat().await }
            },
        );
    }

    /// Resets the election timer without running an election — used when a
    /// live leader's heartbeat suppresses this follower's timer. Only ever
    /// re-arms the timer; never calls `election`.
    fn suppress_election(&self) {
        self.arm_election_timer(false);
    }

    /// Proposes `ElectionOp{self}` to the master group. Re-entrant calls
    /// while a round is already in flight are dropped.
    async fn election(&self) {
        if self.electing.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst).is_err() {
            debug!("node {:?}: election already in flight, skipping", self.self_id);
            return;
        }

        struct ResetOnDrop<'a>(&'a AtomicBool);
        impl<'a> Drop for ResetOnDrop<'a> {
            fn drop(&mut self) {
                self.0.store(false, Ordering::SeqCst);
            }
        }
        let _guard = ResetOnDrop(&self.electing);

        info!("node {:?}: election timer fired, proposing leadership", self.self_id);
        let op = ElectionOp { node_id: self.self_id.clone() };
        let data = bincode::serialize(&op).expect("ElectionOp is always serializable");
        let bound = self.round_timeout * self.retry.max(1);

        match tokio::time::timeout(bound, self.proposer.propose_unchecked(MASTER_GROUP.to_string(), data.into())).await {
            Ok(Ok(NegotiationOutcome::Pass(_))) => {
                debug!("node {:?}: election round decided", self.self_id);
            }
            Ok(Ok(NegotiationOutcome::Refuse)) => warn!("node {:?}: election refused", self.self_id),
            Ok(Ok(NegotiationOutcome::Unknown)) => warn!("node {:?}: election round inconclusive", self.self_id),
            Ok(Err(err)) => warn!("node {:?}: election round failed: {}", self.self_id, err),
            Err(_) => warn!("node {:?}: election round timed out locally", self.self_id),
        }
    }

    /// Sends one heartbeat round. Delivers to itself first, then broadcasts;
    /// any non-`Pass` outcome (refusal, timeout, exception) demotes this node
    /// by restarting the election timer.
    async fn send_heartbeat(&self) {
        let snap = self.membership.create_ref();
        let ping = PingReq {
            node_id: self.self_id.clone(),
            proposal_no: self.proposer.current_proposal_no(),
            member_configuration_version: snap.version,
        };

        let mut tracker = QuorumTracker::new(snap.members.len().max(1));
        if self.on_receive_heartbeat(ping.clone(), true) {
            tracker.grant(self.self_id.clone());
        } else {
            tracker.refuse(self.self_id.clone());
        }

        let heartbeat_timeout = self.heartbeat_timeout;
        let mut pending = FuturesUnordered::new();
        for peer in snap.members.values().filter(|e| e.id != self.self_id) {
            let transport = self.transport.clone();
            let peer = peer.clone();
            let ping = ping.clone();
            pending.push(async move {
                let id = peer.id.clone();
                let result = tokio::time::timeout(heartbeat_timeout, transport.ping(&peer, ping)).await;
                (id, result)
            });
        }

        let resolution = tokio::time::timeout(HEARTBEAT_QUORUM_WAIT, async {
            while let Some((peer_id, result)) = pending.next().await {
                match result {
                    Ok(Ok(pong)) if pong.ok => {
                        tracker.grant(peer_id);
                    }
                    _ => {
                        tracker.refuse(peer_id);
                    }
                }
                if tracker.state() != QuorumState::Pending {
                    return tracker.state();
                }
            }
            tracker.state()
        })
        .await;

        match resolution {
            Ok(QuorumState::Pass) => {}
            Ok(state) => {
                warn!("node {:?}: heartbeat quorum {:?}, demoting", self.self_id, state);
                self.restart_elect();
            }
            Err(_) => {
                warn!("node {:?}: heartbeat quorum wait timed out, demoting", self.self_id);
                self.restart_elect();
            }
        }
    }

    /// Demotes this node: stops the heartbeat timer and re-arms the election
    /// timer. Safe to call even if this node never held leadership.
    fn restart_elect(&self) {
        self.heartbeat_timer.stop();
        self.arm_election_timer(false);
    }

    /// Accepts a Ping iff it names the current master at the current
    /// membership version. Accepting from a live, non-self leader suppresses
    /// (resets, never starts) this follower's own election timer.
    pub fn on_receive_heartbeat(&self, ping: PingReq, is_self: bool) -> bool {
        let master = self.membership.master();
        let version = self.membership.version();
        let accepted = match &master {
            Some(master) => master.id == ping.node_id && version == ping.member_configuration_version,
            None => false,
        };
        if accepted && !is_self {
            self.suppress_election();
        }
        accepted
    }

    /// Proposes a single-node membership add/remove through the master. Not
    /// a general reconfiguration protocol — one endpoint in or out at a time.
    pub async fn change_member(&self, op: ChangeMemberOp, target: Endpoint) -> Result<(), ConsensusError> {
        if !self.proposer.is_master() {
            return Err(ConsensusError::NotMaster(self.membership.master().map(|m| m.id)));
        }
        let req = ChangeMemberReq { op, change_target: target };
        let data = bincode::serialize(&req).expect("ChangeMemberReq is always serializable");
        let outcome = self
            .proposer
            .propose(crate::learner::MEMBER_GROUP.to_string(), data.into())
            .await?;
        match outcome {
            NegotiationOutcome::Pass(_) => Ok(()),
            NegotiationOutcome::Refuse => Err(ConsensusError::Storage("membership change refused".into())),
            NegotiationOutcome::Unknown => Err(ConsensusError::Storage("membership change inconclusive".into())),
        }
    }
}

impl MasterNotifier for Master {
    /// Triggered by `Membership::change_master`. Never called directly by
    /// `election` — timer transitions happen only once the change is
    /// actually decided and applied.
    fn on_change_master(&self, new_master: Option<NodeId>) {
        if new_master.as_ref() == Some(&self.self_id) {
            info!("node {:?}: elected master", self.self_id);
            self.election_timer.stop();
            self.arm_heartbeat_timer();
        } else {
            self.heartbeat_timer.stop();
            self.arm_election_timer(false);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::{AcceptReq, AcceptResp, ChangeMemberReq, ConfirmReq, PongResp, PrepareReq, PrepareResp, RpcError};
    use async_trait::async_trait;

    struct UnusedTransport;

    #[async_trait]
    impl Transport for UnusedTransport {
        async fn prepare(&self, _peer: &Endpoint, _req: PrepareReq) -> Result<PrepareResp, RpcError> {
            panic!("not exercised by this test")
        }
        async fn accept(&self, _peer: &Endpoint, _req: AcceptReq) -> Result<AcceptResp, RpcError> {
            panic!("not exercised by this test")
        }
        async fn confirm(&self, _peer: &Endpoint, _req: ConfirmReq) -> Result<(), RpcError> {
            panic!("not exercised by this test")
        }
        async fn ping(&self, _peer: &Endpoint, _req: PingReq) -> Result<PongResp, RpcError> {
            panic!("not exercised by this test")
        }
        async fn change_member(&self, _peer: &Endpoint, _req: ChangeMemberReq) -> Result<(), RpcError> {
            panic!("not exercised by this test")
        }
    }

    fn build(self_id: &str, members: Vec<Endpoint>) -> Arc<Master> {
        let membership = Membership::new(members);
        let proposer = Proposer::new(
            NodeId::from(self_id),
            membership.clone(),
            Arc::new(UnusedTransport),
            Duration::from_millis(50),
            Duration::from_millis(50),
            3,
        );
        Master::new(
            NodeId::from(self_id),
            membership,
            proposer,
            Arc::new(UnusedTransport),
            Duration::from_millis(10),
            Duration::from_millis(20),
            Duration::from_millis(10),
            Duration::from_millis(10),
            Duration::from_millis(50),
            3,
        )
    }

    fn ping_from(node_id: &str, version: u32) -> PingReq {
        PingReq { node_id: NodeId::from(node_id), proposal_no: 0, member_configuration_version: version }
    }

    #[tokio::test]
    async fn rejects_heartbeat_with_no_master_set() {
        let members = vec![Endpoint::new("a", "127.0.0.1", 0), Endpoint::new("b", "127.0.0.1", 0)];
        let master = build("a", members);
        assert!(!master.on_receive_heartbeat(ping_from("a", 0), true));
    }

    #[tokio::test]
    async fn accepts_heartbeat_matching_current_master_and_version() {
        let members = vec![Endpoint::new("a", "127.0.0.1", 0), Endpoint::new("b", "127.0.0.1", 0)];
        let master = build("a", members);
        master.membership.change_master(Some(NodeId::from("b"))).unwrap();
        let version = master.membership.version();
        assert!(master.on_receive_heartbeat(ping_from("b", version), false));
    }

    #[tokio::test]
    async fn rejects_heartbeat_from_stale_version() {
        let members = vec![Endpoint::new("a", "127.0.0.1", 0), Endpoint::new("b", "127.0.0.1", 0)];
        let master = build("a", members);
        master.membership.change_master(Some(NodeId::from("b"))).unwrap();
        let stale_version = master.membership.version() - 1;
        assert!(!master.on_receive_heartbeat(ping_from("b", stale_version), false));
    }

    #[tokio::test]
    async fn rejects_heartbeat_from_wrong_master() {
        let members = vec![Endpoint::new("a", "127.0.0.1", 0), Endpoint::new("b", "127.0.0.1", 0)];
        let master = build("a", members);
        master.membership.change_master(Some(NodeId::from("b"))).unwrap();
        let version = master.membership.version();
        assert!(!master.on_receive_heartbeat(ping_from("a", version), false));
    }

    #[tokio::test]
    async fn on_change_master_switches_timers() {
        let members = vec![Endpoint::new("a", "127.0.0.1", 0), Endpoint::new("b", "127.0.0.1", 0)];
        let master = build("a", members);
        master.election_timer.start(|| Duration::from_secs(3600), || async {});

        master.on_change_master(Some(NodeId::from("a")));
        assert!(!master.election_timer.is_running());
        assert!(master.heartbeat_timer.is_running());

        master.on_change_master(Some(NodeId::from("b")));
        assert!(!master.heartbeat_timer.is_running());
        assert!(master.election_timer.is_running());
    }
}
