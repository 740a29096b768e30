//! The Learner role: persists decided instances, applies them to the user
//! state machine in strict instance-id order, and recovers gaps by asking
//! the Proposer to re-drive (boost) the missing slot.

use crate::master::{ElectionOp, MASTER_GROUP};
use crate::membership::Membership;
use crate::proposer::Proposer;
use crate::rpc::{ChangeMemberOp, ChangeMemberReq};
use crate::storage::{LogStorage, StateMachine};
use crate::types::{Instance, InstanceId, InstanceState, NegotiationOutcome, NodeId, Proposal};
use log::{info, warn};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

/// One decided instance waiting for its turn on the single apply worker.
/// Ordered by instance id, ascending, so a `BinaryHeap` (normally a max-heap)
/// pops the lowest id first via `Reverse`.
#[derive(Clone)]
struct PendingConfirm {
    instance_id: InstanceId,
    values: Vec<Proposal>,
}

impl PartialEq for PendingConfirm {
    fn eq(&self, other: &Self) -> bool {
        self.instance_id == other.instance_id
    }
}
impl Eq for PendingConfirm {}
impl PartialOrd for PendingConfirm {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for PendingConfirm {
    fn cmp(&self, other: &Self) -> Ordering {
        self.instance_id.cmp(&other.instance_id)
    }
}

pub struct Learner {
    self_id: NodeId,
    membership: Arc<Membership>,
    storage: Arc<dyn LogStorage>,
    state_machine: RwLock<Arc<dyn StateMachine>>,
    proposer: Arc<Proposer>,
    queue: Mutex<BinaryHeap<std::cmp::Reverse<PendingConfirm>>>,
    notify: Notify,
    shutting_down: AtomicBool,
    worker: Mutex<Option<JoinHandle<()>>>,
}

/// Group name reserved for single-node membership add/remove proposals,
/// intercepted by the Learner before they reach the user state machine.
pub const MEMBER_GROUP: &str = "__member__";

impl Learner {
    pub fn new(
        self_id: NodeId,
        membership: Arc<Membership>,
        storage: Arc<dyn LogStorage>,
        state_machine: Arc<dyn StateMachine>,
        proposer: Arc<Proposer>,
    ) -> Arc<Learner> {
        let learner = Arc::new(Learner {
            self_id,
            membership,
            storage,
            state_machine: RwLock::new(state_machine),
            proposer,
            queue: Mutex::new(BinaryHeap::new()),
            notify: Notify::new(),
            shutting_down: AtomicBool::new(false),
            worker: Mutex::new(None),
        });
        learner.spawn_apply_worker();
        learner
    }

    fn spawn_apply_worker(self: &Arc<Learner>) {
        let learner = self.clone();
        let handle = tokio::spawn(async move {
            loop {
                let next = learner.queue.lock().unwrap().pop();
                match next {
                    Some(std::cmp::Reverse(pending)) => {
                        learner.apply_chain(pending.instance_id, pending.values).await;
                    }
                    None => {
                        if learner.shutting_down.load(AtomicOrdering::SeqCst) {
                            break;
                        }
                        learner.notify.notified().await;
                    }
                }
            }
        });
        *self.worker.lock().unwrap() = Some(handle);
    }

    /// Replaces the state machine, e.g. after `loadImage` on boot.
    pub fn load_sm(&self, sm: Arc<dyn StateMachine>) {
        *self.state_machine.write().unwrap() = sm;
    }

    pub fn max_applied_instance_id(&self) -> InstanceId {
        self.storage.max_applied_instance_id()
    }

    /// Durably records a decided instance and enqueues it for in-order apply.
    /// Idempotent: re-confirming an already-confirmed instance with the same
    /// value is a no-op. A *different* value for an already-confirmed
    /// instance can never happen in a correct run (it would break the
    /// agreement invariant) — logged and ignored rather than overwritten.
    pub async fn confirm(&self, instance_id: InstanceId, values: Vec<Proposal>) {
        {
            let mut instance = self.storage.get(instance_id).unwrap_or_else(|| Instance::new(instance_id));
            if instance.state == InstanceState::Confirmed {
                if instance.granted_value != values {
                    warn!(
                        "instance {} already confirmed with a different value; ignoring conflicting confirm",
                        instance_id
                    );
                }
                return;
            }
            instance.state = InstanceState::Confirmed;
            instance.granted_value = values.clone();
            self.storage.put(instance);
        }
        self.proposer.note_decided(instance_id);
        self.queue.lock().unwrap().push(std::cmp::Reverse(PendingConfirm { instance_id, values }));
        self.notify.notify_one();
    }

    /// RPC-facing entry point for an incoming Confirm message.
    pub async fn handle_confirm_request(&self, req: ConfirmReq) {
        self.confirm(req.instance_id, req.values).await;
    }

    /// Recovers a gap by re-proposing a no-op (or whatever value a peer
    /// already accepted) until the instance decides or the retry budget is
    /// exhausted.
    pub async fn learn(&self, instance_id: InstanceId) {
        loop {
            match self.proposer.try_boost(instance_id, vec![Proposal::noop()]).await {
                NegotiationOutcome::Pass(_) => return,
                NegotiationOutcome::Refuse => continue,
                NegotiationOutcome::Unknown => {
                    warn!("learn({}) gave up: round inconclusive", instance_id);
                    return;
                }
            }
        }
    }

    /// Applies instance `id` (and, iteratively, any unapplied predecessor
    /// in its way) to the state machine. Drops the request if `id` was
    /// already applied.
    async fn apply_chain(&self, id: InstanceId, values: Vec<Proposal>) {
        loop {
            let max_applied = self.storage.max_applied_instance_id();
            if id <= max_applied {
                return;
            }
            let expected = max_applied + 1;
            if expected == id {
                self.apply_one(id, values).await;
                return;
            }
            self.ensure_applied(expected).await;
            if self.storage.max_applied_instance_id() == max_applied {
                warn!("could not close gap at instance {} while applying {}", expected, id);
                return;
            }
        }
    }

    async fn ensure_applied(&self, id: InstanceId) {
        if id <= self.storage.max_applied_instance_id() {
            return;
        }
        match self.storage.get(id) {
            Some(instance) if instance.state == InstanceState::Confirmed => {
                self.apply_one(id, instance.granted_value).await;
            }
            _ => self.learn(id).await,
        }
    }

    async fn apply_one(&self, id: InstanceId, values: Vec<Proposal>) {
        if !self.storage.try_mark_applied(id) {
            return;
        }
        let sm = self.state_machine.read().unwrap().clone();
        for value in &values {
            let (group, data) = match value {
                Proposal::Noop => continue,
                Proposal::Value { group, data } => (group, data),
            };
            if group == MASTER_GROUP {
                self.apply_election(id, data);
                continue;
            }
            if group == MEMBER_GROUP {
                self.apply_member_change(id, data);
                continue;
            }
            if let Err(err) = sm.apply(value) {
                warn!("state machine apply failed at instance {}: {}", id, err);
            }
        }
    }

    fn apply_election(&self, id: InstanceId, data: &bytes::Bytes) {
        match bincode::deserialize::<ElectionOp>(data) {
            Ok(op) => {
                if let Err(err) = self.membership.change_master(Some(op.node_id)) {
                    warn!("instance {}: election decision rejected: {}", id, err);
                }
            }
            Err(err) => warn!("instance {}: malformed ElectionOp: {}", id, err),
        }
    }

    fn apply_member_change(&self, id: InstanceId, data: &bytes::Bytes) {
        match bincode::deserialize::<ChangeMemberReq>(data) {
            Ok(req) => match req.op {
                ChangeMemberOp::Add => self.membership.write_on(req.change_target),
                ChangeMemberOp::Remove => self.membership.write_off(&req.change_target.id),
            },
            Err(err) => warn!("instance {}: malformed ChangeMemberReq: {}", id, err),
        }
    }

    /// Sets a latch, captures a final state-machine image and drains the
    /// apply queue best-effort before returning.
    pub async fn shutdown(&self) {
        self.shutting_down.store(true, AtomicOrdering::SeqCst);
        self.notify.notify_one();
        let handle = self.worker.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        let sm = self.state_machine.read().unwrap().clone();
        let image = tokio::task::spawn_blocking(move || sm.make_image()).await;
        match image {
            Ok(bytes) => info!("node {:?}: captured {} byte state machine image on shutdown", self.self_id, bytes.len()),
            Err(err) => warn!("node {:?}: failed to capture state machine image: {}", self.self_id, err),
        }
    }
}
