//! The acceptor side of Phase 1/2: answers another node's Prepare/Accept RPC
//! against this node's log. Every node is an acceptor for every instance,
//! independent of whether it is currently the master.

use crate::rpc::{AcceptReq, AcceptResp, PrepareReq, PrepareResp};
use crate::storage::LogStorage;
use crate::types::{Instance, InstanceState};
use std::sync::Arc;

pub struct Acceptor {
    storage: Arc<dyn LogStorage>,
}

impl Acceptor {
    pub fn new(storage: Arc<dyn LogStorage>) -> Acceptor {
        Acceptor { storage }
    }

    /// Promises not to accept any proposal numbered below `req.proposal_no`,
    /// provided nothing higher has already been promised. An already-decided
    /// instance short-circuits with `confirmed: true` so the proposer can
    /// skip straight to Confirm instead of re-running Phase 2.
    pub fn handle_prepare(&self, req: PrepareReq) -> PrepareResp {
        let mut instance = self.storage.get(req.instance_id).unwrap_or_else(|| Instance::new(req.instance_id));

        if instance.state == InstanceState::Confirmed {
            return PrepareResp {
                ok: true,
                max_accepted_proposal_no: instance.granted_proposal_no,
                accepted_value: Some(instance.granted_value),
                confirmed: true,
            };
        }

        if req.proposal_no <= instance.promised_proposal_no {
            return PrepareResp {
                ok: false,
                max_accepted_proposal_no: instance.promised_proposal_no,
                accepted_value: None,
                confirmed: false,
            };
        }

        let previously_accepted = if instance.state == InstanceState::Accepted {
            Some((instance.granted_proposal_no, instance.granted_value.clone()))
        } else {
            None
        };

        instance.promised_proposal_no = req.proposal_no;
        self.storage.put(instance);

        match previously_accepted {
            Some((no, value)) => PrepareResp {
                ok: true,
                max_accepted_proposal_no: no,
                accepted_value: Some(value),
                confirmed: false,
            },
            None => PrepareResp {
                ok: true,
                max_accepted_proposal_no: 0,
                accepted_value: None,
                confirmed: false,
            },
        }
    }

    /// Accepts `req.values` at `req.proposal_no` unless a higher number has
    /// already been promised to a different proposer.
    pub fn handle_accept(&self, req: AcceptReq) -> AcceptResp {
        let mut instance = self.storage.get(req.instance_id).unwrap_or_else(|| Instance::new(req.instance_id));

        if instance.state == InstanceState::Confirmed {
            return AcceptResp { ok: false, highest_proposal_no_seen: instance.granted_proposal_no };
        }

        if req.proposal_no < instance.promised_proposal_no {
            return AcceptResp { ok: false, highest_proposal_no_seen: instance.promised_proposal_no };
        }

        instance.promised_proposal_no = req.proposal_no;
        instance.granted_proposal_no = req.proposal_no;
        instance.granted_value = req.values;
        instance.state = InstanceState::Accepted;
        self.storage.put(instance);

        AcceptResp { ok: true, highest_proposal_no_seen: req.proposal_no }
    }
}
