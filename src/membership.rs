//! The membership view `M`: a snapshot-capable record of peers, the current
//! master, and a monotonic version counter.

use crate::types::{Endpoint, NodeId};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// A frozen, deep copy of the membership view, safe for concurrent readers.
#[derive(Clone, Debug, PartialEq)]
pub struct MembershipSnapshot {
    pub members: HashMap<NodeId, Endpoint>,
    pub master: Option<Endpoint>,
    pub version: u32,
}

/// Called whenever `Membership::change_master` commits a new master, so the
/// Master role can switch its timers. Kept as a trait object to avoid a
/// construction-time cycle between `Membership` and `Master` — see
/// `Node::new`.
pub trait MasterNotifier: Send + Sync {
    fn on_change_master(&self, new_master: Option<NodeId>);
}

struct Inner {
    members: HashMap<NodeId, Endpoint>,
    master: Option<Endpoint>,
    version: u32,
}

pub struct Membership {
    inner: RwLock<Inner>,
    notifier: RwLock<Option<Arc<dyn MasterNotifier>>>,
}

impl Membership {
    pub fn new(initial: Vec<Endpoint>) -> Arc<Membership> {
        let members = initial.into_iter().map(|e| (e.id.clone(), e)).collect();
        Arc::new(Membership {
            inner: RwLock::new(Inner { members, master: None, version: 0 }),
            notifier: RwLock::new(None),
        })
    }

    pub fn set_master_notifier(&self, notifier: Arc<dyn MasterNotifier>) {
        *self.notifier.write().unwrap() = Some(notifier);
    }

    pub fn version(&self) -> u32 {
        self.inner.read().unwrap().version
    }

    pub fn master(&self) -> Option<Endpoint> {
        self.inner.read().unwrap().master.clone()
    }

    pub fn quorum_size(&self) -> usize {
        crate::quorum::majority(self.inner.read().unwrap().members.len())
    }

    pub fn member_count(&self) -> usize {
        self.inner.read().unwrap().members.len()
    }

    pub fn get(&self, id: &NodeId) -> Option<Endpoint> {
        self.inner.read().unwrap().members.get(id).cloned()
    }

    pub fn members(&self) -> Vec<Endpoint> {
        self.inner.read().unwrap().members.values().cloned().collect()
    }

    /// All members except `id`, used when broadcasting to peers.
    pub fn peers_excluding(&self, id: &NodeId) -> Vec<Endpoint> {
        self.inner.read().unwrap().members.values().filter(|e| &e.id != id).cloned().collect()
    }

    /// Creates a frozen, deep copy of the view, safe for concurrent readers.
    pub fn create_ref(&self) -> MembershipSnapshot {
        let guard = self.inner.read().unwrap();
        MembershipSnapshot {
            members: guard.members.clone(),
            master: guard.master.clone(),
            version: guard.version,
        }
    }

    /// Replaces the view's contents atomically, e.g. after loading an image.
    pub fn load_snap(&self, snap: MembershipSnapshot) {
        let mut guard = self.inner.write().unwrap();
        guard.members = snap.members;
        guard.master = snap.master;
        guard.version = snap.version;
    }

    pub fn write_on(&self, endpoint: Endpoint) {
        let mut guard = self.inner.write().unwrap();
        guard.members.insert(endpoint.id.clone(), endpoint);
        guard.version += 1;
    }

    pub fn write_off(&self, id: &NodeId) {
        let mut guard = self.inner.write().unwrap();
        guard.members.remove(id);
        if guard.master.as_ref().map(|m| &m.id) == Some(id) {
            guard.master = None;
        }
        guard.version += 1;
    }

    /// Changes the elected master. `new_master` must already be a member, or
    /// `None` to clear the master. Notifies the wired `Master` role.
    pub fn change_master(&self, new_master: Option<NodeId>) -> Result<(), crate::error::ConsensusError> {
        let resolved = {
            let mut guard = self.inner.write().unwrap();
            let resolved = match &new_master {
                Some(id) => {
                    let ep = guard
                        .members
                        .get(id)
                        .cloned()
                        .ok_or_else(|| crate::error::ConsensusError::InvalidMember(id.clone()))?;
                    Some(ep)
                }
                None => None,
            };
            guard.master = resolved.clone();
            guard.version += 1;
            resolved
        };
        if let Some(notifier) = self.notifier.read().unwrap().clone() {
            notifier.on_change_master(resolved.map(|e| e.id));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ep(id: &str) -> Endpoint {
        Endpoint::new(id, "127.0.0.1", 0)
    }

    #[test]
    fn version_is_monotonic_across_mutations() {
        let m = Membership::new(vec![ep("a"), ep("b")]);
        let v0 = m.version();
        m.write_on(ep("c"));
        assert!(m.version() > v0);
        let v1 = m.version();
        m.change_master(Some(NodeId::from("a"))).unwrap();
        assert!(m.version() > v1);
    }

    #[test]
    fn master_must_be_a_member() {
        let m = Membership::new(vec![ep("a")]);
        let err = m.change_master(Some(NodeId::from("ghost"))).unwrap_err();
        assert!(matches!(err, crate::error::ConsensusError::InvalidMember(_)));
    }

    #[test]
    fn create_ref_is_a_deep_independent_copy() {
        let m = Membership::new(vec![ep("a")]);
        let snap = m.create_ref();
        m.write_on(ep("b"));
        assert_eq!(snap.members.len(), 1);
        assert_eq!(m.members().len(), 2);
    }

    #[test]
    fn load_snap_replaces_contents_atomically() {
        let m = Membership::new(vec![ep("a")]);
        let mut snap = m.create_ref();
        snap.members.insert(NodeId::from("b"), ep("b"));
        snap.version = 41;
        m.load_snap(snap);
        assert_eq!(m.version(), 41);
        assert_eq!(m.member_count(), 2);
    }

    #[test]
    fn change_master_notifies_wired_listener() {
        use std::sync::atomic::{AtomicBool, Ordering};
        struct Flag(Arc<AtomicBool>);
        impl MasterNotifier for Flag {
            fn on_change_master(&self, _new_master: Option<NodeId>) {
                self.0.store(true, Ordering::SeqCst);
            }
        }
        let m = Membership::new(vec![ep("a")]);
        let fired = Arc::new(AtomicBool::new(false));
        m.set_master_notifier(Arc::new(Flag(fired.clone())));
        m.change_master(Some(NodeId::from("a"))).unwrap();
        assert!(fired.load(Ordering::SeqCst));
    }
}
