//! Log/storage engine and user state machine contracts.
//!
//! Durability format and `apply` semantics belong to the embedder, not this
//! crate — but the core needs a trait boundary to call through, and tests
//! need a reference implementation.

use crate::types::{Instance, InstanceId, Proposal};
use std::collections::HashMap;
use std::sync::RwLock;

/// Durable, locked key-value store over instance records, plus a
/// maximum-applied-instance pointer. Writers (Confirm, apply) take the write
/// lock; precondition reads may take the read lock.
pub trait LogStorage: Send + Sync {
    fn get(&self, id: InstanceId) -> Option<Instance>;
    fn put(&self, instance: Instance);
    fn max_applied_instance_id(&self) -> InstanceId;

    /// Compare-and-swap `applied` false -> true. Returns `true` if this call
    /// won the race.
    fn try_mark_applied(&self, id: InstanceId) -> bool;
}

/// `apply(value)` / `makeImage()` / `loadImage()` hooks into the replicated
/// user state machine. `apply` must be idempotent across retries of the same
/// value, since an apply exception is logged and swallowed rather than
/// retried at the same instance.
pub trait StateMachine: Send + Sync {
    fn apply(&self, value: &Proposal) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;
    fn make_image(&self) -> Vec<u8>;
    fn load_image(&self, image: &[u8]);
}

/// In-memory reference `LogStorage`, used by tests and single-process demos.
/// Not a durable format — durability is an embedder concern, out of scope
/// here.
#[derive(Default)]
pub struct InMemoryLog {
    instances: RwLock<HashMap<InstanceId, Instance>>,
    max_applied: RwLock<InstanceId>,
}

impl InMemoryLog {
    pub fn new() -> InMemoryLog {
        InMemoryLog::default()
    }
}

impl LogStorage for InMemoryLog {
    fn get(&self, id: InstanceId) -> Option<Instance> {
        self.instances.read().unwrap().get(&id).cloned()
    }

    fn put(&self, instance: Instance) {
        self.instances.write().unwrap().insert(instance.id, instance);
    }

    fn max_applied_instance_id(&self) -> InstanceId {
        *self.max_applied.read().unwrap()
    }

    fn try_mark_applied(&self, id: InstanceId) -> bool {
        let mut instances = self.instances.write().unwrap();
        let won = match instances.get_mut(&id) {
            Some(inst) if !inst.applied => {
                inst.applied = true;
                true
            }
            _ => false,
        };
        if won {
            let mut max_applied = self.max_applied.write().unwrap();
            if id > *max_applied {
                *max_applied = id;
            }
        }
        won
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::InstanceState;

    #[test]
    fn try_mark_applied_is_cas_once() {
        let log = InMemoryLog::new();
        log.put(Instance { state: InstanceState::Confirmed, ..Instance::new(1) });
        assert!(log.try_mark_applied(1));
        assert!(!log.try_mark_applied(1));
        assert_eq!(log.max_applied_instance_id(), 1);
    }

    #[test]
    fn marking_missing_instance_fails() {
        let log = InMemoryLog::new();
        assert!(!log.try_mark_applied(42));
        assert_eq!(log.max_applied_instance_id(), 0);
    }
}
