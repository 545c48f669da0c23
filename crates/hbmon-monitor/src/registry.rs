//! Global directory of live groups.
//!
//! One process-wide mutex serializes creation, destruction, and lookup,
//! and is distinct from every per-group lock: registry mutation never
//! waits on a slow per-group operation, and group-internal work never
//! blocks lookups for other groups.

use std::sync::{Arc, Mutex, MutexGuard};

use crate::group::Group;

pub(crate) struct GroupRegistry {
    groups: Mutex<Vec<Arc<Group>>>,
}

impl GroupRegistry {
    pub fn new() -> Self {
        GroupRegistry {
            groups: Mutex::new(Vec::new()),
        }
    }

    /// Exclusive access to the group list, for compound
    /// find-or-create / remove sequences.
    pub fn lock(&self) -> MutexGuard<'_, Vec<Arc<Group>>> {
        self.groups
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Lookup within an already-held guard.
    pub fn find_in(groups: &[Arc<Group>], gid: i32) -> Option<Arc<Group>> {
        groups.iter().find(|g| g.gid() == gid).cloned()
    }

    /// Lookup under the registry lock.
    pub fn find(&self, gid: i32) -> Option<Arc<Group>> {
        Self::find_in(&self.lock(), gid)
    }

    /// Remove within an already-held guard. The caller finishes the
    /// destruction (timer cancel, region teardown) once the group is
    /// unreachable.
    pub fn remove_in(groups: &mut Vec<Arc<Group>>, gid: i32) {
        groups.retain(|g| g.gid() != gid);
    }
}
