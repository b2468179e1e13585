//! Per-record bookkeeping of held cluster locks.

use crate::{LockCoordinator, LockGrant, LockKind, LockMode, LockResource, LockWait, OnBusy};
use cfs_error::Result;
use cfs_types::{NodeId, ObjectId};
use parking_lot::Mutex;
use std::sync::Arc;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct Held {
    shared: u32,
    exclusive: u32,
}

/// One of a record's three named locks, as seen from one node.
///
/// Counts every level it holds so that a record being dropped can give back
/// exactly what it took.
pub struct LockHandle {
    coordinator: Arc<dyn LockCoordinator>,
    node: NodeId,
    resource: LockResource,
    held: Mutex<Held>,
}

impl std::fmt::Debug for LockHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockHandle")
            .field("node", &self.node)
            .field("resource", &self.resource)
            .field("held", &*self.held.lock())
            .finish_non_exhaustive()
    }
}

impl LockHandle {
    #[must_use]
    pub fn new(
        coordinator: Arc<dyn LockCoordinator>,
        node: NodeId,
        object: ObjectId,
        kind: LockKind,
    ) -> Self {
        Self {
            coordinator,
            node,
            resource: LockResource::new(object, kind),
            held: Mutex::new(Held::default()),
        }
    }

    #[must_use]
    pub fn resource(&self) -> LockResource {
        self.resource
    }

    pub fn lock(&self, mode: LockMode, wait: LockWait) -> Result<LockGrant> {
        let grant = self.coordinator.lock(self.node, self.resource, mode, wait)?;
        if grant.is_granted() {
            let mut held = self.held.lock();
            match mode {
                LockMode::Shared => held.shared += 1,
                LockMode::Exclusive => held.exclusive += 1,
            }
        }
        Ok(grant)
    }

    pub fn unlock(&self, mode: LockMode) -> Result<()> {
        self.coordinator.unlock(self.node, self.resource, mode)?;
        let mut held = self.held.lock();
        match mode {
            LockMode::Shared => held.shared = held.shared.saturating_sub(1),
            LockMode::Exclusive => held.exclusive = held.exclusive.saturating_sub(1),
        }
        Ok(())
    }

    /// Non-blocking shared → exclusive conversion of one shared hold.
    pub fn try_upgrade(&self, on_busy: OnBusy) -> Result<LockGrant> {
        let grant = self
            .coordinator
            .try_upgrade_exclusive(self.node, self.resource, on_busy)?;
        let mut held = self.held.lock();
        match (grant, on_busy) {
            (LockGrant::Granted, _) => {
                held.shared = held.shared.saturating_sub(1);
                held.exclusive += 1;
            }
            (LockGrant::Busy, OnBusy::Release) => held.shared = held.shared.saturating_sub(1),
            (LockGrant::Busy, OnBusy::Keep) => {}
        }
        Ok(grant)
    }

    #[must_use]
    pub fn holds(&self, mode: LockMode) -> bool {
        let held = self.held.lock();
        match mode {
            LockMode::Shared => held.shared > 0,
            LockMode::Exclusive => held.exclusive > 0,
        }
    }

    /// Give back every level still held. Returns how many holds were dropped.
    ///
    /// Every unlock is attempted; the first error is reported afterwards.
    pub fn release_all(&self) -> Result<u32> {
        let Held { shared, exclusive } = std::mem::take(&mut *self.held.lock());
        let mut first_err = None;
        let levels = std::iter::repeat_n(LockMode::Exclusive, exclusive as usize)
            .chain(std::iter::repeat_n(LockMode::Shared, shared as usize));
        for mode in levels {
            if let Err(err) = self.coordinator.unlock(self.node, self.resource, mode) {
                first_err.get_or_insert(err);
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(shared + exclusive),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryLockManager;

    #[test]
    fn handle_tracks_levels_and_releases_them() {
        let dlm = Arc::new(MemoryLockManager::new());
        let coordinator: Arc<dyn LockCoordinator> = Arc::clone(&dlm) as Arc<dyn LockCoordinator>;
        let handle = LockHandle::new(coordinator, NodeId(1), ObjectId(77), LockKind::Open);

        assert!(
            handle
                .lock(LockMode::Shared, LockWait::NonBlocking)
                .expect("lock")
                .is_granted()
        );
        assert!(handle.holds(LockMode::Shared));
        assert!(handle.try_upgrade(OnBusy::Keep).expect("upgrade").is_granted());
        assert!(handle.holds(LockMode::Exclusive));
        assert!(!handle.holds(LockMode::Shared));

        assert_eq!(handle.release_all().expect("release"), 1);
        assert!(dlm.holders(handle.resource()).is_empty());
        assert_eq!(handle.release_all().expect("release again"), 0);
    }

    #[test]
    fn refused_upgrade_with_release_forgets_the_shared_hold() {
        let dlm = Arc::new(MemoryLockManager::new());
        let a = LockHandle::new(
            Arc::clone(&dlm) as Arc<dyn LockCoordinator>,
            NodeId(1),
            ObjectId(8),
            LockKind::Open,
        );
        let b = LockHandle::new(
            Arc::clone(&dlm) as Arc<dyn LockCoordinator>,
            NodeId(2),
            ObjectId(8),
            LockKind::Open,
        );
        a.lock(LockMode::Shared, LockWait::Blocking).expect("a");
        b.lock(LockMode::Shared, LockWait::Blocking).expect("b");

        assert_eq!(a.try_upgrade(OnBusy::Release).expect("upgrade"), LockGrant::Busy);
        assert!(!a.holds(LockMode::Shared));
        assert_eq!(a.release_all().expect("release"), 0);
        assert_eq!(dlm.holders(a.resource()), vec![(NodeId(2), LockMode::Shared)]);
    }
}
