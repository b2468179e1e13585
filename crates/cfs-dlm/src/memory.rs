//! In-process lock manager serving several simulated nodes.

use crate::{
    InvalidationSink, LockCoordinator, LockGrant, LockKind, LockMode, LockResource, LockWait,
    OnBusy,
};
use cfs_error::{CfsError, Result};
use cfs_types::NodeId;
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, trace};

#[derive(Default)]
struct Table {
    /// Multiset of holds; one node may hold the same resource several times.
    holders: HashMap<LockResource, Vec<(NodeId, LockMode)>>,
    down: HashSet<NodeId>,
    sinks: HashMap<NodeId, Arc<dyn InvalidationSink>>,
}

impl Table {
    fn grantable(&self, resource: LockResource, mode: LockMode) -> bool {
        self.holders
            .get(&resource)
            .is_none_or(|holds| holds.iter().all(|&(_, held)| mode.compatible_with(held)))
    }

    fn ensure_up(&self, node: NodeId) -> Result<()> {
        if self.down.contains(&node) {
            return Err(CfsError::NodeDown { node });
        }
        Ok(())
    }

    fn remove_hold(&mut self, node: NodeId, resource: LockResource, mode: LockMode) -> bool {
        let Some(holds) = self.holders.get_mut(&resource) else {
            return false;
        };
        let Some(pos) = holds.iter().position(|&h| h == (node, mode)) else {
            return false;
        };
        holds.swap_remove(pos);
        if holds.is_empty() {
            self.holders.remove(&resource);
        }
        true
    }
}

/// Lock manager shared by every simulated node of one cluster.
///
/// Exclusive holds conflict with every other hold, including other holds by
/// the same node, so two local records of one object behave like two nodes.
pub struct MemoryLockManager {
    table: Mutex<Table>,
    released: Condvar,
}

impl Default for MemoryLockManager {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemoryLockManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let table = self.table.lock();
        f.debug_struct("MemoryLockManager")
            .field("resources", &table.holders.len())
            .field("down", &table.down)
            .finish_non_exhaustive()
    }
}

impl MemoryLockManager {
    #[must_use]
    pub fn new() -> Self {
        Self {
            table: Mutex::new(Table::default()),
            released: Condvar::new(),
        }
    }

    /// Current holds on `resource`.
    #[must_use]
    pub fn holders(&self, resource: LockResource) -> Vec<(NodeId, LockMode)> {
        self.table
            .lock()
            .holders
            .get(&resource)
            .cloned()
            .unwrap_or_default()
    }

    /// Simulate a node crash: every lock it held is dropped and later
    /// requests from it fail with `NodeDown` until [`node_up`](Self::node_up).
    pub fn node_down(&self, node: NodeId) {
        let mut table = self.table.lock();
        table.down.insert(node);
        table.sinks.remove(&node);
        let mut dropped = 0_usize;
        table.holders.retain(|_, holds| {
            let before = holds.len();
            holds.retain(|&(holder, _)| holder != node);
            dropped += before - holds.len();
            !holds.is_empty()
        });
        drop(table);
        self.released.notify_all();
        debug!(target: "cfs::dlm", event = "node_down", node = node.0, dropped);
    }

    /// Let a previously crashed node rejoin (a remount).
    pub fn node_up(&self, node: NodeId) {
        self.table.lock().down.remove(&node);
        debug!(target: "cfs::dlm", event = "node_up", node = node.0);
    }
}

impl LockCoordinator for MemoryLockManager {
    fn lock(
        &self,
        node: NodeId,
        resource: LockResource,
        mode: LockMode,
        wait: LockWait,
    ) -> Result<LockGrant> {
        let mut table = self.table.lock();
        loop {
            table.ensure_up(node)?;
            if table.grantable(resource, mode) {
                table
                    .holders
                    .entry(resource)
                    .or_default()
                    .push((node, mode));
                trace!(
                    target: "cfs::dlm",
                    event = "lock_granted",
                    node = node.0,
                    resource = %resource,
                    ?mode
                );
                return Ok(LockGrant::Granted);
            }
            if wait == LockWait::NonBlocking {
                trace!(
                    target: "cfs::dlm",
                    event = "lock_busy",
                    node = node.0,
                    resource = %resource,
                    ?mode
                );
                return Ok(LockGrant::Busy);
            }
            self.released.wait(&mut table);
        }
    }

    fn unlock(&self, node: NodeId, resource: LockResource, mode: LockMode) -> Result<()> {
        let mut table = self.table.lock();
        if !table.remove_hold(node, resource, mode) {
            return Err(CfsError::InvalidArgument(format!(
                "{node} does not hold {resource} in {mode:?} mode"
            )));
        }
        let notify: Vec<Arc<dyn InvalidationSink>> =
            if resource.kind == LockKind::Meta && mode == LockMode::Exclusive {
                table
                    .sinks
                    .iter()
                    .filter(|(other, _)| **other != node)
                    .map(|(_, sink)| Arc::clone(sink))
                    .collect()
            } else {
                Vec::new()
            };
        drop(table);
        self.released.notify_all();
        trace!(
            target: "cfs::dlm",
            event = "lock_released",
            node = node.0,
            resource = %resource,
            ?mode,
            invalidations = notify.len()
        );
        // Sinks run outside the table lock; they may take locks of their own.
        for sink in notify {
            sink.invalidate(resource.object);
        }
        Ok(())
    }

    fn try_upgrade_exclusive(
        &self,
        node: NodeId,
        resource: LockResource,
        on_busy: OnBusy,
    ) -> Result<LockGrant> {
        let mut table = self.table.lock();
        table.ensure_up(node)?;
        let Some(holds) = table.holders.get_mut(&resource) else {
            return Err(CfsError::InvalidArgument(format!(
                "{node} holds nothing on {resource} to upgrade"
            )));
        };
        let Some(pos) = holds
            .iter()
            .position(|&h| h == (node, LockMode::Shared))
        else {
            return Err(CfsError::InvalidArgument(format!(
                "{node} holds no shared lock on {resource} to upgrade"
            )));
        };

        if holds.len() == 1 {
            holds[pos].1 = LockMode::Exclusive;
            drop(table);
            debug!(
                target: "cfs::dlm",
                event = "upgrade_granted",
                node = node.0,
                resource = %resource
            );
            return Ok(LockGrant::Granted);
        }

        let others = holds.len() - 1;
        if on_busy == OnBusy::Release {
            table.remove_hold(node, resource, LockMode::Shared);
        }
        drop(table);
        if on_busy == OnBusy::Release {
            self.released.notify_all();
        }
        debug!(
            target: "cfs::dlm",
            event = "upgrade_busy",
            node = node.0,
            resource = %resource,
            others,
            released = on_busy == OnBusy::Release
        );
        Ok(LockGrant::Busy)
    }

    fn register_invalidation(&self, node: NodeId, sink: Arc<dyn InvalidationSink>) {
        self.table.lock().sinks.insert(node, sink);
    }

    fn unregister_invalidation(&self, node: NodeId) {
        self.table.lock().sinks.remove(&node);
    }
}
