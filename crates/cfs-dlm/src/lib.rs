#![forbid(unsafe_code)]
//! Cluster lock coordinator interface.
//!
//! Each object has three named lock resources: metadata, open-reference and
//! read/write. Nodes take them in shared or exclusive mode, blocking or not.
//! The grant protocol between nodes is out of scope; [`MemoryLockManager`]
//! simulates a cluster of nodes inside one process and [`LocalLockManager`]
//! serves a single-node mount where every request is granted at once.

mod handle;
mod memory;

pub use handle::LockHandle;
pub use memory::MemoryLockManager;

use cfs_error::Result;
use cfs_types::{NodeId, ObjectId};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Which of an object's named locks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LockKind {
    /// Guards the record's on-disk fields. Releasing it exclusively tells
    /// other nodes their cached copy is stale.
    Meta,
    /// Held shared by every node that has the object referenced in memory.
    Open,
    ReadWrite,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LockMode {
    Shared,
    Exclusive,
}

impl LockMode {
    #[must_use]
    pub fn compatible_with(self, other: Self) -> bool {
        matches!((self, other), (Self::Shared, Self::Shared))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LockResource {
    pub object: ObjectId,
    pub kind: LockKind,
}

impl LockResource {
    #[must_use]
    pub fn new(object: ObjectId, kind: LockKind) -> Self {
        Self { object, kind }
    }
}

impl fmt::Display for LockResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self.kind {
            LockKind::Meta => 'M',
            LockKind::Open => 'O',
            LockKind::ReadWrite => 'W',
        };
        write!(f, "{tag}{:016x}", self.object.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockWait {
    Blocking,
    NonBlocking,
}

/// Outcome of a lock request that did not fail outright.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockGrant {
    Granted,
    /// An incompatible holder exists and the request was non-blocking.
    Busy,
}

impl LockGrant {
    #[must_use]
    pub fn is_granted(self) -> bool {
        self == Self::Granted
    }
}

/// What a refused upgrade does with the caller's shared hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnBusy {
    /// Keep holding shared.
    Keep,
    /// Drop the shared hold in the same step as the refusal.
    Release,
}

/// Receives notice that another node changed an object's metadata.
pub trait InvalidationSink: Send + Sync {
    fn invalidate(&self, object: ObjectId);
}

pub trait LockCoordinator: Send + Sync {
    fn lock(
        &self,
        node: NodeId,
        resource: LockResource,
        mode: LockMode,
        wait: LockWait,
    ) -> Result<LockGrant>;

    fn unlock(&self, node: NodeId, resource: LockResource, mode: LockMode) -> Result<()>;

    /// Convert the caller's single shared hold into an exclusive one, never
    /// blocking. Busy while any other hold on the resource exists.
    fn try_upgrade_exclusive(
        &self,
        node: NodeId,
        resource: LockResource,
        on_busy: OnBusy,
    ) -> Result<LockGrant>;

    fn register_invalidation(&self, node: NodeId, sink: Arc<dyn InvalidationSink>);

    fn unregister_invalidation(&self, node: NodeId);
}

/// Coordinator for a single-node mount: every request is granted.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalLockManager;

impl LockCoordinator for LocalLockManager {
    fn lock(&self, _: NodeId, _: LockResource, _: LockMode, _: LockWait) -> Result<LockGrant> {
        Ok(LockGrant::Granted)
    }

    fn unlock(&self, _: NodeId, _: LockResource, _: LockMode) -> Result<()> {
        Ok(())
    }

    fn try_upgrade_exclusive(&self, _: NodeId, _: LockResource, _: OnBusy) -> Result<LockGrant> {
        Ok(LockGrant::Granted)
    }

    fn register_invalidation(&self, _: NodeId, _: Arc<dyn InvalidationSink>) {}

    fn unregister_invalidation(&self, _: NodeId) {}
}
