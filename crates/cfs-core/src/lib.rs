#![forbid(unsafe_code)]
//! Per-node object lifecycle engine.
//!
//! A [`NodeFs`] is one node's mount of a shared device. It owns the node's
//! object cache, journal, orphan registry and allocator access, and runs the
//! deletion state machine when the last local reference to an unlinked
//! object goes away. Nothing is process-wide: several `NodeFs` values over
//! one device and one [`MemoryLockManager`](cfs_dlm::MemoryLockManager)
//! behave like several nodes of a cluster.
//!
//! Lock order inside a node: object metadata lock, then an orphan directory
//! lock, then the allocator lock. The cache table mutex and a record's state
//! mutex are never held across a cluster lock call.

mod cache;
mod delete;
mod format;
mod ops;
mod recovery;
mod truncate;

pub use cache::OpenFlags;
pub use delete::{DeferReason, DeleteOutcome, DeleteReport, DeleteState, RetireReason};
pub use format::{FormatOptions, format_device, mkfs};
pub use ops::{Inspection, NewObject};
pub use recovery::RecoveryReport;
pub use truncate::{AuxiliaryStore, ClusterTruncator, RecordFlagStore, Truncator};

use cache::CacheInvalidator;
use cfs_alloc::{BitmapAllocator, SpaceAllocator};
use cfs_block::{BlockDevice, ByteBlockDevice, FileByteDevice, read_superblock_region};
use cfs_dlm::{
    LocalLockManager, LockCoordinator, LockGrant, LockHandle, LockKind, LockMode, LockWait,
};
use cfs_error::{CfsError, Result};
use cfs_inode::ObjectTable;
use cfs_journal::{Journal, JournalConfig};
use cfs_ondisk::{SUPERBLOCK_REGION_LEN, Superblock};
use cfs_orphan::OrphanRegistry;
use cfs_types::{ALLOC_BLOCK, BlockNumber, NodeId, ObjectId, SUPERBLOCK_BLOCK, SlotNumber};
use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::{info, warn};

/// Options for mounting a device on one node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountOptions {
    /// This node's identity towards the lock coordinator.
    pub node: NodeId,
    /// Ownership slot: new orphans of this node go to this slot's directory.
    pub slot: SlotNumber,
    /// Single-node mount: no cluster locks are taken at all.
    pub local_mount: bool,
    /// Unreferenced records kept cached. Default: 128.
    pub cache_capacity: usize,
    /// Clusters released per truncation transaction. Default: 64.
    pub truncate_batch_clusters: u32,
    pub journal: JournalConfig,
}

impl Default for MountOptions {
    fn default() -> Self {
        Self {
            node: NodeId(0),
            slot: SlotNumber(0),
            local_mount: false,
            cache_capacity: 128,
            truncate_batch_clusters: 64,
            journal: JournalConfig::default(),
        }
    }
}

/// External routines the deletion state machine calls while wiping.
pub struct Collaborators {
    pub truncator: Box<dyn Truncator>,
    pub auxiliary: Box<dyn AuxiliaryStore>,
}

impl std::fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collaborators").finish_non_exhaustive()
    }
}

impl Collaborators {
    /// Cluster-pool truncation and flag-only auxiliary storage.
    #[must_use]
    pub fn standard(options: &MountOptions) -> Self {
        Self {
            truncator: Box::new(ClusterTruncator::new(options.truncate_batch_clusters)),
            auxiliary: Box::new(RecordFlagStore),
        }
    }
}

/// Exclusive access to a shared system block: a local mutex against this
/// node's threads plus the block's cluster lock against other nodes.
struct SystemLock {
    local: Mutex<()>,
    cluster: LockHandle,
    clustered: bool,
}

impl SystemLock {
    fn lock(&self) -> Result<SystemGuard<'_>> {
        let local = self.local.lock();
        if self.clustered {
            match self.cluster.lock(LockMode::Exclusive, LockWait::Blocking)? {
                LockGrant::Granted => {}
                LockGrant::Busy => {
                    return Err(CfsError::LockBusy {
                        object: self.cluster.resource().object,
                    });
                }
            }
        }
        Ok(SystemGuard {
            lock: self,
            _local: local,
        })
    }
}

/// Held while a transaction touches a system block; released on drop.
pub struct SystemGuard<'a> {
    lock: &'a SystemLock,
    _local: MutexGuard<'a, ()>,
}

impl Drop for SystemGuard<'_> {
    fn drop(&mut self) {
        if !self.lock.clustered {
            return;
        }
        if let Err(err) = self.lock.cluster.unlock(LockMode::Exclusive) {
            warn!(
                target: "cfs::core",
                event = "system_unlock_failed",
                resource = %self.lock.cluster.resource(),
                error = %err
            );
        }
    }
}

/// One node's mount of a shared device.
pub struct NodeFs {
    options: MountOptions,
    superblock: Superblock,
    journal: Journal,
    dlm: Arc<dyn LockCoordinator>,
    allocator: BitmapAllocator,
    registry: OrphanRegistry,
    table: ObjectTable,
    truncator: Box<dyn Truncator>,
    auxiliary: Box<dyn AuxiliaryStore>,
    alloc_lock: SystemLock,
    orphan_locks: Vec<SystemLock>,
    next_generation: AtomicU32,
}

impl std::fmt::Debug for NodeFs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeFs")
            .field("options", &self.options)
            .field("superblock", &self.superblock)
            .field("journal", &self.journal)
            .field("table", &self.table)
            .finish_non_exhaustive()
    }
}

impl NodeFs {
    /// Mount `device` with the standard collaborators.
    pub fn mount(
        device: Arc<dyn BlockDevice>,
        dlm: Arc<dyn LockCoordinator>,
        options: MountOptions,
    ) -> Result<Arc<Self>> {
        let collaborators = Collaborators::standard(&options);
        Self::mount_with(device, dlm, options, collaborators)
    }

    /// Mount `device`, wiping through the given collaborators.
    pub fn mount_with(
        device: Arc<dyn BlockDevice>,
        dlm: Arc<dyn LockCoordinator>,
        options: MountOptions,
        collaborators: Collaborators,
    ) -> Result<Arc<Self>> {
        let raw = device.read_block(SUPERBLOCK_BLOCK)?;
        let superblock = Superblock::parse_region(raw.as_slice())?;
        if superblock.block_size != device.block_size() {
            return Err(CfsError::Format(format!(
                "superblock block_size {} does not match device block size {}",
                superblock.block_size,
                device.block_size()
            )));
        }
        if superblock.block_count > device.block_count() {
            return Err(CfsError::Format(format!(
                "superblock claims {} blocks, device has {}",
                superblock.block_count,
                device.block_count()
            )));
        }
        if options.slot.0 >= superblock.slot_count {
            return Err(CfsError::InvalidArgument(format!(
                "slot {} out of range (slot_count {})",
                options.slot, superblock.slot_count
            )));
        }

        let node = options.node;
        let clustered = !options.local_mount;
        let system_lock = |block: BlockNumber| SystemLock {
            local: Mutex::new(()),
            cluster: LockHandle::new(Arc::clone(&dlm), node, ObjectId::from(block), LockKind::Meta),
            clustered,
        };
        let registry = OrphanRegistry::new(superblock.slot_count);
        let alloc_lock = system_lock(ALLOC_BLOCK);
        let orphan_locks = superblock
            .slots()
            .map(|slot| registry.dir_block(slot).map(system_lock))
            .collect::<Result<Vec<_>>>()?;

        let fs = Arc::new(Self {
            journal: Journal::new(device, options.journal, node),
            table: ObjectTable::new(options.cache_capacity),
            allocator: BitmapAllocator::default(),
            truncator: collaborators.truncator,
            auxiliary: collaborators.auxiliary,
            dlm: Arc::clone(&dlm),
            registry,
            alloc_lock,
            orphan_locks,
            next_generation: AtomicU32::new(1),
            superblock,
            options,
        });
        if clustered {
            dlm.register_invalidation(node, Arc::new(CacheInvalidator::new(&fs)));
        }
        info!(
            target: "cfs::core",
            event = "mount",
            node = node.0,
            slot = fs.options.slot.0,
            local = fs.options.local_mount,
            fs_generation = fs.superblock.fs_generation.0,
            block_count = fs.superblock.block_count
        );
        Ok(fs)
    }

    /// Open an image file as a single-node mount.
    pub fn open_image(path: impl AsRef<Path>, mut options: MountOptions) -> Result<Arc<Self>> {
        let file = FileByteDevice::open(path)?;
        let region = read_superblock_region::<SUPERBLOCK_REGION_LEN>(&file)?;
        let superblock = Superblock::parse_region(&region)?;
        let device = ByteBlockDevice::new(file, superblock.block_size)?;
        options.local_mount = true;
        Self::mount(Arc::new(device), Arc::new(LocalLockManager), options)
    }

    #[must_use]
    pub fn options(&self) -> &MountOptions {
        &self.options
    }

    #[must_use]
    pub fn node(&self) -> NodeId {
        self.options.node
    }

    #[must_use]
    pub fn slot(&self) -> SlotNumber {
        self.options.slot
    }

    #[must_use]
    pub fn superblock(&self) -> &Superblock {
        &self.superblock
    }

    #[must_use]
    pub fn root(&self) -> ObjectId {
        self.superblock.root
    }

    #[must_use]
    pub fn journal(&self) -> &Journal {
        &self.journal
    }

    #[must_use]
    pub fn registry(&self) -> &OrphanRegistry {
        &self.registry
    }

    #[must_use]
    pub fn table(&self) -> &ObjectTable {
        &self.table
    }

    #[must_use]
    pub fn allocator(&self) -> &dyn SpaceAllocator {
        &self.allocator
    }

    /// Current allocator contents, read outside any transaction.
    pub fn allocator_snapshot(&self) -> Result<cfs_ondisk::AllocBlock> {
        self.allocator.snapshot(&self.journal)
    }

    #[must_use]
    pub fn lock_coordinator(&self) -> &Arc<dyn LockCoordinator> {
        &self.dlm
    }

    /// Take the allocator block for a transaction.
    pub fn lock_allocator(&self) -> Result<SystemGuard<'_>> {
        self.alloc_lock.lock()
    }

    /// Take `slot`'s orphan directory block for a transaction.
    pub fn lock_orphan_dir(&self, slot: SlotNumber) -> Result<SystemGuard<'_>> {
        self.orphan_locks
            .get(slot.index())
            .ok_or_else(|| CfsError::InvalidArgument(format!("slot {slot} out of range")))?
            .lock()
    }

    fn next_generation(&self) -> u32 {
        self.next_generation.fetch_add(1, Ordering::Relaxed)
    }

    fn block_len(&self) -> Result<usize> {
        usize::try_from(self.superblock.block_size)
            .map_err(|_| CfsError::Format("block_size does not fit usize".to_owned()))
    }
}

impl Drop for NodeFs {
    fn drop(&mut self) {
        self.unmount();
        if !self.options.local_mount {
            self.dlm.unregister_invalidation(self.options.node);
        }
    }
}
