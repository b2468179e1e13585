//! Collaborators the deletion state machine calls while wiping.

use crate::NodeFs;
use cfs_alloc::SpaceAllocator;
use cfs_error::Result;
use cfs_inode::ObjectRecord;
use cfs_journal::credits;
use cfs_types::{DYN_HAS_XATTR_FL, RECORD_HAS_REFCOUNT_FL};
use tracing::trace;

/// Frees an object's data clusters.
///
/// Called with the object's metadata lock held exclusively and its size
/// already committed as zero. May run several transactions; after each one
/// the record's cluster count must match what is still allocated.
pub trait Truncator: Send + Sync {
    fn truncate_to_zero(&self, fs: &NodeFs, record: &ObjectRecord) -> Result<()>;
}

/// Returns clusters to the allocator's pool in bounded batches.
#[derive(Debug, Clone, Copy)]
pub struct ClusterTruncator {
    batch: u32,
}

impl ClusterTruncator {
    #[must_use]
    pub fn new(batch: u32) -> Self {
        Self {
            batch: batch.max(1),
        }
    }

    #[must_use]
    pub fn batch(&self) -> u32 {
        self.batch
    }
}

impl Truncator for ClusterTruncator {
    fn truncate_to_zero(&self, fs: &NodeFs, record: &ObjectRecord) -> Result<()> {
        loop {
            let remaining = record.disk().cluster_count;
            if remaining == 0 {
                return Ok(());
            }
            let released = remaining.min(self.batch);
            let _alloc = fs.lock_allocator()?;
            fs.update_record(record, credits::TRUNCATE_BATCH, |disk, tx| {
                fs.allocator().release_clusters(tx, u64::from(released))?;
                disk.cluster_count -= released;
                Ok(())
            })?;
            trace!(
                target: "cfs::delete",
                event = "truncate_batch",
                object = record.id().0,
                released,
                remaining = remaining - released
            );
        }
    }
}

/// Removes extended attributes and shared-extent bookkeeping.
pub trait AuxiliaryStore: Send + Sync {
    fn detach(&self, fs: &NodeFs, record: &ObjectRecord) -> Result<()>;
}

/// Auxiliary storage known only through record flags; detaching clears them.
#[derive(Debug, Default, Clone, Copy)]
pub struct RecordFlagStore;

impl AuxiliaryStore for RecordFlagStore {
    fn detach(&self, fs: &NodeFs, record: &ObjectRecord) -> Result<()> {
        let disk = record.disk();
        if disk.dynamic_flags & DYN_HAS_XATTR_FL == 0 && !disk.has_refcounted_extents() {
            return Ok(());
        }
        fs.update_record(record, credits::RECORD_UPDATE, |disk, _| {
            disk.dynamic_flags &= !DYN_HAS_XATTR_FL;
            disk.flags &= !RECORD_HAS_REFCOUNT_FL;
            Ok(())
        })
    }
}
