//! Object cache: loading, reference drops and metadata-lock refresh.

use crate::NodeFs;
use crate::delete::DeleteReport;
use cfs_dlm::{InvalidationSink, LockGrant, LockMode, LockWait};
use cfs_error::{CfsError, RecordCorruption, Result};
use cfs_inode::{Acquire, LoadTicket, LocalFlags, ObjectRecord, RecordLocks, RecordState, Release};
use cfs_journal::Handle;
use cfs_ondisk::DiskRecord;
use cfs_types::ObjectId;
use parking_lot::MutexGuard;
use std::ops::BitOr;
use std::sync::{Arc, Weak};
use tracing::{debug, trace, warn};

/// How an object is being opened.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct OpenFlags(u32);

impl OpenFlags {
    /// System object: no cluster locks, and the on-disk SYSTEM flag must be set.
    pub const SYSTEM: Self = Self(0x1);
    /// Orphan recovery: no metadata lock, and a busy open-reference lock is
    /// reported as `LockBusy` instead of waited for.
    pub const ORPHAN_RECOVERY: Self = Self(0x2);

    #[must_use]
    pub const fn empty() -> Self {
        Self(0)
    }

    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for OpenFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Forwards another node's metadata changes to this node's cache.
pub(crate) struct CacheInvalidator {
    fs: Weak<NodeFs>,
}

impl CacheInvalidator {
    pub(crate) fn new(fs: &Arc<NodeFs>) -> Self {
        Self {
            fs: Arc::downgrade(fs),
        }
    }
}

impl InvalidationSink for CacheInvalidator {
    fn invalidate(&self, object: ObjectId) {
        if let Some(fs) = self.fs.upgrade() {
            fs.invalidate_cached(object);
        }
    }
}

/// A held metadata lock. While it lives the record's cached fields match disk.
pub(crate) struct MetaGuard<'r> {
    record: &'r ObjectRecord,
    mode: LockMode,
    clustered: bool,
    _io: Option<MutexGuard<'r, ()>>,
}

impl Drop for MetaGuard<'_> {
    fn drop(&mut self) {
        if !self.clustered {
            return;
        }
        if let Err(err) = self.record.meta_lock().unlock(self.mode) {
            warn!(
                target: "cfs::cache",
                event = "meta_unlock_failed",
                object = self.record.id().0,
                error = %err
            );
        }
    }
}

/// The object may have lost its last link, here or on another node.
fn wants_delete(record: &ObjectRecord) -> bool {
    let state = record.state();
    state.flags.contains(LocalFlags::MAYBE_ORPHANED) || state.disk.link_count == 0
}

fn require_grant(grant: LockGrant, object: ObjectId) -> Result<()> {
    match grant {
        LockGrant::Granted => Ok(()),
        LockGrant::Busy => Err(CfsError::LockBusy { object }),
    }
}

impl NodeFs {
    fn check_identity(&self, id: ObjectId) -> Result<()> {
        if id.0 == 0 {
            return Err(CfsError::InvalidArgument("object identity 0".to_owned()));
        }
        if self.superblock.is_system_block(id) {
            return Err(CfsError::InvalidArgument(format!(
                "block {id} holds filesystem metadata, not an object record"
            )));
        }
        if id.0 >= self.superblock.block_count {
            return Err(CfsError::InvalidArgument(format!(
                "object {id} beyond the last block {}",
                self.superblock.block_count - 1
            )));
        }
        Ok(())
    }

    /// Read and validate `id`'s record block.
    pub(crate) fn read_disk(&self, id: ObjectId) -> Result<DiskRecord> {
        let raw = self.journal.read_block(id.block())?;
        DiskRecord::parse_validated(&raw, id, self.superblock.fs_generation).map_err(|reason| {
            debug!(
                target: "cfs::cache",
                event = "record_rejected",
                object = id.0,
                reason = %reason
            );
            CfsError::Corruption {
                block: id.0,
                reason,
            }
        })
    }

    /// Reference `id`, loading it from disk on a miss.
    ///
    /// Concurrent acquires of one identity share a single load. A failed load
    /// leaves nothing cached and gives back every lock it took.
    pub fn acquire(&self, id: ObjectId, flags: OpenFlags) -> Result<Arc<ObjectRecord>> {
        self.check_identity(id)?;
        match self.table.acquire(id) {
            Acquire::Hit(record) => Ok(record),
            Acquire::Miss(ticket) => self.load(ticket, flags),
        }
    }

    fn load(&self, ticket: LoadTicket<'_>, flags: OpenFlags) -> Result<Arc<ObjectRecord>> {
        let id = ticket.id();
        let locks = RecordLocks::new(&self.dlm, self.node(), id);
        match self.populate(id, &locks, flags) {
            Ok(state) => {
                trace!(
                    target: "cfs::cache",
                    event = "record_loaded",
                    object = id.0,
                    kind = ?state.kind,
                    link_count = state.disk.link_count
                );
                Ok(ticket.complete(Arc::new(ObjectRecord::new(id, state, locks))))
            }
            Err(err) => {
                if let Err(unlock_err) = locks.release_all() {
                    warn!(
                        target: "cfs::cache",
                        event = "load_unlock_failed",
                        object = id.0,
                        error = %unlock_err
                    );
                }
                debug!(
                    target: "cfs::cache",
                    event = "load_failed",
                    object = id.0,
                    error = %err
                );
                Err(err)
            }
        }
    }

    fn populate(&self, id: ObjectId, locks: &RecordLocks, flags: OpenFlags) -> Result<RecordState> {
        let system = flags.contains(OpenFlags::SYSTEM);
        let clustered = !system && !self.options.local_mount;
        let recovery = flags.contains(OpenFlags::ORPHAN_RECOVERY);
        if clustered {
            if recovery {
                require_grant(locks.open.lock(LockMode::Shared, LockWait::NonBlocking)?, id)?;
            } else {
                require_grant(locks.open.lock(LockMode::Shared, LockWait::Blocking)?, id)?;
                require_grant(locks.meta.lock(LockMode::Shared, LockWait::Blocking)?, id)?;
            }
        }
        let disk = self.read_disk(id)?;
        if clustered && !recovery {
            locks.meta.unlock(LockMode::Shared)?;
        }
        RecordState::populate(disk, system)
    }

    /// Reference a cached record without touching the disk.
    #[must_use]
    pub fn lookup(&self, id: ObjectId) -> Option<Arc<ObjectRecord>> {
        self.table.lookup(id)
    }

    /// Drop a reference.
    ///
    /// The last reference to an unlinked (or possibly remotely unlinked)
    /// object runs the deletion state machine and returns its report. Busy
    /// and guard outcomes are part of the report, never errors.
    pub fn release(&self, record: Arc<ObjectRecord>) -> Result<Option<DeleteReport>> {
        let released = self
            .table
            .release(&record, |rec| rec.is_deleted() || wants_delete(rec))?;
        drop(record);
        match released {
            Release::Referenced => Ok(None),
            Release::Cached { evicted } => {
                for victim in evicted {
                    self.teardown(&victim);
                }
                Ok(None)
            }
            Release::Dropping(record) => {
                let report = (!record.is_deleted()).then(|| self.run_delete(&record));
                self.teardown(&record);
                Ok(report)
            }
        }
    }

    /// Empty the cache, giving back every cluster lock this node holds on
    /// an object.
    ///
    /// Idle records of unlinked objects get one last delete attempt, so an
    /// object this node was the last to hold is wiped here and any other is
    /// left orphaned for its remaining holders. Records still referenced by
    /// callers lose their locks without an attempt; releasing them afterwards
    /// fails. The mount stays usable and reloads from disk.
    pub fn unmount(&self) -> Vec<DeleteReport> {
        let crashed = self.journal.is_crashed();
        let mut reports = Vec::new();
        let mut referenced = 0_usize;
        for (record, refs) in self.table.drain() {
            if refs > 0 {
                referenced += 1;
                warn!(
                    target: "cfs::cache",
                    event = "referenced_at_unmount",
                    object = record.id().0,
                    refs
                );
            } else if !crashed && !record.is_deleted() && wants_delete(&record) {
                reports.push(self.run_delete(&record));
            }
            self.teardown(&record);
        }
        debug!(
            target: "cfs::cache",
            event = "cache_emptied",
            node = self.node().0,
            deletes = reports.len(),
            referenced
        );
        reports
    }

    /// Drop unreferenced records until at most `keep` remain cached.
    pub fn shrink(&self, keep: usize) -> usize {
        let victims = self.table.shrink(keep);
        for victim in &victims {
            self.teardown(victim);
        }
        victims.len()
    }

    /// Confirm a referenced record still names a live object, refreshing its
    /// cached fields if another node changed them.
    pub fn revalidate(&self, record: &ObjectRecord) -> Result<()> {
        if record.is_deleted() {
            return Err(CfsError::NotFound(format!(
                "object {} has been deleted",
                record.id()
            )));
        }
        let _meta = self.lock_meta(record, LockMode::Shared)?;
        Ok(())
    }

    /// Stage the record's cached persisted fields into `tx`.
    pub fn mark_dirty(&self, tx: &mut Handle<'_>, record: &ObjectRecord) -> Result<()> {
        self.stage_record(tx, &record.disk())
    }

    pub(crate) fn stage_record(&self, tx: &mut Handle<'_>, disk: &DiskRecord) -> Result<()> {
        tx.write_block(disk.identity.block(), disk.encode(self.block_len()?)?)
    }

    /// Change `record` in one transaction of `credits`.
    ///
    /// `f` edits a copy of the persisted fields and may stage other blocks;
    /// the cached copy is replaced only once the commit succeeded. The caller
    /// holds the record's metadata lock exclusively.
    pub fn update_record<T>(
        &self,
        record: &ObjectRecord,
        credits: u32,
        f: impl FnOnce(&mut DiskRecord, &mut Handle<'_>) -> Result<T>,
    ) -> Result<T> {
        let mut disk = record.disk();
        let mut tx = self.journal.begin(credits)?;
        let out = f(&mut disk, &mut tx)?;
        self.stage_record(&mut tx, &disk)?;
        tx.commit()?;
        record.state().disk = disk;
        Ok(out)
    }

    /// Take `record`'s metadata lock, refreshing a stale cached copy.
    ///
    /// Exclusive mode also holds the record's I/O mutex so that threads of
    /// this node are serialized even on a single-node mount.
    pub(crate) fn lock_meta<'r>(
        &self,
        record: &'r ObjectRecord,
        mode: LockMode,
    ) -> Result<MetaGuard<'r>> {
        let io = (mode == LockMode::Exclusive).then(|| record.io());
        let clustered = !self.options.local_mount;
        if clustered {
            require_grant(record.meta_lock().lock(mode, LockWait::Blocking)?, record.id())?;
        }
        let guard = MetaGuard {
            record,
            mode,
            clustered,
            _io: io,
        };
        if record.is_stale() {
            self.refresh(record)?;
        }
        Ok(guard)
    }

    /// Re-read and re-validate the record block, replacing the cached copy.
    ///
    /// A record whose VALID flag is gone was wiped elsewhere: it is flagged
    /// DELETED and reported as `Stale`.
    pub(crate) fn refresh(&self, record: &ObjectRecord) -> Result<()> {
        match self.read_disk(record.id()) {
            Ok(disk) => {
                record.state().refresh(disk);
                trace!(target: "cfs::cache", event = "record_refreshed", object = record.id().0);
                Ok(())
            }
            Err(CfsError::Corruption {
                reason: RecordCorruption::NotValid { .. },
                ..
            }) => {
                record.set_flags(LocalFlags::DELETED);
                debug!(target: "cfs::cache", event = "record_gone", object = record.id().0);
                Err(CfsError::Stale {
                    object: record.id(),
                })
            }
            Err(err) => Err(err),
        }
    }

    /// Another node released the object's metadata lock after changing it.
    ///
    /// A referenced record is marked stale and possibly orphaned; an idle
    /// cached one is dropped so its open-reference lock stops holding up a
    /// remote delete.
    pub(crate) fn invalidate_cached(&self, object: ObjectId) {
        let Some(record) = self.table.peek(object) else {
            return;
        };
        record.invalidate();
        trace!(target: "cfs::cache", event = "record_invalidated", object = object.0);
        if let Some(idle) = self.table.take_unreferenced(object) {
            debug!(target: "cfs::cache", event = "idle_record_dropped", object = object.0);
            self.teardown(&idle);
        }
    }

    /// Give back a Freeing record's locks and remove it from the table.
    fn teardown(&self, record: &ObjectRecord) {
        if let Err(err) = record.release_locks() {
            warn!(
                target: "cfs::cache",
                event = "evict_unlock_failed",
                object = record.id().0,
                error = %err
            );
        }
        self.table.finish_free(record.id());
    }
}
