#![forbid(unsafe_code)]
//! In-memory object records.
//!
//! An [`ObjectRecord`] is one node's view of an on-disk object: a cached copy
//! of the persisted fields, node-local state flags, and handles for the
//! object's three cluster locks. Records are shared through `Arc` and found
//! through the [`ObjectTable`], which guarantees at most one record per
//! identity on a node.

mod table;

pub use table::{Acquire, LoadTicket, ObjectTable, Release};

use cfs_dlm::{LockCoordinator, LockHandle, LockKind};
use cfs_error::{CfsError, Result};
use cfs_ondisk::DiskRecord;
use cfs_types::{
    NodeId, ObjectId, RECORD_BITMAP_FL, RECORD_SUPERBLOCK_FL, S_IFDIR, S_IFLNK, S_IFMT, S_IFREG,
};
use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Object type, selecting type-specific deletion steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ObjectKind {
    Regular,
    Directory,
    Symlink,
    /// Devices, FIFOs and sockets.
    Special,
}

impl ObjectKind {
    #[must_use]
    pub fn from_mode(mode: u16) -> Self {
        match mode & S_IFMT {
            S_IFREG => Self::Regular,
            S_IFDIR => Self::Directory,
            S_IFLNK => Self::Symlink,
            _ => Self::Special,
        }
    }

    /// Whether objects of this kind own data clusters that truncation frees.
    #[must_use]
    pub fn has_data(self) -> bool {
        !matches!(self, Self::Special)
    }
}

/// Node-local state flags; never written to disk.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct LocalFlags(u32);

impl LocalFlags {
    /// Deletion does not require an orphan directory entry.
    pub const SKIP_ORPHAN_DIR: Self = Self(0x01);
    /// Another node may have unlinked the object; recheck on final release.
    pub const MAYBE_ORPHANED: Self = Self(0x02);
    /// Wiped; the record must never be trusted again.
    pub const DELETED: Self = Self(0x04);
    pub const IS_SYSTEM: Self = Self(0x08);
    /// Never run the deletion protocol for this record.
    pub const SKIP_DELETE: Self = Self(0x10);
    pub const BITMAP: Self = Self(0x20);

    #[must_use]
    pub const fn empty() -> Self {
        Self(0)
    }

    #[must_use]
    pub const fn bits(self) -> u32 {
        self.0
    }

    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: Self) {
        self.0 &= !other.0;
    }
}

impl fmt::Debug for LocalFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(LocalFlags, &str); 6] = [
            (LocalFlags::SKIP_ORPHAN_DIR, "SKIP_ORPHAN_DIR"),
            (LocalFlags::MAYBE_ORPHANED, "MAYBE_ORPHANED"),
            (LocalFlags::DELETED, "DELETED"),
            (LocalFlags::IS_SYSTEM, "IS_SYSTEM"),
            (LocalFlags::SKIP_DELETE, "SKIP_DELETE"),
            (LocalFlags::BITMAP, "BITMAP"),
        ];
        let mut set = f.debug_set();
        for (flag, name) in NAMES {
            if self.contains(flag) {
                set.entry(&format_args!("{name}"));
            }
        }
        set.finish()
    }
}

/// Fields guarded by the record mutex.
#[derive(Debug, Clone)]
pub struct RecordState {
    pub disk: DiskRecord,
    pub kind: ObjectKind,
    pub flags: LocalFlags,
    /// Another node changed the on-disk record; refresh before trusting.
    pub stale: bool,
}

impl RecordState {
    /// State for a freshly loaded record.
    ///
    /// `system_open` says the caller opened the object as a system object;
    /// the on-disk SYSTEM flag must then be set.
    pub fn populate(disk: DiskRecord, system_open: bool) -> Result<Self> {
        if disk.flags & RECORD_SUPERBLOCK_FL != 0 {
            return Err(CfsError::Format(format!(
                "object {} is a superblock record",
                disk.identity
            )));
        }
        if system_open && !disk.is_system() {
            return Err(CfsError::Format(format!(
                "object {} opened as system object without the SYSTEM flag",
                disk.identity
            )));
        }
        let mut flags = LocalFlags::empty();
        if disk.is_system() {
            flags.insert(LocalFlags::IS_SYSTEM);
        }
        if disk.flags & RECORD_BITMAP_FL != 0 {
            flags.insert(LocalFlags::BITMAP);
        }
        Ok(Self {
            kind: ObjectKind::from_mode(disk.mode),
            disk,
            flags,
            stale: false,
        })
    }

    /// Replace the cached disk fields with a freshly validated copy, keeping
    /// local flags.
    pub fn refresh(&mut self, disk: DiskRecord) {
        self.kind = ObjectKind::from_mode(disk.mode);
        self.disk = disk;
        self.stale = false;
    }
}

/// An object's three cluster locks as held by one node.
///
/// Built before the record itself so the locks can be taken ahead of the
/// first disk read.
#[derive(Debug)]
pub struct RecordLocks {
    pub meta: LockHandle,
    pub open: LockHandle,
    pub rw: LockHandle,
}

impl RecordLocks {
    #[must_use]
    pub fn new(coordinator: &Arc<dyn LockCoordinator>, node: NodeId, id: ObjectId) -> Self {
        let handle = |kind| LockHandle::new(Arc::clone(coordinator), node, id, kind);
        Self {
            meta: handle(LockKind::Meta),
            open: handle(LockKind::Open),
            rw: handle(LockKind::ReadWrite),
        }
    }

    /// Give back every level still held on all three locks.
    ///
    /// All three handles are released even if one fails.
    pub fn release_all(&self) -> Result<u32> {
        let results = [
            self.meta.release_all(),
            self.rw.release_all(),
            self.open.release_all(),
        ];
        let mut dropped = 0;
        for result in results {
            dropped += result?;
        }
        Ok(dropped)
    }
}

/// One node's in-memory record of an object.
pub struct ObjectRecord {
    id: ObjectId,
    state: Mutex<RecordState>,
    /// Serializes disk I/O against this record, separately from field access.
    io: Mutex<()>,
    locks: RecordLocks,
}

impl fmt::Debug for ObjectRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectRecord")
            .field("id", &self.id)
            .field("state", &*self.state.lock())
            .finish_non_exhaustive()
    }
}

impl ObjectRecord {
    #[must_use]
    pub fn new(id: ObjectId, state: RecordState, locks: RecordLocks) -> Self {
        Self {
            id,
            state: Mutex::new(state),
            io: Mutex::new(()),
            locks,
        }
    }

    #[must_use]
    pub fn id(&self) -> ObjectId {
        self.id
    }

    pub fn state(&self) -> MutexGuard<'_, RecordState> {
        self.state.lock()
    }

    pub fn io(&self) -> MutexGuard<'_, ()> {
        self.io.lock()
    }

    #[must_use]
    pub fn meta_lock(&self) -> &LockHandle {
        &self.locks.meta
    }

    #[must_use]
    pub fn open_lock(&self) -> &LockHandle {
        &self.locks.open
    }

    #[must_use]
    pub fn rw_lock(&self) -> &LockHandle {
        &self.locks.rw
    }

    /// Copy of the cached persisted fields.
    #[must_use]
    pub fn disk(&self) -> DiskRecord {
        self.state.lock().disk.clone()
    }

    #[must_use]
    pub fn kind(&self) -> ObjectKind {
        self.state.lock().kind
    }

    #[must_use]
    pub fn flags(&self) -> LocalFlags {
        self.state.lock().flags
    }

    pub fn set_flags(&self, flags: LocalFlags) {
        self.state.lock().flags.insert(flags);
    }

    #[must_use]
    pub fn is_deleted(&self) -> bool {
        self.flags().contains(LocalFlags::DELETED)
    }

    /// Mark stale and possibly orphaned after a remote metadata change.
    pub fn invalidate(&self) {
        let mut state = self.state.lock();
        state.stale = true;
        state.flags.insert(LocalFlags::MAYBE_ORPHANED);
    }

    #[must_use]
    pub fn is_stale(&self) -> bool {
        self.state.lock().stale
    }

    /// Give back every cluster lock level this record still holds.
    pub fn release_locks(&self) -> Result<u32> {
        self.locks.release_all()
    }
}
