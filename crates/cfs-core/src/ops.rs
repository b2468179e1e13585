//! Object lifecycle operations that set up deletion: create, link, unlink,
//! extend and attribute changes.

use crate::NodeFs;
use crate::cache::OpenFlags;
use cfs_alloc::SpaceAllocator;
use cfs_dlm::LockMode;
use cfs_error::{CfsError, Result};
use cfs_inode::{LocalFlags, ObjectKind, ObjectRecord};
use cfs_journal::credits;
use cfs_ondisk::{DiskRecord, OrphanEntry, Timestamp, validate_record};
use cfs_types::{
    ATTR_KNOWN_MASK, DYN_HAS_XATTR_FL, DYN_INDEXED_DIR_FL, DYN_INLINE_DATA_FL, ObjectId,
    RECORD_HAS_REFCOUNT_FL, RECORD_ORPHANED_FL, RECORD_SYSTEM_FL, S_IFREG, SlotNumber,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::debug;

pub(crate) fn now() -> Timestamp {
    let elapsed = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    Timestamp {
        sec: elapsed.as_secs(),
        nsec: elapsed.subsec_nanos(),
    }
}

/// Parameters for [`NodeFs::create`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewObject {
    pub mode: u16,
    pub uid: u32,
    pub gid: u32,
    /// Take the first free identity at or after this one.
    pub near: Option<ObjectId>,
    /// Per-object generation; drawn from the node's counter when unset.
    pub generation: Option<u32>,
    /// Mark the record as a system object.
    pub system: bool,
}

impl Default for NewObject {
    fn default() -> Self {
        Self {
            mode: S_IFREG | 0o644,
            uid: 0,
            gid: 0,
            near: None,
            generation: None,
            system: false,
        }
    }
}

impl NewObject {
    #[must_use]
    pub fn with_mode(mode: u16) -> Self {
        Self {
            mode,
            ..Self::default()
        }
    }
}

/// Raw view of a record block, valid or not.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Inspection {
    pub record: DiskRecord,
    /// Why the validator refuses the block, if it does.
    pub problem: Option<String>,
}

impl Inspection {
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.problem.is_none()
    }
}

impl NodeFs {
    /// Allocate an identity and write a fresh VALID record for it in one
    /// transaction. Returns a referenced record.
    pub fn create(&self, new: &NewObject) -> Result<Arc<ObjectRecord>> {
        let first_data = ObjectId::from(self.superblock.first_data_block());
        let near = new.near.unwrap_or(first_data);
        let hint = near.bitmap_bit()?;
        let generation = new.generation.unwrap_or_else(|| self.next_generation());

        let id = {
            let _alloc = self.lock_allocator()?;
            let mut tx = self.journal.begin(credits::CREATE)?;
            let id = ObjectId(u64::from(self.allocator.alloc(&mut tx, 1, hint)?));
            if id < first_data || id.0 >= self.superblock.block_count {
                return Err(CfsError::Format(format!(
                    "allocator handed out reserved or out-of-range block {id}"
                )));
            }
            let mut disk = DiskRecord::new_live(
                id,
                self.superblock.fs_generation,
                generation,
                new.mode,
                self.slot(),
            );
            disk.uid = new.uid;
            disk.gid = new.gid;
            let stamp = now();
            disk.atime = stamp;
            disk.mtime = stamp;
            disk.ctime = stamp;
            if new.system {
                disk.flags |= RECORD_SYSTEM_FL;
            }
            self.stage_record(&mut tx, &disk)?;
            tx.commit()?;
            id
        };
        debug!(
            target: "cfs::core",
            event = "object_created",
            object = id.0,
            generation,
            mode = new.mode
        );
        self.acquire(id, OpenFlags::empty())
    }

    /// Add a link.
    pub fn link(&self, record: &ObjectRecord) -> Result<()> {
        let _meta = self.lock_meta(record, LockMode::Exclusive)?;
        self.update_record(record, credits::RECORD_UPDATE, |disk, _| {
            if disk.link_count == 0 {
                return Err(CfsError::NotFound(format!(
                    "object {} has been unlinked",
                    disk.identity
                )));
            }
            disk.link_count = disk
                .link_count
                .checked_add(1)
                .ok_or_else(|| CfsError::InvalidArgument("link count overflow".to_owned()))?;
            disk.ctime = now();
            Ok(())
        })
    }

    /// Drop a link. Dropping the last one orphans the object into this node's
    /// slot in the same transaction; the object is deleted once the last
    /// reference anywhere goes away.
    pub fn unlink(&self, record: &ObjectRecord) -> Result<()> {
        let id = record.id();
        if id == self.superblock.root {
            return Err(CfsError::InvalidArgument("cannot unlink the root".to_owned()));
        }
        if record.is_deleted() {
            return Err(CfsError::Stale { object: id });
        }
        let _meta = self.lock_meta(record, LockMode::Exclusive)?;
        let (links, kind) = {
            let state = record.state();
            (state.disk.link_count, state.kind)
        };
        if links == 0 {
            return Err(CfsError::NotFound(format!("object {id} has no links left")));
        }
        // A directory's own "." link goes together with its last name.
        let orphaning = match kind {
            ObjectKind::Directory => links <= 2,
            _ => links == 1,
        };
        let slot = self.slot();

        if !orphaning {
            return self.update_record(record, credits::RECORD_UPDATE, |disk, _| {
                disk.link_count -= 1;
                disk.ctime = now();
                Ok(())
            });
        }

        let _orphan_dir = self.lock_orphan_dir(slot)?;
        self.update_record(record, credits::ORPHAN_ADD, |disk, tx| {
            disk.link_count = 0;
            disk.flags |= RECORD_ORPHANED_FL;
            disk.orphaned_slot = slot;
            disk.ctime = now();
            self.registry.add(tx, slot, id, disk.generation)
        })?;
        record.set_flags(LocalFlags::MAYBE_ORPHANED);
        debug!(
            target: "cfs::core",
            event = "object_orphaned",
            object = id.0,
            slot = slot.0
        );
        Ok(())
    }

    /// Claim `clusters` more data clusters and grow the size to at least
    /// `new_size`.
    pub fn extend(&self, record: &ObjectRecord, clusters: u32, new_size: u64) -> Result<()> {
        if !record.kind().has_data() {
            return Err(CfsError::InvalidArgument(format!(
                "object {} of kind {:?} has no data",
                record.id(),
                record.kind()
            )));
        }
        let _meta = self.lock_meta(record, LockMode::Exclusive)?;
        let _alloc = self.lock_allocator()?;
        self.update_record(record, credits::EXTEND, |disk, tx| {
            let total = disk.cluster_count.checked_add(clusters).ok_or(CfsError::NoSpace)?;
            if clusters > 0 {
                self.allocator.claim_clusters(tx, u64::from(clusters))?;
            }
            disk.cluster_count = total;
            disk.size = disk.size.max(new_size);
            disk.dynamic_flags &= !DYN_INLINE_DATA_FL;
            disk.mtime = now();
            Ok(())
        })
    }

    /// Record that the object carries extended attributes (`DYN_HAS_XATTR_FL`),
    /// inline data or an indexed directory.
    pub fn set_dynamic_flags(&self, record: &ObjectRecord, flags: u16) -> Result<()> {
        let known = DYN_HAS_XATTR_FL | DYN_INDEXED_DIR_FL | DYN_INLINE_DATA_FL;
        if flags & !known != 0 {
            return Err(CfsError::InvalidArgument(format!(
                "unknown dynamic flags {:#x}",
                flags & !known
            )));
        }
        let _meta = self.lock_meta(record, LockMode::Exclusive)?;
        self.update_record(record, credits::RECORD_UPDATE, |disk, _| {
            disk.dynamic_flags |= flags;
            Ok(())
        })
    }

    /// Record that the object shares extents through a refcount tree.
    pub fn mark_shared_extents(&self, record: &ObjectRecord) -> Result<()> {
        let _meta = self.lock_meta(record, LockMode::Exclusive)?;
        self.update_record(record, credits::RECORD_UPDATE, |disk, _| {
            disk.flags |= RECORD_HAS_REFCOUNT_FL;
            Ok(())
        })
    }

    /// Replace the attribute flags (SYNC, APPEND, IMMUTABLE, NOATIME, DIRSYNC).
    pub fn set_attr_flags(&self, record: &ObjectRecord, attr: u32) -> Result<()> {
        if attr & !ATTR_KNOWN_MASK != 0 {
            return Err(CfsError::InvalidArgument(format!(
                "unknown attribute flags {:#x}",
                attr & !ATTR_KNOWN_MASK
            )));
        }
        let _meta = self.lock_meta(record, LockMode::Exclusive)?;
        self.update_record(record, credits::RECORD_UPDATE, |disk, _| {
            disk.attr = attr;
            disk.ctime = now();
            Ok(())
        })
    }

    #[must_use]
    pub fn attr_flags(&self, record: &ObjectRecord) -> u32 {
        record.state().disk.attr
    }

    /// Decode `id`'s record block without trusting it.
    pub fn inspect(&self, id: ObjectId) -> Result<Inspection> {
        if id.0 >= self.superblock.block_count {
            return Err(CfsError::InvalidArgument(format!(
                "object {id} beyond the last block"
            )));
        }
        let raw = self.journal.read_block(id.block())?;
        let record = DiskRecord::parse(&raw)?;
        let problem = validate_record(&raw, id, self.superblock.fs_generation)
            .err()
            .map(|reason| reason.to_string());
        Ok(Inspection { record, problem })
    }

    /// Entries still present in `slot`'s orphan directory.
    pub fn scan_orphans(&self, slot: SlotNumber) -> Result<Vec<OrphanEntry>> {
        self.registry.scan(&self.journal, slot)
    }
}
