//! Deletion state machine.
//!
//! Runs on the last local release of an unlinked object:
//!
//! ```text
//! Live -> CandidateForDelete -> AttemptExclusiveOpen -> Wiping
//!      -> DetachingAuxiliaryStorage -> Detaching -> Deleted
//! ```
//!
//! with `Retired` (guard failed, nothing done), `Deferred` (another node
//! still has the object open, or its orphan slot is being recovered) and
//! `Failed` (I/O, corruption or exhaustion) as the other terminal states.
//! Every transaction leaves the object durably ORPHANED until the single
//! detach transaction clears VALID, removes the orphan entry and frees the
//! identity bit together, so any attempt can resume from disk.

use crate::NodeFs;
use crate::ops::now;
use cfs_alloc::SpaceAllocator;
use cfs_dlm::{LockMode, OnBusy};
use cfs_error::{CfsError, Result};
use cfs_inode::{LocalFlags, ObjectKind, ObjectRecord};
use cfs_journal::credits;
use cfs_types::{
    DYN_INDEXED_DIR_FL, DYN_INLINE_DATA_FL, ObjectId, RECORD_ORPHANED_FL, RECORD_VALID_FL,
    SlotNumber,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeleteState {
    Live,
    CandidateForDelete,
    AttemptExclusiveOpen,
    Wiping,
    DetachingAuxiliaryStorage,
    Detaching,
    Deleted,
    Deferred,
    Retired,
    Failed,
}

/// Why a delete attempt stopped without wiping. The object stays orphaned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeferReason {
    /// Another node holds the open-reference lock; the last one out wipes.
    OpenElsewhere,
    /// The orphan slot is being recovered; recovery will retry it.
    SlotRecovering,
}

/// Why an object was simply dropped from the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RetireReason {
    Root,
    SystemObject,
    SkipDelete,
    AlreadyDeleted,
    /// The on-disk record still has links.
    StillLinked,
    /// Unlinked but not orphaned because a shared-extent operation owns it.
    SharedExtents,
}

#[derive(Debug)]
pub enum DeleteOutcome {
    Deleted,
    Deferred(DeferReason),
    Retired(RetireReason),
    /// The attempt was aborted; the object is still ORPHANED on disk.
    Failed(CfsError),
}

impl DeleteOutcome {
    fn terminal_state(&self) -> DeleteState {
        match self {
            Self::Deleted => DeleteState::Deleted,
            Self::Deferred(_) => DeleteState::Deferred,
            Self::Retired(_) => DeleteState::Retired,
            Self::Failed(_) => DeleteState::Failed,
        }
    }
}

/// Result of one run of the state machine, with every state it visited.
#[derive(Debug)]
pub struct DeleteReport {
    pub object: ObjectId,
    pub trace: Vec<DeleteState>,
    pub outcome: DeleteOutcome,
}

impl DeleteReport {
    #[must_use]
    pub fn final_state(&self) -> DeleteState {
        self.outcome.terminal_state()
    }

    #[must_use]
    pub fn visited(&self, state: DeleteState) -> bool {
        self.trace.contains(&state)
    }

    #[must_use]
    pub fn is_deleted(&self) -> bool {
        matches!(self.outcome, DeleteOutcome::Deleted)
    }

    /// Surface a failed attempt as its error.
    pub fn into_result(self) -> Result<Self> {
        match self.outcome {
            DeleteOutcome::Failed(err) => Err(err),
            outcome => Ok(Self { outcome, ..self }),
        }
    }
}

struct Run {
    object: ObjectId,
    trace: Vec<DeleteState>,
}

impl Run {
    fn enter(&mut self, state: DeleteState) {
        trace!(
            target: "cfs::delete",
            event = "delete_state",
            object = self.object.0,
            ?state
        );
        self.trace.push(state);
    }
}

impl NodeFs {
    /// Run the state machine for a record the cache has handed over for
    /// teardown.
    pub(crate) fn run_delete(&self, record: &ObjectRecord) -> DeleteReport {
        let mut run = Run {
            object: record.id(),
            trace: vec![DeleteState::Live],
        };
        let outcome = self.delete_steps(record, &mut run);
        run.enter(outcome.terminal_state());

        let object = run.object.0;
        match &outcome {
            DeleteOutcome::Deleted => {
                debug!(target: "cfs::delete", event = "object_deleted", object);
            }
            DeleteOutcome::Deferred(reason) => {
                debug!(target: "cfs::delete", event = "delete_deferred", object, ?reason);
            }
            DeleteOutcome::Retired(reason) => {
                trace!(target: "cfs::delete", event = "delete_retired", object, ?reason);
            }
            DeleteOutcome::Failed(err) => {
                warn!(target: "cfs::delete", event = "delete_failed", object, error = %err);
            }
        }
        DeleteReport {
            object: run.object,
            trace: run.trace,
            outcome,
        }
    }

    fn delete_steps(&self, record: &ObjectRecord, run: &mut Run) -> DeleteOutcome {
        run.enter(DeleteState::CandidateForDelete);
        if let Some(reason) = self.delete_guard(record) {
            return DeleteOutcome::Retired(reason);
        }

        let _meta = match self.lock_meta(record, LockMode::Exclusive) {
            Ok(guard) => guard,
            Err(CfsError::Stale { .. }) => {
                return DeleteOutcome::Retired(RetireReason::AlreadyDeleted);
            }
            Err(err) => return DeleteOutcome::Failed(err),
        };
        match self.refresh(record) {
            Ok(()) => {}
            Err(CfsError::Stale { .. }) => {
                return DeleteOutcome::Retired(RetireReason::AlreadyDeleted);
            }
            Err(err) => return DeleteOutcome::Failed(err),
        }

        let id = record.id();
        let disk = record.disk();
        if disk.link_count > 0 {
            return DeleteOutcome::Retired(RetireReason::StillLinked);
        }
        let skip_orphan_dir = record.flags().contains(LocalFlags::SKIP_ORPHAN_DIR);
        if !disk.is_orphaned() && !skip_orphan_dir {
            if disk.has_refcounted_extents() {
                return DeleteOutcome::Retired(RetireReason::SharedExtents);
            }
            error!(
                target: "cfs::delete",
                event = "unlinked_not_orphaned",
                object = id.0,
                flags = disk.flags
            );
            return DeleteOutcome::Failed(CfsError::NotOrphaned { object: id });
        }
        if disk.deletion_time != 0 {
            error!(
                target: "cfs::delete",
                event = "deletion_time_already_set",
                object = id.0,
                deletion_time = disk.deletion_time
            );
            return DeleteOutcome::Failed(CfsError::Exists(format!(
                "object {id} already carries a deletion time"
            )));
        }

        run.enter(DeleteState::AttemptExclusiveOpen);
        match self.upgrade_open(record) {
            Ok(true) => {}
            Ok(false) => return DeleteOutcome::Deferred(DeferReason::OpenElsewhere),
            Err(err) => return DeleteOutcome::Failed(err),
        }

        let slot = disk.orphaned_slot;
        let _wipe = match self.registry.wipe_guard(slot) {
            Ok(guard) => guard,
            Err(CfsError::RecoveryConflict { .. }) => {
                warn!(
                    target: "cfs::delete",
                    event = "delete_deferred_by_recovery",
                    object = id.0,
                    slot = slot.0
                );
                return DeleteOutcome::Deferred(DeferReason::SlotRecovering);
            }
            Err(err) => return DeleteOutcome::Failed(err),
        };

        run.enter(DeleteState::Wiping);
        if let Err(err) = self.wipe(record) {
            return DeleteOutcome::Failed(err);
        }

        run.enter(DeleteState::DetachingAuxiliaryStorage);
        if let Err(err) = self.auxiliary.detach(self, record) {
            return DeleteOutcome::Failed(err);
        }

        run.enter(DeleteState::Detaching);
        if let Err(err) = self.detach(record, slot, skip_orphan_dir) {
            return DeleteOutcome::Failed(err);
        }
        record.set_flags(LocalFlags::DELETED);
        DeleteOutcome::Deleted
    }

    fn delete_guard(&self, record: &ObjectRecord) -> Option<RetireReason> {
        let id = record.id();
        if id == self.superblock.root {
            warn!(target: "cfs::delete", event = "skip_delete_root", object = id.0);
            return Some(RetireReason::Root);
        }
        let state = record.state();
        if state.flags.contains(LocalFlags::IS_SYSTEM) || state.disk.is_system() {
            warn!(target: "cfs::delete", event = "skip_delete_system", object = id.0);
            return Some(RetireReason::SystemObject);
        }
        if state.flags.contains(LocalFlags::SKIP_DELETE) {
            return Some(RetireReason::SkipDelete);
        }
        if state.flags.contains(LocalFlags::DELETED) {
            return Some(RetireReason::AlreadyDeleted);
        }
        None
    }

    /// Non-blocking cluster-wide exclusive open. A refusal also drops our
    /// shared hold, so of two racing nodes exactly one can win.
    fn upgrade_open(&self, record: &ObjectRecord) -> Result<bool> {
        if self.options.local_mount {
            return Ok(true);
        }
        Ok(record.open_lock().try_upgrade(OnBusy::Release)?.is_granted())
    }

    fn wipe(&self, record: &ObjectRecord) -> Result<()> {
        let id = record.id();
        let disk = record.disk();
        if disk.cluster_count != 0 || disk.size != 0 {
            // Size goes to zero in its own commit before any cluster is freed.
            self.update_record(record, credits::RECORD_UPDATE, |disk, _| {
                disk.size = 0;
                disk.dynamic_flags &= !DYN_INLINE_DATA_FL;
                Ok(())
            })?;
        }

        let kind = record.kind();
        if kind.has_data() && record.disk().cluster_count != 0 {
            self.truncator.truncate_to_zero(self, record)?;
            let left = record.disk().cluster_count;
            if left != 0 {
                return Err(CfsError::Format(format!(
                    "truncation of object {id} left {left} clusters"
                )));
            }
        }

        if kind == ObjectKind::Directory && record.disk().dynamic_flags & DYN_INDEXED_DIR_FL != 0 {
            self.update_record(record, credits::RECORD_UPDATE, |disk, _| {
                disk.dynamic_flags &= !DYN_INDEXED_DIR_FL;
                Ok(())
            })?;
            debug!(target: "cfs::delete", event = "dir_index_released", object = id.0);
        }
        Ok(())
    }

    /// The single transaction after which the object can never be wiped again.
    fn detach(&self, record: &ObjectRecord, slot: SlotNumber, skip_orphan_dir: bool) -> Result<()> {
        let id = record.id();
        let bit = id.bitmap_bit()?;
        let _orphan_dir = if skip_orphan_dir {
            None
        } else {
            Some(self.lock_orphan_dir(slot)?)
        };
        let _alloc = self.lock_allocator()?;
        self.update_record(record, credits::DETACH, |disk, tx| {
            if !skip_orphan_dir {
                self.registry.remove(tx, slot, id)?;
            }
            self.allocator.free(tx, bit)?;
            disk.flags &= !(RECORD_VALID_FL | RECORD_ORPHANED_FL);
            disk.link_count = 0;
            disk.deletion_time = now().sec.max(1);
            Ok(())
        })
    }
}
