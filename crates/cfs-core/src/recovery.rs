//! Orphan recovery: retry deletion of everything left in a slot's orphan
//! directory, typically after the owning node crashed.

use crate::NodeFs;
use crate::cache::OpenFlags;
use crate::delete::DeleteOutcome;
use cfs_error::{CfsError, RecordCorruption, Result};
use cfs_inode::{LocalFlags, ObjectRecord};
use cfs_types::{ObjectId, SlotNumber};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// What one recovery pass did with each entry it found.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    pub slot: SlotNumber,
    /// Entries present when the scan ran.
    pub scanned: usize,
    pub deleted: Vec<ObjectId>,
    /// Still open somewhere; the last holder deletes them.
    pub deferred: Vec<ObjectId>,
    /// Busy elsewhere, already gone or kept on purpose.
    pub skipped: Vec<ObjectId>,
    pub failed: Vec<(ObjectId, String)>,
}

impl RecoveryReport {
    fn new(slot: SlotNumber, scanned: usize) -> Self {
        Self {
            slot,
            scanned,
            deleted: Vec::new(),
            deferred: Vec::new(),
            skipped: Vec::new(),
            failed: Vec::new(),
        }
    }

    /// Every entry ended up deleted, deferred or skipped.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

impl NodeFs {
    /// Recover `slot`, failing with `RecoveryConflict` while a wipe on it is
    /// in flight on this node.
    pub fn recover_orphans(&self, slot: SlotNumber) -> Result<RecoveryReport> {
        self.registry.begin_recovery(slot)?;
        self.recover_slot(slot)
    }

    /// Recover `slot`, first waiting for in-flight wipes on it to drain.
    pub fn recover_orphans_blocking(&self, slot: SlotNumber) -> Result<RecoveryReport> {
        self.registry.begin_recovery_blocking(slot)?;
        self.recover_slot(slot)
    }

    /// Runs with the slot's recovering marker set; clears it before any
    /// deletion starts, since a wipe may not begin on a recovering slot.
    fn recover_slot(&self, slot: SlotNumber) -> Result<RecoveryReport> {
        let entries = match self.registry.scan(&self.journal, slot) {
            Ok(entries) => entries,
            Err(err) => {
                self.registry.end_recovery(slot)?;
                return Err(err);
            }
        };
        let mut report = RecoveryReport::new(slot, entries.len());

        let mut held: Vec<Arc<ObjectRecord>> = Vec::with_capacity(entries.len());
        for entry in &entries {
            let id = entry.identity;
            match self.acquire(id, OpenFlags::ORPHAN_RECOVERY) {
                Ok(record) => {
                    record.set_flags(LocalFlags::MAYBE_ORPHANED);
                    held.push(record);
                }
                Err(CfsError::LockBusy { .. }) => {
                    debug!(target: "cfs::recovery", event = "orphan_busy", object = id.0, slot = slot.0);
                    report.skipped.push(id);
                }
                Err(CfsError::Corruption {
                    reason: RecordCorruption::NotValid { .. },
                    ..
                }) => {
                    // Detached between our scan and the read.
                    debug!(target: "cfs::recovery", event = "orphan_gone", object = id.0, slot = slot.0);
                    report.skipped.push(id);
                }
                Err(err) => {
                    warn!(
                        target: "cfs::recovery",
                        event = "orphan_load_failed",
                        object = id.0,
                        slot = slot.0,
                        error = %err
                    );
                    report.failed.push((id, err.to_string()));
                }
            }
        }
        self.registry.end_recovery(slot)?;

        for record in held {
            let id = record.id();
            match self.release(record) {
                Ok(Some(run)) => match run.outcome {
                    DeleteOutcome::Deleted => report.deleted.push(id),
                    DeleteOutcome::Deferred(_) => report.deferred.push(id),
                    DeleteOutcome::Retired(_) => report.skipped.push(id),
                    DeleteOutcome::Failed(err) => report.failed.push((id, err.to_string())),
                },
                // Someone else on this node still references it.
                Ok(None) => report.deferred.push(id),
                Err(err) => report.failed.push((id, err.to_string())),
            }
        }

        info!(
            target: "cfs::recovery",
            event = "recovery_done",
            slot = slot.0,
            scanned = report.scanned,
            deleted = report.deleted.len(),
            deferred = report.deferred.len(),
            skipped = report.skipped.len(),
            failed = report.failed.len()
        );
        Ok(report)
    }
}
