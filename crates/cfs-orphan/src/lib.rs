#![forbid(unsafe_code)]
//! Orphan registry.
//!
//! Each ownership slot has one orphan directory block listing objects that
//! are unlinked but not yet freed. An entry exists exactly while the object
//! carries the ORPHANED flag with a zero deletion time, so `add` and `remove`
//! always run inside the transaction that flips that flag.
//!
//! Alongside the durable directories the registry keeps a per-slot gate in
//! memory. A slot is either being recovered or has wipes in flight, never
//! both: [`OrphanRegistry::begin_recovery`] refuses while a wipe is counted
//! and [`OrphanRegistry::note_wipe_start`] refuses while the slot recovers.

use cfs_error::{CfsError, Result};
use cfs_journal::{Handle, Journal};
use cfs_ondisk::{OrphanDirBlock, OrphanEntry, orphan_entry_name};
use cfs_types::{BlockNumber, FIRST_ORPHAN_DIR_BLOCK, ObjectId, SlotNumber};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace, warn};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct SlotGate {
    recovering: bool,
    wipes_in_progress: u32,
}

#[derive(Debug)]
pub struct OrphanRegistry {
    slot_count: u16,
    gates: Mutex<Vec<SlotGate>>,
    changed: Condvar,
}

impl OrphanRegistry {
    #[must_use]
    pub fn new(slot_count: u16) -> Self {
        Self {
            slot_count,
            gates: Mutex::new(vec![SlotGate::default(); usize::from(slot_count)]),
            changed: Condvar::new(),
        }
    }

    #[must_use]
    pub fn slot_count(&self) -> u16 {
        self.slot_count
    }

    /// Block holding `slot`'s orphan directory.
    pub fn dir_block(&self, slot: SlotNumber) -> Result<BlockNumber> {
        self.check_slot(slot)?;
        Ok(BlockNumber(FIRST_ORPHAN_DIR_BLOCK.0 + u64::from(slot.0)))
    }

    fn check_slot(&self, slot: SlotNumber) -> Result<()> {
        if slot.0 >= self.slot_count {
            return Err(CfsError::InvalidArgument(format!(
                "slot {slot} out of range (slot_count {})",
                self.slot_count
            )));
        }
        Ok(())
    }

    fn parse_dir(&self, slot: SlotNumber, raw: &[u8]) -> Result<OrphanDirBlock> {
        let dir = OrphanDirBlock::parse(raw)?;
        if dir.slot != slot {
            return Err(CfsError::Format(format!(
                "orphan directory for slot {slot} claims slot {}",
                dir.slot
            )));
        }
        Ok(dir)
    }

    fn update<T>(
        &self,
        tx: &mut Handle<'_>,
        slot: SlotNumber,
        f: impl FnOnce(&mut OrphanDirBlock, usize) -> Result<T>,
    ) -> Result<T> {
        let block = self.dir_block(slot)?;
        let mut raw = tx.mark_for_write(block)?;
        let mut dir = self.parse_dir(slot, &raw)?;
        let out = f(&mut dir, raw.len())?;
        dir.write_into(&mut raw)?;
        tx.write_block(block, raw)?;
        Ok(out)
    }

    /// Record `identity` as orphaned in `slot`.
    ///
    /// Must run in the same transaction that sets the ORPHANED flag.
    pub fn add(
        &self,
        tx: &mut Handle<'_>,
        slot: SlotNumber,
        identity: ObjectId,
        generation: u32,
    ) -> Result<()> {
        self.update(tx, slot, |dir, block_len| {
            if dir.find(identity).is_some() {
                return Err(CfsError::Exists(orphan_entry_name(identity, generation)));
            }
            if dir.entries.len() >= OrphanDirBlock::capacity(block_len) {
                warn!(
                    target: "cfs::orphan",
                    event = "orphan_dir_full",
                    slot = slot.0,
                    entries = dir.entries.len()
                );
                return Err(CfsError::NoSpace);
            }
            dir.entries.push(OrphanEntry {
                identity,
                generation,
            });
            debug!(
                target: "cfs::orphan",
                event = "orphan_add",
                slot = slot.0,
                name = %orphan_entry_name(identity, generation)
            );
            Ok(())
        })
    }

    /// Drop `identity`'s entry from `slot`, returning it.
    ///
    /// Must run in the transaction that performs the final detach.
    pub fn remove(
        &self,
        tx: &mut Handle<'_>,
        slot: SlotNumber,
        identity: ObjectId,
    ) -> Result<OrphanEntry> {
        self.update(tx, slot, |dir, _| {
            let pos = dir
                .entries
                .iter()
                .position(|e| e.identity == identity)
                .ok_or_else(|| {
                    CfsError::NotFound(format!("orphan entry for {identity} in slot {slot}"))
                })?;
            let entry = dir.entries.remove(pos);
            debug!(
                target: "cfs::orphan",
                event = "orphan_remove",
                slot = slot.0,
                name = %entry.name()
            );
            Ok(entry)
        })
    }

    /// Every entry still present in `slot`.
    pub fn scan(&self, journal: &Journal, slot: SlotNumber) -> Result<Vec<OrphanEntry>> {
        let raw = journal.read_block(self.dir_block(slot)?)?;
        let entries = self.parse_dir(slot, &raw)?.entries;
        trace!(
            target: "cfs::orphan",
            event = "orphan_scan",
            slot = slot.0,
            entries = entries.len()
        );
        Ok(entries)
    }

    pub fn contains(&self, journal: &Journal, slot: SlotNumber, identity: ObjectId) -> Result<bool> {
        Ok(self
            .scan(journal, slot)?
            .iter()
            .any(|e| e.identity == identity))
    }

    // ── recovery / wipe gate ────────────────────────────────────────────────

    /// Mark `slot` as being recovered. Fails while wipes are in flight or
    /// another recovery of the slot is running.
    pub fn begin_recovery(&self, slot: SlotNumber) -> Result<()> {
        self.check_slot(slot)?;
        let mut gates = self.gates.lock();
        let gate = &mut gates[slot.index()];
        if gate.recovering || gate.wipes_in_progress > 0 {
            debug!(
                target: "cfs::orphan",
                event = "recovery_conflict",
                slot = slot.0,
                wipes = gate.wipes_in_progress,
                recovering = gate.recovering
            );
            return Err(CfsError::RecoveryConflict { slot });
        }
        gate.recovering = true;
        Ok(())
    }

    /// Like [`begin_recovery`](Self::begin_recovery) but waits for the slot
    /// to become free instead of failing.
    pub fn begin_recovery_blocking(&self, slot: SlotNumber) -> Result<()> {
        self.check_slot(slot)?;
        let mut gates = self.gates.lock();
        while gates[slot.index()].recovering || gates[slot.index()].wipes_in_progress > 0 {
            self.changed.wait(&mut gates);
        }
        gates[slot.index()].recovering = true;
        Ok(())
    }

    pub fn end_recovery(&self, slot: SlotNumber) -> Result<()> {
        self.check_slot(slot)?;
        let mut gates = self.gates.lock();
        if !gates[slot.index()].recovering {
            return Err(CfsError::InvalidArgument(format!(
                "slot {slot} is not being recovered"
            )));
        }
        gates[slot.index()].recovering = false;
        drop(gates);
        self.changed.notify_all();
        Ok(())
    }

    /// Count a wipe of an object orphaned in `slot`. Refused while the slot
    /// is being recovered; the recovery pass will handle the object.
    pub fn note_wipe_start(&self, slot: SlotNumber) -> Result<()> {
        self.check_slot(slot)?;
        let mut gates = self.gates.lock();
        let gate = &mut gates[slot.index()];
        if gate.recovering {
            return Err(CfsError::RecoveryConflict { slot });
        }
        gate.wipes_in_progress += 1;
        trace!(
            target: "cfs::orphan",
            event = "wipe_start",
            slot = slot.0,
            wipes = gate.wipes_in_progress
        );
        Ok(())
    }

    pub fn note_wipe_end(&self, slot: SlotNumber) -> Result<()> {
        self.check_slot(slot)?;
        let mut gates = self.gates.lock();
        let gate = &mut gates[slot.index()];
        if gate.wipes_in_progress == 0 {
            return Err(CfsError::InvalidArgument(format!(
                "no wipe in progress on slot {slot}"
            )));
        }
        gate.wipes_in_progress -= 1;
        let drained = gate.wipes_in_progress == 0;
        drop(gates);
        if drained {
            self.changed.notify_all();
        }
        Ok(())
    }

    /// [`note_wipe_start`](Self::note_wipe_start) whose matching end runs on drop.
    pub fn wipe_guard(&self, slot: SlotNumber) -> Result<WipeGuard<'_>> {
        self.note_wipe_start(slot)?;
        Ok(WipeGuard {
            registry: self,
            slot,
        })
    }

    #[must_use]
    pub fn wipes_in_progress(&self, slot: SlotNumber) -> u32 {
        self.gates
            .lock()
            .get(slot.index())
            .map_or(0, |g| g.wipes_in_progress)
    }

    #[must_use]
    pub fn is_recovering(&self, slot: SlotNumber) -> bool {
        self.gates
            .lock()
            .get(slot.index())
            .is_some_and(|g| g.recovering)
    }

    /// Block until no wipe is counted on `slot`.
    pub fn wait_for_wipes(&self, slot: SlotNumber) -> Result<()> {
        self.check_slot(slot)?;
        let mut gates = self.gates.lock();
        while gates[slot.index()].wipes_in_progress > 0 {
            self.changed.wait(&mut gates);
        }
        Ok(())
    }
}

/// Ends a counted wipe when dropped.
#[derive(Debug)]
pub struct WipeGuard<'r> {
    registry: &'r OrphanRegistry,
    slot: SlotNumber,
}

impl Drop for WipeGuard<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.registry.note_wipe_end(self.slot) {
            warn!(
                target: "cfs::orphan",
                event = "wipe_end_failed",
                slot = self.slot.0,
                error = %err
            );
        }
    }
}
