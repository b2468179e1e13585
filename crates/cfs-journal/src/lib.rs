#![forbid(unsafe_code)]
//! Transaction client.
//!
//! A [`Handle`] stages whole-block writes against a credit budget and
//! [`Handle::commit`] applies them all or none. The redo-log format is not
//! modelled: atomicity is provided by serializing commits and restoring
//! pre-images when a device write fails part way through.
//!
//! [`Journal::crash_after`] simulates power loss right after a chosen
//! commit, which is how crash-replay tests cut a protocol run short.

use cfs_block::BlockDevice;
use cfs_error::{CfsError, Result};
use cfs_types::{BlockNumber, NodeId, TxnId};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, trace, warn};

/// Credit estimates for the transactions the engine runs.
///
/// One credit covers one distinct block.
pub mod credits {
    /// Rewriting a single object record.
    pub const RECORD_UPDATE: u32 = 1;
    /// Record plus the allocator block.
    pub const CREATE: u32 = 2;
    /// Record plus the allocator block.
    pub const EXTEND: u32 = 2;
    /// Record plus the orphan directory block.
    pub const ORPHAN_ADD: u32 = 2;
    /// One truncation batch: record plus the allocator block.
    pub const TRUNCATE_BATCH: u32 = 2;
    /// Final detach: record, orphan directory block and allocator block.
    pub const DETACH: u32 = 3;
}

/// Journal configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalConfig {
    /// Largest credit estimate a single transaction may ask for.
    /// Default: 32.
    pub max_transaction_credits: u32,
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self {
            max_transaction_credits: 32,
        }
    }
}

#[derive(Debug, Default)]
struct CommitState {
    /// Commits still allowed before the simulated crash.
    commits_left: Option<u64>,
    crashed: bool,
}

pub struct Journal {
    device: Arc<dyn BlockDevice>,
    config: JournalConfig,
    node: NodeId,
    next_txn: AtomicU64,
    committed: AtomicU64,
    /// Serializes commits and carries the crash simulation state.
    commit: Mutex<CommitState>,
}

impl std::fmt::Debug for Journal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Journal")
            .field("node", &self.node)
            .field("config", &self.config)
            .field("committed", &self.committed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Journal {
    #[must_use]
    pub fn new(device: Arc<dyn BlockDevice>, config: JournalConfig, node: NodeId) -> Self {
        Self {
            device,
            config,
            node,
            next_txn: AtomicU64::new(1),
            committed: AtomicU64::new(0),
            commit: Mutex::new(CommitState::default()),
        }
    }

    #[must_use]
    pub fn device(&self) -> &Arc<dyn BlockDevice> {
        &self.device
    }

    #[must_use]
    pub fn config(&self) -> JournalConfig {
        self.config
    }

    /// Open a transaction sized for `credits` distinct blocks.
    pub fn begin(&self, credits: u32) -> Result<Handle<'_>> {
        if self.commit.lock().crashed {
            return Err(CfsError::NodeDown { node: self.node });
        }
        if credits == 0 || credits > self.config.max_transaction_credits {
            return Err(CfsError::CreditsExhausted {
                requested: credits,
                available: self.config.max_transaction_credits,
            });
        }
        let id = TxnId(self.next_txn.fetch_add(1, Ordering::Relaxed));
        trace!(target: "cfs::journal", event = "txn_begin", txn = id.0, credits);
        Ok(Handle {
            journal: self,
            id,
            credits,
            writes: BTreeMap::new(),
        })
    }

    /// Read a block outside of any transaction.
    pub fn read_block(&self, block: BlockNumber) -> Result<Vec<u8>> {
        Ok(self.device.read_block(block)?.into_inner())
    }

    /// Let `n` more commits succeed, then fail every later one with `NodeDown`.
    pub fn crash_after(&self, n: u64) {
        self.commit.lock().commits_left = Some(n);
    }

    #[must_use]
    pub fn is_crashed(&self) -> bool {
        self.commit.lock().crashed
    }

    /// Number of transactions committed so far.
    #[must_use]
    pub fn committed(&self) -> u64 {
        self.committed.load(Ordering::Relaxed)
    }

    fn apply(&self, id: TxnId, writes: &BTreeMap<BlockNumber, Vec<u8>>) -> Result<()> {
        let mut state = self.commit.lock();
        if state.crashed {
            return Err(CfsError::NodeDown { node: self.node });
        }
        if state.commits_left == Some(0) {
            state.crashed = true;
            warn!(
                target: "cfs::journal",
                event = "simulated_crash",
                node = self.node.0,
                txn = id.0
            );
            return Err(CfsError::NodeDown { node: self.node });
        }

        let mut pre_images = Vec::with_capacity(writes.len());
        for &block in writes.keys() {
            pre_images.push((block, self.device.read_block(block)?));
        }
        for (index, (&block, data)) in writes.iter().enumerate() {
            if let Err(err) = self.device.write_block(block, data) {
                warn!(
                    target: "cfs::journal",
                    event = "commit_rollback",
                    txn = id.0,
                    block = block.0,
                    error = %err
                );
                for (undo_block, image) in pre_images.iter().take(index) {
                    // Best effort; the commit has already failed.
                    let _ = self.device.write_block(*undo_block, image.as_slice());
                }
                return Err(err);
            }
        }
        self.device.sync()?;

        if let Some(left) = state.commits_left.as_mut() {
            *left -= 1;
        }
        drop(state);
        self.committed.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

/// A running transaction.
///
/// Dropping a handle without committing discards its staged writes.
#[derive(Debug)]
pub struct Handle<'j> {
    journal: &'j Journal,
    id: TxnId,
    credits: u32,
    writes: BTreeMap<BlockNumber, Vec<u8>>,
}

impl Handle<'_> {
    #[must_use]
    pub fn id(&self) -> TxnId {
        self.id
    }

    #[must_use]
    pub fn credits(&self) -> u32 {
        self.credits
    }

    /// Distinct blocks touched so far.
    #[must_use]
    pub fn pending_writes(&self) -> usize {
        self.writes.len()
    }

    /// Current contents of `block` as this transaction sees it.
    pub fn read_block(&self, block: BlockNumber) -> Result<Vec<u8>> {
        match self.writes.get(&block) {
            Some(staged) => Ok(staged.clone()),
            None => self.journal.read_block(block),
        }
    }

    /// Declare intent to modify `block`, charging one credit the first time.
    ///
    /// Returns the block's current contents.
    pub fn mark_for_write(&mut self, block: BlockNumber) -> Result<Vec<u8>> {
        if let Some(staged) = self.writes.get(&block) {
            return Ok(staged.clone());
        }
        let used = u32::try_from(self.writes.len()).unwrap_or(u32::MAX);
        if used >= self.credits {
            return Err(CfsError::CreditsExhausted {
                requested: used + 1,
                available: self.credits,
            });
        }
        let current = self.journal.read_block(block)?;
        self.writes.insert(block, current.clone());
        Ok(current)
    }

    /// Stage the new contents of `block`.
    pub fn write_block(&mut self, block: BlockNumber, data: Vec<u8>) -> Result<()> {
        let expected = usize::try_from(self.journal.device.block_size())
            .map_err(|_| CfsError::Format("block_size does not fit usize".to_owned()))?;
        if data.len() != expected {
            return Err(CfsError::Format(format!(
                "staged block size mismatch: got={} expected={expected}",
                data.len()
            )));
        }
        if !self.writes.contains_key(&block) {
            self.mark_for_write(block)?;
        }
        self.writes.insert(block, data);
        Ok(())
    }

    /// Apply every staged write, or none of them.
    pub fn commit(self) -> Result<TxnId> {
        let blocks = self.writes.len();
        self.journal.apply(self.id, &self.writes)?;
        debug!(
            target: "cfs::journal",
            event = "txn_commit",
            txn = self.id.0,
            blocks
        );
        Ok(self.id)
    }

    pub fn abort(self) {
        trace!(
            target: "cfs::journal",
            event = "txn_abort",
            txn = self.id.0,
            blocks = self.writes.len()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cfs_block::{ByteBlockDevice, FaultyBlockDevice, MemoryByteDevice};

    const BS: usize = 512;

    fn journal_on(dev: Arc<dyn BlockDevice>) -> Journal {
        Journal::new(dev, JournalConfig::default(), NodeId(1))
    }

    fn mem_device() -> Arc<dyn BlockDevice> {
        Arc::new(ByteBlockDevice::new(MemoryByteDevice::new(BS * 16), 512).expect("device"))
    }

    #[test]
    fn commit_applies_all_staged_writes() {
        let journal = journal_on(mem_device());
        let mut tx = journal.begin(2).expect("begin");
        tx.write_block(BlockNumber(3), vec![3; BS]).expect("stage");
        tx.write_block(BlockNumber(4), vec![4; BS]).expect("stage");
        assert_eq!(tx.read_block(BlockNumber(3)).expect("read"), vec![3; BS]);
        assert_eq!(
            journal.read_block(BlockNumber(3)).expect("read"),
            vec![0; BS],
            "not visible before commit"
        );
        tx.commit().expect("commit");
        assert_eq!(journal.read_block(BlockNumber(4)).expect("read"), vec![4; BS]);
        assert_eq!(journal.committed(), 1);
    }

    #[test]
    fn abort_and_drop_discard() {
        let journal = journal_on(mem_device());
        let mut tx = journal.begin(1).expect("begin");
        tx.write_block(BlockNumber(2), vec![9; BS]).expect("stage");
        tx.abort();
        {
            let mut tx = journal.begin(1).expect("begin");
            tx.write_block(BlockNumber(2), vec![9; BS]).expect("stage");
        }
        assert_eq!(journal.read_block(BlockNumber(2)).expect("read"), vec![0; BS]);
        assert_eq!(journal.committed(), 0);
    }

    #[test]
    fn credits_bound_the_transaction() {
        let journal = journal_on(mem_device());
        assert!(matches!(
            journal.begin(33),
            Err(CfsError::CreditsExhausted {
                requested: 33,
                available: 32
            })
        ));
        assert!(journal.begin(0).is_err());

        let mut tx = journal.begin(1).expect("begin");
        tx.write_block(BlockNumber(1), vec![1; BS]).expect("first block");
        tx.write_block(BlockNumber(1), vec![2; BS]).expect("same block is free");
        let err = tx
            .write_block(BlockNumber(2), vec![1; BS])
            .expect_err("second block exceeds credits");
        assert!(err.is_resource_exhaustion());
    }

    #[test]
    fn failed_commit_restores_pre_images() {
        let faulty = Arc::new(FaultyBlockDevice::new(
            ByteBlockDevice::new(MemoryByteDevice::new(BS * 16), 512).expect("device"),
        ));
        let journal = journal_on(Arc::clone(&faulty) as Arc<dyn BlockDevice>);
        let mut tx = journal.begin(3).expect("begin");
        tx.write_block(BlockNumber(1), vec![1; BS]).expect("stage");
        tx.write_block(BlockNumber(2), vec![2; BS]).expect("stage");
        tx.write_block(BlockNumber(3), vec![3; BS]).expect("stage");
        faulty.fail_writes_to(BlockNumber(3));
        assert!(matches!(tx.commit(), Err(CfsError::Io(_))));
        faulty.heal();
        for block in 1..=3 {
            assert_eq!(
                journal.read_block(BlockNumber(block)).expect("read"),
                vec![0; BS],
                "block {block} rolled back"
            );
        }
    }

    #[test]
    fn crash_after_refuses_later_commits() {
        let journal = journal_on(mem_device());
        journal.crash_after(1);
        let mut tx = journal.begin(1).expect("begin");
        tx.write_block(BlockNumber(5), vec![5; BS]).expect("stage");
        tx.commit().expect("first commit survives");

        let mut tx = journal.begin(1).expect("begin");
        tx.write_block(BlockNumber(6), vec![6; BS]).expect("stage");
        assert!(matches!(tx.commit(), Err(CfsError::NodeDown { .. })));
        assert!(journal.is_crashed());
        assert!(matches!(journal.begin(1), Err(CfsError::NodeDown { .. })));
        assert_eq!(journal.read_block(BlockNumber(5)).expect("read"), vec![5; BS]);
        assert_eq!(journal.read_block(BlockNumber(6)).expect("read"), vec![0; BS]);
    }
}
