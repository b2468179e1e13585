#![forbid(unsafe_code)]
//! Space allocation.
//!
//! The allocator block carries two things:
//!
//! 1. **Identity bitmap**: one bit per device block. An object's identity is
//!    its record block, so freeing an object clears exactly one bit.
//! 2. **Cluster pool**: counters for the data clusters objects own. Extent
//!    placement is not modelled; truncation only returns counts.
//!
//! All mutation happens inside a journal [`Handle`]. Cluster-wide exclusion
//! on the allocator block is the caller's job (the allocator lock).

use cfs_error::{CfsError, Result};
use cfs_journal::{Handle, Journal};
use cfs_ondisk::AllocBlock;
use cfs_types::{ALLOC_BLOCK, BlockNumber, ObjectId};
use tracing::{debug, error};

// ── Bitmap operations ───────────────────────────────────────────────────────

/// Get bit `idx` from a bitmap byte slice.
#[must_use]
pub fn bitmap_get(bitmap: &[u8], idx: u32) -> bool {
    let byte_idx = (idx / 8) as usize;
    bitmap
        .get(byte_idx)
        .is_some_and(|byte| (byte >> (idx % 8)) & 1 == 1)
}

/// Set bit `idx` in a bitmap byte slice.
pub fn bitmap_set(bitmap: &mut [u8], idx: u32) {
    if let Some(byte) = bitmap.get_mut((idx / 8) as usize) {
        *byte |= 1 << (idx % 8);
    }
}

/// Clear bit `idx` in a bitmap byte slice.
pub fn bitmap_clear(bitmap: &mut [u8], idx: u32) {
    if let Some(byte) = bitmap.get_mut((idx / 8) as usize) {
        *byte &= !(1 << (idx % 8));
    }
}

/// Count free (zero) bits in the first `count` bits of `bitmap`.
#[must_use]
pub fn bitmap_count_free(bitmap: &[u8], count: u32) -> u32 {
    let full_bytes = (count / 8) as usize;
    let mut free: u32 = bitmap
        .iter()
        .take(full_bytes)
        .map(|byte| byte.count_zeros())
        .sum();
    for idx in (count - count % 8)..count {
        if full_bytes < bitmap.len() && !bitmap_get(bitmap, idx) {
            free += 1;
        }
    }
    free
}

/// First run of `n` free bits within the first `count` bits, searching from
/// `hint` and wrapping around to the start.
#[must_use]
pub fn bitmap_find_run(bitmap: &[u8], count: u32, n: u32, hint: u32) -> Option<u32> {
    if n == 0 || n > count {
        return None;
    }
    let hint = if hint >= count { 0 } else { hint };
    let scan = |from: u32, to: u32| {
        let mut run_start = from;
        let mut run_len = 0_u32;
        for idx in from..to {
            if bitmap_get(bitmap, idx) {
                run_start = idx + 1;
                run_len = 0;
            } else {
                run_len += 1;
                if run_len == n {
                    return Some(run_start);
                }
            }
        }
        None
    };
    scan(hint, count).or_else(|| scan(0, (hint + n - 1).min(count)))
}

// ── Allocator ──────────────────────────────────────────────────────────────

/// Space allocator contract consumed by object creation and deletion.
pub trait SpaceAllocator: Send + Sync {
    /// Claim `count` contiguous identity bits, preferring ones at or after
    /// `hint`. Returns the first bit.
    fn alloc(&self, tx: &mut Handle<'_>, count: u32, hint: u32) -> Result<u32>;

    /// Release one identity bit. Releasing a bit that is already free is an
    /// error, never a silent no-op.
    fn free(&self, tx: &mut Handle<'_>, bit: u32) -> Result<()>;

    /// Take `clusters` from the data pool.
    fn claim_clusters(&self, tx: &mut Handle<'_>, clusters: u64) -> Result<()>;

    /// Return `clusters` to the data pool.
    fn release_clusters(&self, tx: &mut Handle<'_>, clusters: u64) -> Result<()>;
}

/// Allocator backed by the single on-disk allocator block.
#[derive(Debug, Clone, Copy)]
pub struct BitmapAllocator {
    block: BlockNumber,
}

impl Default for BitmapAllocator {
    fn default() -> Self {
        Self { block: ALLOC_BLOCK }
    }
}

impl BitmapAllocator {
    #[must_use]
    pub fn new(block: BlockNumber) -> Self {
        Self { block }
    }

    #[must_use]
    pub fn block(&self) -> BlockNumber {
        self.block
    }

    /// Allocator contents for a fresh filesystem: blocks below
    /// `first_free` are in use by system structures and the root.
    pub fn initial(total_bits: u32, first_free: u32, total_clusters: u64) -> Result<AllocBlock> {
        if first_free > total_bits {
            return Err(CfsError::Format(format!(
                "reserved bits {first_free} exceed bitmap size {total_bits}"
            )));
        }
        let mut alloc = AllocBlock::new(total_bits, total_clusters);
        for bit in 0..first_free {
            bitmap_set(&mut alloc.bitmap, bit);
        }
        alloc.free_bits = total_bits - first_free;
        Ok(alloc)
    }

    /// Read the allocator outside of any transaction.
    pub fn snapshot(&self, journal: &Journal) -> Result<AllocBlock> {
        Ok(AllocBlock::parse(&journal.read_block(self.block)?)?)
    }

    fn update<T>(
        &self,
        tx: &mut Handle<'_>,
        f: impl FnOnce(&mut AllocBlock) -> Result<T>,
    ) -> Result<T> {
        let mut raw = tx.mark_for_write(self.block)?;
        let mut alloc = AllocBlock::parse(&raw)?;
        let out = f(&mut alloc)?;
        alloc.write_into(&mut raw)?;
        tx.write_block(self.block, raw)?;
        Ok(out)
    }
}

impl SpaceAllocator for BitmapAllocator {
    fn alloc(&self, tx: &mut Handle<'_>, count: u32, hint: u32) -> Result<u32> {
        self.update(tx, |alloc| {
            if count == 0 {
                return Err(CfsError::InvalidArgument("zero-length allocation".into()));
            }
            let start = bitmap_find_run(&alloc.bitmap, alloc.total_bits, count, hint)
                .ok_or(CfsError::NoSpace)?;
            alloc.free_bits = alloc.free_bits.checked_sub(count).ok_or_else(|| {
                error!(
                    target: "cfs::alloc",
                    event = "free_count_underflow",
                    free_bits = alloc.free_bits,
                    count
                );
                CfsError::Format(format!(
                    "allocator counts {} free bits but the bitmap has {count} free at {start}",
                    alloc.free_bits
                ))
            })?;
            for bit in start..start + count {
                bitmap_set(&mut alloc.bitmap, bit);
            }
            debug!(
                target: "cfs::alloc",
                event = "bits_alloc",
                start,
                count,
                free_bits = alloc.free_bits
            );
            Ok(start)
        })
    }

    fn free(&self, tx: &mut Handle<'_>, bit: u32) -> Result<()> {
        self.update(tx, |alloc| {
            if bit >= alloc.total_bits {
                return Err(CfsError::InvalidArgument(format!(
                    "bit {bit} beyond bitmap of {} bits",
                    alloc.total_bits
                )));
            }
            if !bitmap_get(&alloc.bitmap, bit) {
                error!(target: "cfs::alloc", event = "double_free", bit);
                return Err(CfsError::Format(format!(
                    "allocator bit {bit} is already free"
                )));
            }
            alloc.free_bits = alloc
                .free_bits
                .checked_add(1)
                .filter(|next| *next <= alloc.total_bits)
                .ok_or_else(|| {
                    CfsError::Format(format!(
                        "freeing bit {bit} overflows the free count {} of {} bits",
                        alloc.free_bits, alloc.total_bits
                    ))
                })?;
            bitmap_clear(&mut alloc.bitmap, bit);
            debug!(
                target: "cfs::alloc",
                event = "bit_free",
                bit,
                free_bits = alloc.free_bits
            );
            Ok(())
        })
    }

    fn claim_clusters(&self, tx: &mut Handle<'_>, clusters: u64) -> Result<()> {
        self.update(tx, |alloc| {
            if clusters > alloc.free_clusters {
                return Err(CfsError::NoSpace);
            }
            alloc.free_clusters -= clusters;
            Ok(())
        })
    }

    fn release_clusters(&self, tx: &mut Handle<'_>, clusters: u64) -> Result<()> {
        self.update(tx, |alloc| {
            let next = alloc
                .free_clusters
                .checked_add(clusters)
                .filter(|next| *next <= alloc.total_clusters)
                .ok_or_else(|| {
                    CfsError::Format(format!(
                        "releasing {clusters} clusters overflows the pool of {}",
                        alloc.total_clusters
                    ))
                })?;
            alloc.free_clusters = next;
            Ok(())
        })
    }
}

/// Whether `id`'s bit is currently allocated.
pub fn is_allocated(alloc: &AllocBlock, id: ObjectId) -> Result<bool> {
    Ok(bitmap_get(&alloc.bitmap, id.bitmap_bit()?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use cfs_block::{BlockDevice, ByteBlockDevice, MemoryByteDevice};
    use cfs_journal::JournalConfig;
    use cfs_types::NodeId;
    use proptest::prelude::*;
    use std::sync::Arc;

    #[test]
    fn bitmap_get_set_clear() {
        let mut bm = vec![0u8; 4];
        assert!(!bitmap_get(&bm, 0));
        bitmap_set(&mut bm, 0);
        assert!(bitmap_get(&bm, 0));
        bitmap_clear(&mut bm, 0);
        assert!(!bitmap_get(&bm, 0));

        bitmap_set(&mut bm, 7);
        assert_eq!(bm[0], 0x80);
        bitmap_set(&mut bm, 8);
        assert_eq!(bm[1], 0x01);
        assert!(!bitmap_get(&bm, 1000), "out of range reads as clear");
    }

    #[test]
    fn count_free_handles_partial_bytes() {
        let mut bm = vec![0u8; 2];
        bitmap_set(&mut bm, 0);
        bitmap_set(&mut bm, 5);
        bitmap_set(&mut bm, 9);
        assert_eq!(bitmap_count_free(&bm, 16), 13);
        assert_eq!(bitmap_count_free(&bm, 12), 9);
    }

    #[test]
    fn find_run_honours_hint_and_wraps() {
        let mut bm = vec![0xFFu8; 2];
        bitmap_clear(&mut bm, 3);
        assert_eq!(bitmap_find_run(&bm, 16, 1, 5), Some(3));
        bitmap_clear(&mut bm, 10);
        bitmap_clear(&mut bm, 11);
        assert_eq!(bitmap_find_run(&bm, 16, 1, 5), Some(10));
        assert_eq!(bitmap_find_run(&bm, 16, 2, 0), Some(10));
        assert_eq!(bitmap_find_run(&bm, 16, 3, 0), None);
        assert_eq!(bitmap_find_run(&bm, 16, 0, 0), None);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn found_runs_are_free(bytes in proptest::collection::vec(any::<u8>(), 1..16), n in 1_u32..6, hint in 0_u32..128) {
            let count = u32::try_from(bytes.len()).expect("len") * 8;
            if let Some(start) = bitmap_find_run(&bytes, count, n, hint) {
                prop_assert!(start + n <= count);
                for bit in start..start + n {
                    prop_assert!(!bitmap_get(&bytes, bit));
                }
            } else {
                prop_assert!(bitmap_count_free(&bytes, count) < n || n > 1);
            }
        }
    }

    fn formatted() -> (Journal, BitmapAllocator) {
        formatted_with(|_| {})
    }

    fn formatted_with(edit: impl FnOnce(&mut AllocBlock)) -> (Journal, BitmapAllocator) {
        let dev: Arc<dyn BlockDevice> =
            Arc::new(ByteBlockDevice::new(MemoryByteDevice::new(512 * 8), 512).expect("device"));
        let mut initial = BitmapAllocator::initial(64, 4, 100).expect("initial");
        edit(&mut initial);
        dev.write_block(ALLOC_BLOCK, &initial.encode(512).expect("encode"))
            .expect("write");
        (
            Journal::new(dev, JournalConfig::default(), NodeId(0)),
            BitmapAllocator::default(),
        )
    }

    #[test]
    fn alloc_then_free_restores_counts() {
        let (journal, alloc) = formatted();
        let mut tx = journal.begin(1).expect("begin");
        let bit = alloc.alloc(&mut tx, 1, 0).expect("alloc");
        assert_eq!(bit, 4, "reserved bits skipped");
        tx.commit().expect("commit");
        assert_eq!(alloc.snapshot(&journal).expect("snap").free_bits, 59);

        let mut tx = journal.begin(1).expect("begin");
        alloc.free(&mut tx, bit).expect("free");
        tx.commit().expect("commit");
        let snap = alloc.snapshot(&journal).expect("snap");
        assert_eq!(snap.free_bits, 60);
        assert!(!is_allocated(&snap, ObjectId(4)).expect("bit"));
    }

    #[test]
    fn double_free_is_an_error() {
        let (journal, alloc) = formatted();
        let mut tx = journal.begin(1).expect("begin");
        let err = alloc.free(&mut tx, 20).expect_err("bit 20 was never allocated");
        assert!(matches!(err, CfsError::Format(_)));
        assert!(alloc.free(&mut tx, 64).is_err());
    }

    #[test]
    fn cluster_pool_accounting() {
        let (journal, alloc) = formatted();
        let mut tx = journal.begin(1).expect("begin");
        alloc.claim_clusters(&mut tx, 60).expect("claim");
        assert!(matches!(
            alloc.claim_clusters(&mut tx, 41),
            Err(CfsError::NoSpace)
        ));
        alloc.release_clusters(&mut tx, 10).expect("release");
        assert!(alloc.release_clusters(&mut tx, 51).is_err());
        tx.commit().expect("commit");
        assert_eq!(alloc.snapshot(&journal).expect("snap").free_clusters, 50);
    }

    #[test]
    fn exhausted_bitmap_is_no_space() {
        let (journal, alloc) = formatted();
        let mut tx = journal.begin(1).expect("begin");
        alloc.alloc(&mut tx, 60, 0).expect("take the rest");
        assert!(matches!(alloc.alloc(&mut tx, 1, 0), Err(CfsError::NoSpace)));
    }

    #[test]
    fn free_count_below_bitmap_is_a_format_error() {
        let (journal, alloc) = formatted_with(|block| block.free_bits = 0);
        let mut tx = journal.begin(1).expect("begin");
        let err = alloc.alloc(&mut tx, 1, 0).expect_err("counter says full");
        assert!(matches!(err, CfsError::Format(_)), "{err:?}");
        tx.abort();
        assert_eq!(alloc.snapshot(&journal).expect("snap").free_bits, 0);
    }

    #[test]
    fn free_count_above_total_is_a_format_error() {
        let (journal, alloc) = formatted_with(|block| block.free_bits = block.total_bits);
        let mut tx = journal.begin(1).expect("begin");
        let err = alloc.free(&mut tx, 2).expect_err("counter already full");
        assert!(matches!(err, CfsError::Format(_)), "{err:?}");
        tx.abort();
        let snap = alloc.snapshot(&journal).expect("snap");
        assert!(is_allocated(&snap, ObjectId(2)).expect("bit"));
    }
}
