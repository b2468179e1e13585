//! Superblock: filesystem geometry and the fixed system-block layout.

use crate::{ALLOC_HEADER_LEN, stamp_checksum, verify_checksum};
use cfs_types::{
    BlockNumber, BlockSize, FIRST_ORPHAN_DIR_BLOCK, FsGeneration, ObjectId, ParseError,
    SUPER_SIGNATURE, SlotNumber, read_fixed, read_le_u16, read_le_u32, read_le_u64, write_bytes,
    write_le_u16, write_le_u32, write_le_u64,
};
use serde::{Deserialize, Serialize};

/// Bytes covered by the superblock checksum. The rest of block 0 is zero.
///
/// Small enough to read before the block size is known.
pub const SUPERBLOCK_REGION_LEN: usize = 512;

const OFF_FS_GENERATION: usize = 12;
const OFF_BLOCK_SIZE: usize = 16;
const OFF_SLOT_COUNT: usize = 20;
const OFF_BLOCK_COUNT: usize = 24;
const OFF_ROOT: usize = 32;
const OFF_TOTAL_CLUSTERS: usize = 40;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Superblock {
    pub fs_generation: FsGeneration,
    pub block_size: u32,
    pub slot_count: u16,
    pub block_count: u64,
    pub root: ObjectId,
    /// Size of the data cluster pool accounted by the allocator.
    pub total_clusters: u64,
}

impl Superblock {
    /// Geometry for a fresh format; the root record follows the orphan directories.
    #[must_use]
    pub fn new(
        fs_generation: FsGeneration,
        block_size: u32,
        block_count: u64,
        slot_count: u16,
        total_clusters: u64,
    ) -> Self {
        let root = FIRST_ORPHAN_DIR_BLOCK.0 + u64::from(slot_count);
        Self {
            fs_generation,
            block_size,
            slot_count,
            block_count,
            root: ObjectId(root),
            total_clusters,
        }
    }

    /// Parse and verify the leading [`SUPERBLOCK_REGION_LEN`] bytes of block 0.
    pub fn parse_region(region: &[u8]) -> Result<Self, ParseError> {
        if region.len() < SUPERBLOCK_REGION_LEN {
            return Err(ParseError::InsufficientData {
                needed: SUPERBLOCK_REGION_LEN,
                offset: 0,
                actual: region.len(),
            });
        }
        let region = &region[..SUPERBLOCK_REGION_LEN];
        let signature: [u8; 8] = read_fixed(region, 0)?;
        if signature != SUPER_SIGNATURE {
            return Err(ParseError::InvalidMagic {
                expected: u64::from_le_bytes(SUPER_SIGNATURE),
                actual: u64::from_le_bytes(signature),
            });
        }
        verify_checksum(region)?;

        let sb = Self {
            fs_generation: FsGeneration(read_le_u32(region, OFF_FS_GENERATION)?),
            block_size: read_le_u32(region, OFF_BLOCK_SIZE)?,
            slot_count: read_le_u16(region, OFF_SLOT_COUNT)?,
            block_count: read_le_u64(region, OFF_BLOCK_COUNT)?,
            root: ObjectId(read_le_u64(region, OFF_ROOT)?),
            total_clusters: read_le_u64(region, OFF_TOTAL_CLUSTERS)?,
        };
        sb.validate_geometry()?;
        Ok(sb)
    }

    /// Check that the layout described by this superblock is self-consistent.
    pub fn validate_geometry(&self) -> Result<(), ParseError> {
        let block_size = BlockSize::new(self.block_size)?;
        if self.slot_count == 0 {
            return Err(ParseError::InvalidField {
                field: "slot_count",
                reason: "cannot be zero",
            });
        }
        if self.root != ObjectId(FIRST_ORPHAN_DIR_BLOCK.0 + u64::from(self.slot_count)) {
            return Err(ParseError::InvalidField {
                field: "root",
                reason: "must follow the orphan directory blocks",
            });
        }
        if self.block_count <= self.root.0 + 1 {
            return Err(ParseError::InvalidField {
                field: "block_count",
                reason: "too small for the system blocks and one object",
            });
        }
        let bitmap_bits = (u64::from(block_size.get()) - ALLOC_HEADER_LEN as u64) * 8;
        if self.block_count > bitmap_bits {
            return Err(ParseError::InvalidField {
                field: "block_count",
                reason: "exceeds allocator bitmap capacity",
            });
        }
        if self.total_clusters == 0 {
            return Err(ParseError::InvalidField {
                field: "total_clusters",
                reason: "cannot be zero",
            });
        }
        Ok(())
    }

    /// Serialize into a full block of `block_size` bytes.
    pub fn encode(&self) -> Result<Vec<u8>, ParseError> {
        let block_size = BlockSize::new(self.block_size)?.as_usize()?;
        let mut block = vec![0_u8; block_size];
        write_bytes(&mut block, 0, &SUPER_SIGNATURE)?;
        write_le_u32(&mut block, OFF_FS_GENERATION, self.fs_generation.0)?;
        write_le_u32(&mut block, OFF_BLOCK_SIZE, self.block_size)?;
        write_le_u16(&mut block, OFF_SLOT_COUNT, self.slot_count)?;
        write_le_u64(&mut block, OFF_BLOCK_COUNT, self.block_count)?;
        write_le_u64(&mut block, OFF_ROOT, self.root.0)?;
        write_le_u64(&mut block, OFF_TOTAL_CLUSTERS, self.total_clusters)?;
        stamp_checksum(&mut block[..SUPERBLOCK_REGION_LEN])?;
        Ok(block)
    }

    #[must_use]
    pub fn orphan_dir_block(&self, slot: SlotNumber) -> Option<BlockNumber> {
        (slot.0 < self.slot_count).then(|| BlockNumber(FIRST_ORPHAN_DIR_BLOCK.0 + u64::from(slot.0)))
    }

    /// First block available to ordinary objects.
    #[must_use]
    pub fn first_data_block(&self) -> BlockNumber {
        BlockNumber(self.root.0 + 1)
    }

    /// Whether `id` names one of the fixed system blocks (not the root).
    #[must_use]
    pub fn is_system_block(&self, id: ObjectId) -> bool {
        id.0 < self.root.0
    }

    pub fn slots(&self) -> impl Iterator<Item = SlotNumber> {
        (0..self.slot_count).map(SlotNumber)
    }
}
