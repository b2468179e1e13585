//! Allocator block: identity bitmap plus cluster pool counters.

use crate::{stamp_checksum, verify_checksum};
use cfs_types::{
    ALLOC_SIGNATURE, ParseError, ensure_slice, read_fixed, read_le_u32, read_le_u64, write_bytes,
    write_le_u32, write_le_u64,
};

/// Fixed header preceding the bitmap.
pub const ALLOC_HEADER_LEN: usize = 48;

const OFF_TOTAL_BITS: usize = 12;
const OFF_FREE_BITS: usize = 16;
const OFF_TOTAL_CLUSTERS: usize = 24;
const OFF_FREE_CLUSTERS: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocBlock {
    /// One bit per device block; set means in use.
    pub total_bits: u32,
    pub free_bits: u32,
    pub total_clusters: u64,
    pub free_clusters: u64,
    pub bitmap: Vec<u8>,
}

impl AllocBlock {
    /// An empty allocator covering `total_bits` blocks and `total_clusters` clusters.
    #[must_use]
    pub fn new(total_bits: u32, total_clusters: u64) -> Self {
        Self {
            total_bits,
            free_bits: total_bits,
            total_clusters,
            free_clusters: total_clusters,
            bitmap: vec![0_u8; bitmap_len(total_bits)],
        }
    }

    pub fn parse(block: &[u8]) -> Result<Self, ParseError> {
        let signature: [u8; 8] = read_fixed(block, 0)?;
        if signature != ALLOC_SIGNATURE {
            return Err(ParseError::InvalidMagic {
                expected: u64::from_le_bytes(ALLOC_SIGNATURE),
                actual: u64::from_le_bytes(signature),
            });
        }
        verify_checksum(block)?;
        let total_bits = read_le_u32(block, OFF_TOTAL_BITS)?;
        let free_bits = read_le_u32(block, OFF_FREE_BITS)?;
        if free_bits > total_bits {
            return Err(ParseError::InvalidField {
                field: "free_bits",
                reason: "exceeds total_bits",
            });
        }
        let total_clusters = read_le_u64(block, OFF_TOTAL_CLUSTERS)?;
        let free_clusters = read_le_u64(block, OFF_FREE_CLUSTERS)?;
        if free_clusters > total_clusters {
            return Err(ParseError::InvalidField {
                field: "free_clusters",
                reason: "exceeds total_clusters",
            });
        }
        let bitmap = ensure_slice(block, ALLOC_HEADER_LEN, bitmap_len(total_bits))?.to_vec();
        Ok(Self {
            total_bits,
            free_bits,
            total_clusters,
            free_clusters,
            bitmap,
        })
    }

    /// Serialize into `block`, which must be a full allocator block.
    pub fn write_into(&self, block: &mut [u8]) -> Result<(), ParseError> {
        block.fill(0);
        write_bytes(block, 0, &ALLOC_SIGNATURE)?;
        write_le_u32(block, OFF_TOTAL_BITS, self.total_bits)?;
        write_le_u32(block, OFF_FREE_BITS, self.free_bits)?;
        write_le_u64(block, OFF_TOTAL_CLUSTERS, self.total_clusters)?;
        write_le_u64(block, OFF_FREE_CLUSTERS, self.free_clusters)?;
        write_bytes(block, ALLOC_HEADER_LEN, &self.bitmap)?;
        stamp_checksum(block)
    }

    pub fn encode(&self, block_size: usize) -> Result<Vec<u8>, ParseError> {
        let mut block = vec![0_u8; block_size];
        self.write_into(&mut block)?;
        Ok(block)
    }
}

fn bitmap_len(total_bits: u32) -> usize {
    total_bits.div_ceil(8) as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_and_bitmap_survive_encoding() {
        let mut alloc = AllocBlock::new(100, 4096);
        alloc.bitmap[0] = 0b0000_0111;
        alloc.free_bits = 97;
        alloc.free_clusters = 4000;
        let block = alloc.encode(512).expect("encode");
        assert_eq!(AllocBlock::parse(&block).expect("parse"), alloc);
        assert_eq!(alloc.bitmap.len(), 13);
    }

    #[test]
    fn inconsistent_counters_are_rejected() {
        let mut alloc = AllocBlock::new(16, 8);
        alloc.free_clusters = 9;
        let block = alloc.encode(512).expect("encode");
        assert!(matches!(
            AllocBlock::parse(&block),
            Err(ParseError::InvalidField {
                field: "free_clusters",
                ..
            })
        ));
    }

    #[test]
    fn bitmap_too_large_for_block() {
        let alloc = AllocBlock::new(8 * 512, 8);
        assert!(alloc.encode(512).is_err());
    }
}
