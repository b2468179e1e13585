#![forbid(unsafe_code)]
//! On-disk format for object records and the structures around them.
//!
//! Pure codec crate: no I/O, no side effects. Byte slices in, typed
//! structures out (and back). Every block type starts with an 8-byte
//! signature followed by a CRC32C checksum computed over the whole block
//! with the checksum field treated as zero.

pub mod alloc;
pub mod orphan;
pub mod record;
pub mod superblock;

pub use alloc::{ALLOC_HEADER_LEN, AllocBlock};
pub use orphan::{ORPHAN_ENTRY_LEN, OrphanDirBlock, OrphanEntry, orphan_entry_name};
pub use record::{DiskRecord, RECORD_HEADER_LEN, Timestamp, validate_record};
pub use superblock::{SUPERBLOCK_REGION_LEN, Superblock};

use cfs_types::{ParseError, read_le_u32, write_le_u32};

/// Offset of the checksum field in every block type.
pub const CHECKSUM_OFFSET: usize = 8;
const CHECKSUM_END: usize = CHECKSUM_OFFSET + 4;

/// CRC32C over `block` with the checksum field zeroed.
pub fn block_checksum(block: &[u8]) -> Result<u32, ParseError> {
    if block.len() < CHECKSUM_END {
        return Err(ParseError::InsufficientData {
            needed: CHECKSUM_END,
            offset: 0,
            actual: block.len(),
        });
    }
    let csum = crc32c::crc32c(&block[..CHECKSUM_OFFSET]);
    let csum = crc32c::crc32c_append(csum, &[0, 0, 0, 0]);
    Ok(crc32c::crc32c_append(csum, &block[CHECKSUM_END..]))
}

/// Compute and store the checksum of `block`.
pub fn stamp_checksum(block: &mut [u8]) -> Result<(), ParseError> {
    let csum = block_checksum(block)?;
    write_le_u32(block, CHECKSUM_OFFSET, csum)
}

/// Returns `(stored, computed)` checksums of `block`.
pub fn checksum_pair(block: &[u8]) -> Result<(u32, u32), ParseError> {
    Ok((read_le_u32(block, CHECKSUM_OFFSET)?, block_checksum(block)?))
}

/// Verify a system block checksum, reporting a mismatch as a parse error.
pub(crate) fn verify_checksum(block: &[u8]) -> Result<(), ParseError> {
    let (stored, computed) = checksum_pair(block)?;
    if stored != computed {
        return Err(ParseError::InvalidField {
            field: "checksum",
            reason: "crc32c mismatch",
        });
    }
    Ok(())
}
