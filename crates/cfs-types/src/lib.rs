#![forbid(unsafe_code)]
//! Shared newtypes, constants, and little-endian field helpers.
//!
//! Every other crate in the workspace speaks in these types so that block
//! numbers, object identities, and slot numbers cannot be mixed up at call
//! sites.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

pub const MIN_BLOCK_SIZE: u32 = 512;
pub const MAX_BLOCK_SIZE: u32 = 65536;
pub const DEFAULT_BLOCK_SIZE: u32 = 4096;

/// Signature of an object record block.
pub const RECORD_SIGNATURE: [u8; 8] = *b"CFSOBJ01";
/// Signature of the superblock.
pub const SUPER_SIGNATURE: [u8; 8] = *b"CFSSUPER";
/// Signature of the allocator block.
pub const ALLOC_SIGNATURE: [u8; 8] = *b"CFSALLOC";
/// Signature of an orphan directory block.
pub const ORPHAN_DIR_SIGNATURE: [u8; 8] = *b"CFSORPHN";

/// Fixed block numbers of the format-time structures.
pub const SUPERBLOCK_BLOCK: BlockNumber = BlockNumber(0);
pub const ALLOC_BLOCK: BlockNumber = BlockNumber(1);
pub const FIRST_ORPHAN_DIR_BLOCK: BlockNumber = BlockNumber(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockNumber(pub u64);

/// Stable, filesystem-wide unique locator of an object record.
///
/// The identity is the block address of the record and never changes for
/// the lifetime of the object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectId(pub u64);

impl ObjectId {
    /// The block holding this object's record.
    #[must_use]
    pub fn block(self) -> BlockNumber {
        BlockNumber(self.0)
    }

    /// Index of this object's bit in the allocator bitmap.
    pub fn bitmap_bit(self) -> Result<u32, ParseError> {
        u32::try_from(self.0).map_err(|_| ParseError::IntegerConversion {
            field: "object_identity",
        })
    }
}

impl From<BlockNumber> for ObjectId {
    fn from(block: BlockNumber) -> Self {
        Self(block.0)
    }
}

/// Per-node ownership partition (orphan directories, allocation hints).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SlotNumber(pub u16);

impl SlotNumber {
    #[must_use]
    pub fn index(self) -> usize {
        usize::from(self.0)
    }
}

/// Cluster member identifier used by the lock coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(pub u32);

/// Filesystem-wide generation stamp; detects metadata from a previous format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FsGeneration(pub u32);

/// Journal transaction identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TxnId(pub u64);

/// Validated block size (power of two in 512..=65536).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockSize(u32);

impl BlockSize {
    pub fn new(value: u32) -> Result<Self, ParseError> {
        if !value.is_power_of_two() || !(MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&value) {
            return Err(ParseError::InvalidField {
                field: "block_size",
                reason: "must be power of two in 512..=65536",
            });
        }
        Ok(Self(value))
    }

    #[must_use]
    pub fn get(self) -> u32 {
        self.0
    }

    /// Block size as a buffer length.
    pub fn as_usize(self) -> Result<usize, ParseError> {
        usize::try_from(self.0).map_err(|_| ParseError::IntegerConversion {
            field: "block_size",
        })
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("insufficient data: need {needed} bytes at offset {offset}, got {actual}")]
    InsufficientData {
        needed: usize,
        offset: usize,
        actual: usize,
    },
    #[error("invalid magic: expected {expected:#x}, got {actual:#x}")]
    InvalidMagic { expected: u64, actual: u64 },
    #[error("invalid field: {field} ({reason})")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
    #[error("integer conversion failed: {field}")]
    IntegerConversion { field: &'static str },
}

#[inline]
pub fn ensure_slice(data: &[u8], offset: usize, len: usize) -> Result<&[u8], ParseError> {
    let Some(end) = offset.checked_add(len) else {
        return Err(ParseError::InvalidField {
            field: "offset",
            reason: "overflow",
        });
    };

    if end > data.len() {
        return Err(ParseError::InsufficientData {
            needed: len,
            offset,
            actual: data.len().saturating_sub(offset),
        });
    }

    Ok(&data[offset..end])
}

#[inline]
fn ensure_slice_mut(data: &mut [u8], offset: usize, len: usize) -> Result<&mut [u8], ParseError> {
    let actual = data.len().saturating_sub(offset);
    let end = offset.checked_add(len).ok_or(ParseError::InvalidField {
        field: "offset",
        reason: "overflow",
    })?;
    data.get_mut(offset..end)
        .ok_or(ParseError::InsufficientData {
            needed: len,
            offset,
            actual,
        })
}

#[inline]
pub fn read_le_u16(data: &[u8], offset: usize) -> Result<u16, ParseError> {
    let bytes = ensure_slice(data, offset, 2)?;
    Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
}

#[inline]
pub fn read_le_u32(data: &[u8], offset: usize) -> Result<u32, ParseError> {
    let bytes = ensure_slice(data, offset, 4)?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

#[inline]
pub fn read_le_u64(data: &[u8], offset: usize) -> Result<u64, ParseError> {
    let bytes = ensure_slice(data, offset, 8)?;
    Ok(u64::from_le_bytes([
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
    ]))
}

#[inline]
pub fn read_fixed<const N: usize>(data: &[u8], offset: usize) -> Result<[u8; N], ParseError> {
    let bytes = ensure_slice(data, offset, N)?;
    let mut out = [0_u8; N];
    out.copy_from_slice(bytes);
    Ok(out)
}

#[inline]
pub fn write_le_u16(data: &mut [u8], offset: usize, value: u16) -> Result<(), ParseError> {
    ensure_slice_mut(data, offset, 2)?.copy_from_slice(&value.to_le_bytes());
    Ok(())
}

#[inline]
pub fn write_le_u32(data: &mut [u8], offset: usize, value: u32) -> Result<(), ParseError> {
    ensure_slice_mut(data, offset, 4)?.copy_from_slice(&value.to_le_bytes());
    Ok(())
}

#[inline]
pub fn write_le_u64(data: &mut [u8], offset: usize, value: u64) -> Result<(), ParseError> {
    ensure_slice_mut(data, offset, 8)?.copy_from_slice(&value.to_le_bytes());
    Ok(())
}

#[inline]
pub fn write_bytes(data: &mut [u8], offset: usize, bytes: &[u8]) -> Result<(), ParseError> {
    ensure_slice_mut(data, offset, bytes.len())?.copy_from_slice(bytes);
    Ok(())
}

impl fmt::Display for BlockNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for SlotNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node{}", self.0)
    }
}

impl fmt::Display for FsGeneration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

impl fmt::Display for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for BlockSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ── POSIX file mode constants ────────────────────────────────────────────────

/// File type mask (upper 4 bits of mode).
pub const S_IFMT: u16 = 0o170_000;
/// Named pipe (FIFO).
pub const S_IFIFO: u16 = 0o010_000;
/// Character device.
pub const S_IFCHR: u16 = 0o020_000;
/// Directory.
pub const S_IFDIR: u16 = 0o040_000;
/// Block device.
pub const S_IFBLK: u16 = 0o060_000;
/// Regular file.
pub const S_IFREG: u16 = 0o100_000;
/// Symbolic link.
pub const S_IFLNK: u16 = 0o120_000;
/// Socket.
pub const S_IFSOCK: u16 = 0o140_000;

// ── Object record flags (on-disk `flags`) ───────────────────────────────────

/// Record is live and trusted.
pub const RECORD_VALID_FL: u32 = 0x0000_0001;
/// Filesystem-internal object.
pub const RECORD_SYSTEM_FL: u32 = 0x0000_0002;
/// Unlinked, sitting in an orphan directory awaiting wipe.
pub const RECORD_ORPHANED_FL: u32 = 0x0000_0004;
/// Allocation bitmap object.
pub const RECORD_BITMAP_FL: u32 = 0x0000_0008;
/// Quota object.
pub const RECORD_QUOTA_FL: u32 = 0x0000_0010;
/// Superblock object; never loaded through the object cache.
pub const RECORD_SUPERBLOCK_FL: u32 = 0x0000_0020;
/// Object shares extents through a reference-counted extent tree.
pub const RECORD_HAS_REFCOUNT_FL: u32 = 0x0000_0040;

// ── Dynamic feature flags (on-disk `dynamic_flags`) ─────────────────────────

/// Data stored inline in the record block.
pub const DYN_INLINE_DATA_FL: u16 = 0x0001;
/// Object carries extended attributes.
pub const DYN_HAS_XATTR_FL: u16 = 0x0002;
/// Directory has a specialized index structure.
pub const DYN_INDEXED_DIR_FL: u16 = 0x0004;

// ── Attribute flags (on-disk `attr`) ────────────────────────────────────────

/// Synchronous updates.
pub const ATTR_SYNC_FL: u32 = 0x0000_0001;
/// Append-only.
pub const ATTR_APPEND_FL: u32 = 0x0000_0002;
/// Immutable.
pub const ATTR_IMMUTABLE_FL: u32 = 0x0000_0004;
/// Do not update access time.
pub const ATTR_NOATIME_FL: u32 = 0x0000_0008;
/// Directory updates are synchronous.
pub const ATTR_DIRSYNC_FL: u32 = 0x0000_0010;

/// All attribute bits this format understands.
pub const ATTR_KNOWN_MASK: u32 =
    ATTR_SYNC_FL | ATTR_APPEND_FL | ATTR_IMMUTABLE_FL | ATTR_NOATIME_FL | ATTR_DIRSYNC_FL;
