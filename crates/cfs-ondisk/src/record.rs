//! Object record block: parsing, encoding, and the Validator.

use crate::{checksum_pair, stamp_checksum};
use cfs_error::RecordCorruption;
use cfs_types::{
    FsGeneration, ObjectId, ParseError, RECORD_HAS_REFCOUNT_FL, RECORD_ORPHANED_FL,
    RECORD_SIGNATURE, RECORD_SYSTEM_FL, RECORD_VALID_FL, S_IFDIR, S_IFMT, SlotNumber, read_fixed,
    read_le_u16, read_le_u32, read_le_u64, write_bytes, write_le_u16, write_le_u32, write_le_u64,
};
use serde::{Deserialize, Serialize};

/// Length of the fixed record header; the rest of the block is zero.
pub const RECORD_HEADER_LEN: usize = 128;

const OFF_FS_GENERATION: usize = 12;
const OFF_IDENTITY: usize = 16;
const OFF_FLAGS: usize = 24;
const OFF_LINK_COUNT: usize = 28;
const OFF_DYNAMIC_FLAGS: usize = 30;
const OFF_SIZE: usize = 32;
const OFF_CLUSTER_COUNT: usize = 40;
const OFF_OWNING_SLOT: usize = 44;
const OFF_ORPHANED_SLOT: usize = 46;
const OFF_DELETION_TIME: usize = 48;
const OFF_UID: usize = 56;
const OFF_GID: usize = 60;
const OFF_MODE: usize = 64;
const OFF_GENERATION: usize = 68;
const OFF_DEVICE_ID: usize = 72;
const OFF_ATIME: usize = 80;
const OFF_MTIME: usize = 88;
const OFF_CTIME: usize = 96;
const OFF_ATIME_NSEC: usize = 104;
const OFF_MTIME_NSEC: usize = 108;
const OFF_CTIME_NSEC: usize = 112;
const OFF_ATTR: usize = 116;

/// Seconds/nanoseconds pair as stored on disk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timestamp {
    pub sec: u64,
    pub nsec: u32,
}

/// Persisted fields of an object record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskRecord {
    pub fs_generation: FsGeneration,
    pub identity: ObjectId,
    pub flags: u32,
    pub link_count: u16,
    pub dynamic_flags: u16,
    pub size: u64,
    pub cluster_count: u32,
    pub owning_slot: SlotNumber,
    pub orphaned_slot: SlotNumber,
    /// Zero while the object is live.
    pub deletion_time: u64,
    pub uid: u32,
    pub gid: u32,
    pub mode: u16,
    /// Per-object generation, part of the orphan entry name.
    pub generation: u32,
    pub device_id: u64,
    pub atime: Timestamp,
    pub mtime: Timestamp,
    pub ctime: Timestamp,
    pub attr: u32,
}

impl DiskRecord {
    /// A fresh, VALID, singly-linked record.
    #[must_use]
    pub fn new_live(
        identity: ObjectId,
        fs_generation: FsGeneration,
        generation: u32,
        mode: u16,
        owning_slot: SlotNumber,
    ) -> Self {
        let link_count = if mode & S_IFMT == S_IFDIR { 2 } else { 1 };
        Self {
            fs_generation,
            identity,
            flags: RECORD_VALID_FL,
            link_count,
            dynamic_flags: 0,
            size: 0,
            cluster_count: 0,
            owning_slot,
            orphaned_slot: owning_slot,
            deletion_time: 0,
            uid: 0,
            gid: 0,
            mode,
            generation,
            device_id: 0,
            atime: Timestamp::default(),
            mtime: Timestamp::default(),
            ctime: Timestamp::default(),
            attr: 0,
        }
    }

    /// Parse the header fields. Does not validate; see [`validate_record`].
    pub fn parse(block: &[u8]) -> Result<Self, ParseError> {
        let signature: [u8; 8] = read_fixed(block, 0)?;
        if signature != RECORD_SIGNATURE {
            return Err(ParseError::InvalidMagic {
                expected: u64::from_le_bytes(RECORD_SIGNATURE),
                actual: u64::from_le_bytes(signature),
            });
        }
        Ok(Self {
            fs_generation: FsGeneration(read_le_u32(block, OFF_FS_GENERATION)?),
            identity: ObjectId(read_le_u64(block, OFF_IDENTITY)?),
            flags: read_le_u32(block, OFF_FLAGS)?,
            link_count: read_le_u16(block, OFF_LINK_COUNT)?,
            dynamic_flags: read_le_u16(block, OFF_DYNAMIC_FLAGS)?,
            size: read_le_u64(block, OFF_SIZE)?,
            cluster_count: read_le_u32(block, OFF_CLUSTER_COUNT)?,
            owning_slot: SlotNumber(read_le_u16(block, OFF_OWNING_SLOT)?),
            orphaned_slot: SlotNumber(read_le_u16(block, OFF_ORPHANED_SLOT)?),
            deletion_time: read_le_u64(block, OFF_DELETION_TIME)?,
            uid: read_le_u32(block, OFF_UID)?,
            gid: read_le_u32(block, OFF_GID)?,
            mode: read_le_u16(block, OFF_MODE)?,
            generation: read_le_u32(block, OFF_GENERATION)?,
            device_id: read_le_u64(block, OFF_DEVICE_ID)?,
            atime: Timestamp {
                sec: read_le_u64(block, OFF_ATIME)?,
                nsec: read_le_u32(block, OFF_ATIME_NSEC)?,
            },
            mtime: Timestamp {
                sec: read_le_u64(block, OFF_MTIME)?,
                nsec: read_le_u32(block, OFF_MTIME_NSEC)?,
            },
            ctime: Timestamp {
                sec: read_le_u64(block, OFF_CTIME)?,
                nsec: read_le_u32(block, OFF_CTIME_NSEC)?,
            },
            attr: read_le_u32(block, OFF_ATTR)?,
        })
    }

    /// Validate `block` and parse it in one step.
    pub fn parse_validated(
        block: &[u8],
        expected_identity: ObjectId,
        expected_generation: FsGeneration,
    ) -> Result<Self, RecordCorruption> {
        validate_record(block, expected_identity, expected_generation)?;
        Self::parse(block).map_err(|_| RecordCorruption::Truncated {
            needed: RECORD_HEADER_LEN,
            actual: block.len(),
        })
    }

    /// Serialize into `block`, overwriting the header and stamping the checksum.
    ///
    /// Bytes past the header are zeroed.
    pub fn write_into(&self, block: &mut [u8]) -> Result<(), ParseError> {
        if block.len() < RECORD_HEADER_LEN {
            return Err(ParseError::InsufficientData {
                needed: RECORD_HEADER_LEN,
                offset: 0,
                actual: block.len(),
            });
        }
        block.fill(0);
        write_bytes(block, 0, &RECORD_SIGNATURE)?;
        write_le_u32(block, OFF_FS_GENERATION, self.fs_generation.0)?;
        write_le_u64(block, OFF_IDENTITY, self.identity.0)?;
        write_le_u32(block, OFF_FLAGS, self.flags)?;
        write_le_u16(block, OFF_LINK_COUNT, self.link_count)?;
        write_le_u16(block, OFF_DYNAMIC_FLAGS, self.dynamic_flags)?;
        write_le_u64(block, OFF_SIZE, self.size)?;
        write_le_u32(block, OFF_CLUSTER_COUNT, self.cluster_count)?;
        write_le_u16(block, OFF_OWNING_SLOT, self.owning_slot.0)?;
        write_le_u16(block, OFF_ORPHANED_SLOT, self.orphaned_slot.0)?;
        write_le_u64(block, OFF_DELETION_TIME, self.deletion_time)?;
        write_le_u32(block, OFF_UID, self.uid)?;
        write_le_u32(block, OFF_GID, self.gid)?;
        write_le_u16(block, OFF_MODE, self.mode)?;
        write_le_u32(block, OFF_GENERATION, self.generation)?;
        write_le_u64(block, OFF_DEVICE_ID, self.device_id)?;
        write_le_u64(block, OFF_ATIME, self.atime.sec)?;
        write_le_u64(block, OFF_MTIME, self.mtime.sec)?;
        write_le_u64(block, OFF_CTIME, self.ctime.sec)?;
        write_le_u32(block, OFF_ATIME_NSEC, self.atime.nsec)?;
        write_le_u32(block, OFF_MTIME_NSEC, self.mtime.nsec)?;
        write_le_u32(block, OFF_CTIME_NSEC, self.ctime.nsec)?;
        write_le_u32(block, OFF_ATTR, self.attr)?;
        stamp_checksum(block)
    }

    /// Serialize into a fresh zeroed block of `block_size` bytes.
    pub fn encode(&self, block_size: usize) -> Result<Vec<u8>, ParseError> {
        let mut block = vec![0_u8; block_size];
        self.write_into(&mut block)?;
        Ok(block)
    }

    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.flags & RECORD_VALID_FL != 0
    }

    #[must_use]
    pub fn is_orphaned(&self) -> bool {
        self.flags & RECORD_ORPHANED_FL != 0
    }

    #[must_use]
    pub fn is_system(&self) -> bool {
        self.flags & RECORD_SYSTEM_FL != 0
    }

    #[must_use]
    pub fn has_refcounted_extents(&self) -> bool {
        self.flags & RECORD_HAS_REFCOUNT_FL != 0
    }
}

/// Verify a raw record block before trusting it.
///
/// Checks, in order: checksum, signature, identity, VALID flag, filesystem
/// generation. The first failure is returned with its specific reason.
pub fn validate_record(
    block: &[u8],
    expected_identity: ObjectId,
    expected_generation: FsGeneration,
) -> Result<(), RecordCorruption> {
    let truncated = || RecordCorruption::Truncated {
        needed: RECORD_HEADER_LEN,
        actual: block.len(),
    };
    if block.len() < RECORD_HEADER_LEN {
        return Err(truncated());
    }

    let (stored, computed) = checksum_pair(block).map_err(|_| truncated())?;
    if stored != computed {
        return Err(RecordCorruption::Checksum { stored, computed });
    }

    let signature: [u8; 8] = read_fixed(block, 0).map_err(|_| truncated())?;
    if signature != RECORD_SIGNATURE {
        return Err(RecordCorruption::Signature { found: signature });
    }

    let identity = read_le_u64(block, OFF_IDENTITY).map_err(|_| truncated())?;
    if identity != expected_identity.0 {
        return Err(RecordCorruption::IdentityMismatch {
            expected: expected_identity.0,
            found: identity,
        });
    }

    let flags = read_le_u32(block, OFF_FLAGS).map_err(|_| truncated())?;
    if flags & RECORD_VALID_FL == 0 {
        return Err(RecordCorruption::NotValid { flags });
    }

    let fs_generation = read_le_u32(block, OFF_FS_GENERATION).map_err(|_| truncated())?;
    if fs_generation != expected_generation.0 {
        return Err(RecordCorruption::GenerationMismatch {
            expected: expected_generation.0,
            found: fs_generation,
        });
    }

    Ok(())
}
