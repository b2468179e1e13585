//! Per-slot orphan directory block.
//!
//! Entries are fixed-size. Each entry's name is derived from the identity and
//! per-object generation, so a lookup by identity needs no auxiliary index.

use crate::{stamp_checksum, verify_checksum};
use cfs_types::{
    ORPHAN_DIR_SIGNATURE, ObjectId, ParseError, SlotNumber, ensure_slice, read_fixed, read_le_u16,
    read_le_u32, read_le_u64, write_bytes, write_le_u16, write_le_u32, write_le_u64,
};
use serde::{Deserialize, Serialize};

pub const ORPHAN_DIR_HEADER_LEN: usize = 32;
pub const ORPHAN_ENTRY_LEN: usize = 48;
const ORPHAN_NAME_MAX: usize = 35;

const OFF_SLOT: usize = 12;
const OFF_ENTRY_COUNT: usize = 16;

const ENTRY_OFF_GENERATION: usize = 8;
const ENTRY_OFF_NAME_LEN: usize = 12;
const ENTRY_OFF_NAME: usize = 13;

/// Directory entry name for an orphaned object, e.g. `1000/gen7`.
#[must_use]
pub fn orphan_entry_name(identity: ObjectId, generation: u32) -> String {
    format!("{}/gen{generation}", identity.0)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrphanEntry {
    pub identity: ObjectId,
    pub generation: u32,
}

impl OrphanEntry {
    #[must_use]
    pub fn name(&self) -> String {
        orphan_entry_name(self.identity, self.generation)
    }

    fn parse(raw: &[u8]) -> Result<Self, ParseError> {
        let identity = ObjectId(read_le_u64(raw, 0)?);
        let generation = read_le_u32(raw, ENTRY_OFF_GENERATION)?;
        let name_len = usize::from(read_fixed::<1>(raw, ENTRY_OFF_NAME_LEN)?[0]);
        if name_len > ORPHAN_NAME_MAX {
            return Err(ParseError::InvalidField {
                field: "orphan_name_len",
                reason: "longer than the entry name field",
            });
        }
        let name = ensure_slice(raw, ENTRY_OFF_NAME, name_len)?;
        let entry = Self {
            identity,
            generation,
        };
        if name != entry.name().as_bytes() {
            return Err(ParseError::InvalidField {
                field: "orphan_name",
                reason: "does not match identity and generation",
            });
        }
        Ok(entry)
    }

    fn write_into(&self, raw: &mut [u8]) -> Result<(), ParseError> {
        let name = self.name();
        let name_len = u8::try_from(name.len()).map_err(|_| ParseError::IntegerConversion {
            field: "orphan_name_len",
        })?;
        write_le_u64(raw, 0, self.identity.0)?;
        write_le_u32(raw, ENTRY_OFF_GENERATION, self.generation)?;
        write_bytes(raw, ENTRY_OFF_NAME_LEN, &[name_len])?;
        write_bytes(raw, ENTRY_OFF_NAME, name.as_bytes())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrphanDirBlock {
    pub slot: SlotNumber,
    pub entries: Vec<OrphanEntry>,
}

impl OrphanDirBlock {
    #[must_use]
    pub fn empty(slot: SlotNumber) -> Self {
        Self {
            slot,
            entries: Vec::new(),
        }
    }

    /// Number of entries a block of `block_size` bytes holds.
    #[must_use]
    pub fn capacity(block_size: usize) -> usize {
        block_size.saturating_sub(ORPHAN_DIR_HEADER_LEN) / ORPHAN_ENTRY_LEN
    }

    pub fn parse(block: &[u8]) -> Result<Self, ParseError> {
        let signature: [u8; 8] = read_fixed(block, 0)?;
        if signature != ORPHAN_DIR_SIGNATURE {
            return Err(ParseError::InvalidMagic {
                expected: u64::from_le_bytes(ORPHAN_DIR_SIGNATURE),
                actual: u64::from_le_bytes(signature),
            });
        }
        verify_checksum(block)?;
        let slot = SlotNumber(read_le_u16(block, OFF_SLOT)?);
        let count = usize::try_from(read_le_u32(block, OFF_ENTRY_COUNT)?).map_err(|_| {
            ParseError::IntegerConversion {
                field: "entry_count",
            }
        })?;
        if count > Self::capacity(block.len()) {
            return Err(ParseError::InvalidField {
                field: "entry_count",
                reason: "exceeds block capacity",
            });
        }
        let entries = (0..count)
            .map(|i| {
                let raw = ensure_slice(
                    block,
                    ORPHAN_DIR_HEADER_LEN + i * ORPHAN_ENTRY_LEN,
                    ORPHAN_ENTRY_LEN,
                )?;
                OrphanEntry::parse(raw)
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { slot, entries })
    }

    pub fn write_into(&self, block: &mut [u8]) -> Result<(), ParseError> {
        if self.entries.len() > Self::capacity(block.len()) {
            return Err(ParseError::InvalidField {
                field: "entry_count",
                reason: "exceeds block capacity",
            });
        }
        let count =
            u32::try_from(self.entries.len()).map_err(|_| ParseError::IntegerConversion {
                field: "entry_count",
            })?;
        block.fill(0);
        write_bytes(block, 0, &ORPHAN_DIR_SIGNATURE)?;
        write_le_u16(block, OFF_SLOT, self.slot.0)?;
        write_le_u32(block, OFF_ENTRY_COUNT, count)?;
        for (i, entry) in self.entries.iter().enumerate() {
            let start = ORPHAN_DIR_HEADER_LEN + i * ORPHAN_ENTRY_LEN;
            entry.write_into(&mut block[start..start + ORPHAN_ENTRY_LEN])?;
        }
        stamp_checksum(block)
    }

    pub fn encode(&self, block_size: usize) -> Result<Vec<u8>, ParseError> {
        let mut block = vec![0_u8; block_size];
        self.write_into(&mut block)?;
        Ok(block)
    }

    #[must_use]
    pub fn find(&self, identity: ObjectId) -> Option<&OrphanEntry> {
        self.entries.iter().find(|e| e.identity == identity)
    }

    #[must_use]
    pub fn contains_name(&self, name: &str) -> bool {
        self.entries.iter().any(|e| e.name() == name)
    }
}
