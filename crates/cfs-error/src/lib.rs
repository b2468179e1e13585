#![forbid(unsafe_code)]
//! Error types for the object lifecycle engine.
//!
//! # Error Taxonomy
//!
//! | Class | Variant(s) | Treatment |
//! |-------|------------|-----------|
//! | I/O | `Io` | Object unusable, surfaced to caller, never retried here |
//! | Corruption | `Corruption { block, reason }` | Validator rejection; the specific reason is kept for diagnostics |
//! | Lock busy | `LockBusy` | Expected outcome; defers a delete attempt, never reported to an unlink caller |
//! | Recovery conflict | `RecoveryConflict` | A recovery scan and a wipe raced on one slot; retry later |
//! | Resource exhaustion | `NoSpace`, `CreditsExhausted` | Aborts only the in-flight transaction |
//! | Node down | `NodeDown` | Simulated crash: the node's journal refuses further commits |
//!
//! ## errno Mapping
//!
//! Every variant maps to exactly one POSIX errno via [`CfsError::to_errno`].
//! The match is exhaustive so adding a variant forces an errno decision.
//!
//! | Variant | errno |
//! |---------|-------|
//! | `Io` | raw OS error or `EIO` |
//! | `Corruption` | `EIO` |
//! | `Format` | `EINVAL` |
//! | `Parse` | `EINVAL` |
//! | `LockBusy` | `EAGAIN` |
//! | `RecoveryConflict` | `EDEADLK` |
//! | `NoSpace` | `ENOSPC` |
//! | `CreditsExhausted` | `ENOSPC` |
//! | `NotFound` | `ENOENT` |
//! | `Exists` | `EEXIST` |
//! | `Stale` | `ESTALE` |
//! | `NotOrphaned` | `EEXIST` |
//! | `InvalidArgument` | `EINVAL` |
//! | `NodeDown` | `EIO` |

use cfs_types::{NodeId, ObjectId, ParseError, SlotNumber};
use thiserror::Error;

/// Why the Validator refused a raw record block.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RecordCorruption {
    /// Block shorter than the fixed record header.
    #[error("truncated record: need {needed} bytes, got {actual}")]
    Truncated { needed: usize, actual: usize },

    #[error("checksum mismatch: stored {stored:#010x}, computed {computed:#010x}")]
    Checksum { stored: u32, computed: u32 },

    #[error("bad signature {found:?}")]
    Signature { found: [u8; 8] },

    #[error("identity mismatch: expected {expected}, record says {found}")]
    IdentityMismatch { expected: u64, found: u64 },

    #[error("VALID flag not set (flags {flags:#x})")]
    NotValid { flags: u32 },

    #[error("generation mismatch: expected {expected:#x}, record says {found:#x}")]
    GenerationMismatch { expected: u32, found: u32 },
}

/// Unified error type for all engine operations.
#[derive(Debug, Error)]
pub enum CfsError {
    /// Device read or write failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A metadata block failed validation.
    #[error("corrupt metadata at block {block}: {reason}")]
    Corruption { block: u64, reason: RecordCorruption },

    /// Structural layout or geometry problem (format time, bad superblock,
    /// malformed system blocks).
    #[error("invalid on-disk format: {0}")]
    Format(String),

    /// Parse-layer error surfaced without richer context.
    #[error("parse error: {0}")]
    Parse(String),

    /// A non-blocking cluster lock request was refused.
    #[error("lock busy on object {object}")]
    LockBusy { object: ObjectId },

    /// A recovery scan and a wipe collided on the same slot.
    #[error("orphan recovery conflict on slot {slot}")]
    RecoveryConflict { slot: SlotNumber },

    /// The space allocator (or an internal fixed-size structure) is full.
    #[error("no space left on device")]
    NoSpace,

    /// A transaction asked for more journal credits than are available.
    #[error("journal credits exhausted: requested {requested}, available {available}")]
    CreditsExhausted { requested: u32, available: u32 },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    Exists(String),

    /// The object was deleted out from under a cached handle.
    #[error("stale object {object}")]
    Stale { object: ObjectId },

    /// An unlinked object was found without its orphan marker.
    #[error("object {object} has no links but is not orphaned")]
    NotOrphaned { object: ObjectId },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The node crashed (simulated) or was fenced.
    #[error("{node} is down")]
    NodeDown { node: NodeId },
}

impl CfsError {
    /// Convert this error into a POSIX errno.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::Corruption { .. } | Self::NodeDown { .. } => libc::EIO,
            Self::Format(_) | Self::Parse(_) | Self::InvalidArgument(_) => libc::EINVAL,
            Self::LockBusy { .. } => libc::EAGAIN,
            Self::RecoveryConflict { .. } => libc::EDEADLK,
            Self::NoSpace | Self::CreditsExhausted { .. } => libc::ENOSPC,
            Self::NotFound(_) => libc::ENOENT,
            Self::Exists(_) | Self::NotOrphaned { .. } => libc::EEXIST,
            Self::Stale { .. } => libc::ESTALE,
        }
    }

    /// Whether this is the resource-exhaustion class (no journal credit or
    /// no free space).
    #[must_use]
    pub fn is_resource_exhaustion(&self) -> bool {
        matches!(self, Self::NoSpace | Self::CreditsExhausted { .. })
    }

    /// Whether this is an expected, non-fatal outcome rather than a failure.
    #[must_use]
    pub fn is_expected(&self) -> bool {
        matches!(self, Self::LockBusy { .. } | Self::RecoveryConflict { .. })
    }

    /// The corruption reason, if this is a Validator rejection.
    #[must_use]
    pub fn corruption_reason(&self) -> Option<&RecordCorruption> {
        match self {
            Self::Corruption { reason, .. } => Some(reason),
            _ => None,
        }
    }
}

impl From<ParseError> for CfsError {
    fn from(err: ParseError) -> Self {
        Self::Parse(err.to_string())
    }
}

/// Result alias using `CfsError`.
pub type Result<T> = std::result::Result<T, CfsError>;
