//! Formatting a fresh filesystem.

use crate::ops::now;
use cfs_alloc::BitmapAllocator;
use cfs_block::{BlockDevice, ByteBlockDevice, FileByteDevice};
use cfs_error::{CfsError, Result};
use cfs_ondisk::{DiskRecord, OrphanDirBlock, Superblock};
use cfs_types::{
    ALLOC_BLOCK, DEFAULT_BLOCK_SIZE, FsGeneration, S_IFDIR, SUPERBLOCK_BLOCK, SlotNumber,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

/// Geometry of a new filesystem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormatOptions {
    /// Power of two in 512..=65536. Default: 4096.
    pub block_size: u32,
    /// Default: 4096.
    pub block_count: u64,
    /// Ownership slots, one orphan directory each. Default: 4.
    pub slot_count: u16,
    pub fs_generation: FsGeneration,
    /// Size of the data cluster pool. Default: 1 << 20.
    pub total_clusters: u64,
}

impl Default for FormatOptions {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            block_count: 4096,
            slot_count: 4,
            fs_generation: FsGeneration(1),
            total_clusters: 1 << 20,
        }
    }
}

/// Write a fresh filesystem onto `device`: superblock, allocator, one empty
/// orphan directory per slot and the root directory.
pub fn format_device(device: &dyn BlockDevice, options: &FormatOptions) -> Result<Superblock> {
    if device.block_size() != options.block_size {
        return Err(CfsError::Format(format!(
            "device block size {} does not match requested {}",
            device.block_size(),
            options.block_size
        )));
    }
    if device.block_count() < options.block_count {
        return Err(CfsError::Format(format!(
            "device has {} blocks, {} requested",
            device.block_count(),
            options.block_count
        )));
    }
    let sb = Superblock::new(
        options.fs_generation,
        options.block_size,
        options.block_count,
        options.slot_count,
        options.total_clusters,
    );
    sb.validate_geometry()?;
    let block_len = usize::try_from(options.block_size)
        .map_err(|_| CfsError::Format("block_size does not fit usize".to_owned()))?;

    let total_bits = u32::try_from(sb.block_count)
        .map_err(|_| CfsError::Format("block_count exceeds the allocator bitmap".to_owned()))?;
    let reserved = u32::try_from(sb.first_data_block().0)
        .map_err(|_| CfsError::Format("system area exceeds the allocator bitmap".to_owned()))?;
    let alloc = BitmapAllocator::initial(total_bits, reserved, sb.total_clusters)?;

    device.write_block(SUPERBLOCK_BLOCK, &sb.encode()?)?;
    device.write_block(ALLOC_BLOCK, &alloc.encode(block_len)?)?;
    for slot in sb.slots() {
        let block = sb
            .orphan_dir_block(slot)
            .ok_or_else(|| CfsError::Format(format!("no orphan directory for slot {slot}")))?;
        device.write_block(block, &OrphanDirBlock::empty(slot).encode(block_len)?)?;
    }

    let mut root = DiskRecord::new_live(sb.root, sb.fs_generation, 1, S_IFDIR | 0o755, SlotNumber(0));
    let stamp = now();
    root.atime = stamp;
    root.mtime = stamp;
    root.ctime = stamp;
    device.write_block(sb.root.block(), &root.encode(block_len)?)?;
    device.sync()?;

    info!(
        target: "cfs::core",
        event = "mkfs",
        block_size = sb.block_size,
        block_count = sb.block_count,
        slot_count = sb.slot_count,
        root = sb.root.0
    );
    Ok(sb)
}

/// Create an image file at `path` and format it.
pub fn mkfs(path: impl AsRef<Path>, options: &FormatOptions) -> Result<Superblock> {
    let len = options
        .block_count
        .checked_mul(u64::from(options.block_size))
        .ok_or_else(|| CfsError::Format("image size overflows u64".to_owned()))?;
    let file = FileByteDevice::create(path, len)?;
    let device = ByteBlockDevice::new(file, options.block_size)?;
    format_device(&device, options)
}
