#![allow(dead_code)]

use cfs_block::{BlockDevice, ByteBlockDevice, MemoryByteDevice};
use cfs_core::{DeleteReport, FormatOptions, MountOptions, NodeFs, format_device};
use cfs_dlm::MemoryLockManager;
use cfs_inode::ObjectRecord;
use cfs_ondisk::{DiskRecord, Superblock};
use cfs_types::{NodeId, SlotNumber};
use std::sync::Arc;

pub const BLOCK_SIZE: u32 = 512;
pub const BLOCK_COUNT: u64 = 2048;
pub const TOTAL_CLUSTERS: u64 = 4096;

pub fn format_options() -> FormatOptions {
    FormatOptions {
        block_size: BLOCK_SIZE,
        block_count: BLOCK_COUNT,
        slot_count: 4,
        total_clusters: TOTAL_CLUSTERS,
        ..FormatOptions::default()
    }
}

pub fn memory_device() -> ByteBlockDevice<MemoryByteDevice> {
    let len = usize::try_from(BLOCK_COUNT * u64::from(BLOCK_SIZE)).expect("device length");
    ByteBlockDevice::new(MemoryByteDevice::new(len), BLOCK_SIZE).expect("block device")
}

/// One shared device and one lock manager; each mount is a node.
pub struct Cluster {
    pub dlm: Arc<MemoryLockManager>,
    pub device: Arc<dyn BlockDevice>,
    pub superblock: Superblock,
}

impl Cluster {
    pub fn new() -> Self {
        Self::on(Arc::new(memory_device()))
    }

    pub fn on(device: Arc<dyn BlockDevice>) -> Self {
        let superblock = format_device(device.as_ref(), &format_options()).expect("format");
        Self {
            dlm: Arc::new(MemoryLockManager::new()),
            device,
            superblock,
        }
    }

    pub fn options(node: u32, slot: u16) -> MountOptions {
        MountOptions {
            node: NodeId(node),
            slot: SlotNumber(slot),
            ..MountOptions::default()
        }
    }

    pub fn mount(&self, node: u32, slot: u16) -> Arc<NodeFs> {
        self.mount_with(Self::options(node, slot))
    }

    pub fn mount_with(&self, options: MountOptions) -> Arc<NodeFs> {
        NodeFs::mount(Arc::clone(&self.device), self.dlm.clone(), options).expect("mount")
    }

    /// Write a record block behind every node's back.
    pub fn write_record(&self, disk: &DiskRecord) {
        let block = disk
            .encode(usize::try_from(BLOCK_SIZE).expect("block size"))
            .expect("encode record");
        self.device
            .write_block(disk.identity.block(), &block)
            .expect("write record");
    }
}

/// Drop the last reference and return the deletion run it triggered.
pub fn release_and_delete(fs: &NodeFs, record: Arc<ObjectRecord>) -> DeleteReport {
    fs.release(record)
        .expect("release")
        .expect("last release of an unlinked object runs the state machine")
}
