mod common;

use cfs_alloc::is_allocated;
use cfs_block::{BlockDevice, FaultyBlockDevice};
use cfs_core::{DeferReason, DeleteOutcome, MountOptions, NewObject, NodeFs};
use cfs_error::CfsError;
use cfs_types::{ALLOC_BLOCK, DYN_HAS_XATTR_FL, NodeId, SlotNumber};
use common::{Cluster, TOTAL_CLUSTERS, memory_device, release_and_delete};
use std::sync::Arc;

fn crash_options() -> MountOptions {
    MountOptions {
        truncate_batch_clusters: 4,
        ..Cluster::options(1, 0)
    }
}

/// An unlinked, still referenced object carrying clusters and an xattr.
fn orphan_with_storage(fs: &NodeFs) -> Arc<cfs_inode::ObjectRecord> {
    let record = fs.create(&NewObject::default()).expect("create");
    fs.extend(&record, 10, 4000).expect("extend");
    fs.set_dynamic_flags(&record, DYN_HAS_XATTR_FL)
        .expect("xattr flag");
    fs.unlink(&record).expect("unlink");
    record
}

#[test]
fn crash_after_any_delete_commit_converges_through_recovery() {
    // Measure how many commits a clean delete takes.
    let commits = {
        let cluster = Cluster::new();
        let fs = cluster.mount_with(crash_options());
        let record = orphan_with_storage(&fs);
        let before = fs.journal().committed();
        let report = release_and_delete(&fs, record);
        assert!(report.is_deleted());
        fs.journal().committed() - before
    };
    // Size, three truncation batches, xattr removal, detach.
    assert_eq!(commits, 6);

    for survived in 0..commits {
        let cluster = Cluster::new();
        let fs = cluster.mount_with(crash_options());
        let free_bits = fs.allocator_snapshot().expect("allocator").free_bits;
        let record = orphan_with_storage(&fs);
        let id = record.id();

        fs.journal().crash_after(survived);
        let report = release_and_delete(&fs, record);
        assert!(
            matches!(report.outcome, DeleteOutcome::Failed(CfsError::NodeDown { .. })),
            "crash after {survived} commits: {:?}",
            report.outcome
        );
        assert!(fs.journal().is_crashed());

        // Still durably orphaned whatever step the crash interrupted.
        let inspection = fs.inspect(id).expect("inspect");
        assert!(inspection.is_valid());
        assert!(inspection.record.is_orphaned());
        assert_eq!(inspection.record.deletion_time, 0);

        cluster.dlm.node_down(NodeId(1));
        drop(fs);
        cluster.dlm.node_up(NodeId(1));

        let fs = cluster.mount_with(crash_options());
        let recovered = fs.recover_orphans(SlotNumber(0)).expect("recover");
        assert_eq!(recovered.scanned, 1);
        assert_eq!(recovered.deleted, vec![id], "crash after {survived}");
        assert!(recovered.is_clean());

        let inspection = fs.inspect(id).expect("inspect");
        assert!(!inspection.is_valid());
        assert_ne!(inspection.record.deletion_time, 0);
        assert_eq!(inspection.record.cluster_count, 0);
        assert!(fs.scan_orphans(SlotNumber(0)).expect("scan").is_empty());
        let alloc = fs.allocator_snapshot().expect("allocator");
        assert!(!is_allocated(&alloc, id).expect("bit"));
        assert_eq!(alloc.free_bits, free_bits, "crash after {survived}");
        assert_eq!(alloc.free_clusters, TOTAL_CLUSTERS, "crash after {survived}");
    }

    // A crash right after the detach commit leaves recovery nothing to redo.
    let cluster = Cluster::new();
    let fs = cluster.mount_with(crash_options());
    let free_bits = fs.allocator_snapshot().expect("allocator").free_bits;
    let record = orphan_with_storage(&fs);
    let id = record.id();
    fs.journal().crash_after(commits);
    let report = release_and_delete(&fs, record);
    assert!(report.is_deleted(), "outcome: {:?}", report.outcome);

    cluster.dlm.node_down(NodeId(1));
    drop(fs);
    cluster.dlm.node_up(NodeId(1));

    let fs = cluster.mount_with(crash_options());
    let recovered = fs.recover_orphans(SlotNumber(0)).expect("recover");
    assert_eq!(recovered.scanned, 0);
    assert!(recovered.deleted.is_empty());
    assert!(recovered.is_clean());
    assert!(!fs.inspect(id).expect("inspect").is_valid());
    let alloc = fs.allocator_snapshot().expect("allocator");
    assert!(!is_allocated(&alloc, id).expect("bit"));
    assert_eq!(alloc.free_bits, free_bits, "identity bit freed once");
    assert_eq!(alloc.free_clusters, TOTAL_CLUSTERS);
}

#[test]
fn surviving_node_recovers_a_crashed_nodes_slot() {
    let cluster = Cluster::new();
    let node1 = cluster.mount(1, 0);
    let node2 = cluster.mount(2, 1);

    let record = node1.create(&NewObject::default()).expect("create");
    let id = record.id();
    node1.unlink(&record).expect("unlink");

    // Node 1 dies holding the orphan open.
    cluster.dlm.node_down(NodeId(1));
    drop(record);
    drop(node1);

    let report = node2.recover_orphans(SlotNumber(0)).expect("recover");
    assert_eq!(report.deleted, vec![id]);
    assert!(node2.scan_orphans(SlotNumber(0)).expect("scan").is_empty());
    assert!(!node2.inspect(id).expect("inspect").is_valid());
}

#[test]
fn recovery_skips_orphans_being_wiped_elsewhere() {
    use cfs_dlm::{LockCoordinator, LockKind, LockMode, LockResource, LockWait};

    let cluster = Cluster::new();
    let node1 = cluster.mount(1, 0);
    let node2 = cluster.mount(2, 1);

    let record = node1.create(&NewObject::default()).expect("create");
    let busy = record.id();
    node1.unlink(&record).expect("unlink");
    cluster.dlm.node_down(NodeId(1));
    drop(record);
    drop(node1);

    // Another node holds the open lock exclusively, as a wiping node would.
    let open = LockResource::new(busy, LockKind::Open);
    let grant = cluster
        .dlm
        .lock(NodeId(7), open, LockMode::Exclusive, LockWait::Blocking)
        .expect("exclusive open");
    assert!(grant.is_granted());

    let report = node2.recover_orphans(SlotNumber(0)).expect("recover");
    assert_eq!(report.scanned, 1);
    assert_eq!(report.skipped, vec![busy]);
    assert!(report.deleted.is_empty());
    assert!(!node2.table().contains(busy));
    assert!(!node2.registry().is_recovering(SlotNumber(0)));
    assert!(
        node2
            .registry()
            .contains(node2.journal(), SlotNumber(0), busy)
            .expect("contains")
    );
}

#[test]
fn recovery_and_wipes_exclude_each_other_per_slot() {
    let cluster = Cluster::new();
    let fs = cluster.mount(1, 0);
    let slot = SlotNumber(0);

    // A wipe in flight refuses a recovery scan.
    fs.registry().note_wipe_start(slot).expect("wipe start");
    assert!(matches!(
        fs.recover_orphans(slot),
        Err(CfsError::RecoveryConflict { .. })
    ));
    assert!(!fs.registry().is_recovering(slot));
    fs.registry().note_wipe_end(slot).expect("wipe end");

    // A recovery in progress defers a wipe.
    let record = fs.create(&NewObject::default()).expect("create");
    let id = record.id();
    fs.unlink(&record).expect("unlink");
    fs.registry().begin_recovery(slot).expect("begin recovery");
    let report = release_and_delete(&fs, record);
    assert!(matches!(
        report.outcome,
        DeleteOutcome::Deferred(DeferReason::SlotRecovering)
    ));
    assert_eq!(fs.registry().wipes_in_progress(slot), 0);
    assert!(fs.inspect(id).expect("inspect").record.is_orphaned());
    fs.registry().end_recovery(slot).expect("end recovery");

    let recovered = fs.recover_orphans(slot).expect("recover");
    assert_eq!(recovered.deleted, vec![id]);
    assert!(!fs.registry().is_recovering(slot));
}

#[test]
fn blocking_recovery_waits_for_the_wipe_to_finish() {
    let cluster = Cluster::new();
    let fs = cluster.mount(1, 0);
    let slot = SlotNumber(0);
    let record = fs.create(&NewObject::default()).expect("create");
    let id = record.id();
    fs.unlink(&record).expect("unlink");

    fs.registry().note_wipe_start(slot).expect("wipe start");
    std::thread::scope(|scope| {
        let recovery = scope.spawn(|| fs.recover_orphans_blocking(slot));
        std::thread::sleep(std::time::Duration::from_millis(20));
        assert!(!recovery.is_finished());
        fs.registry().note_wipe_end(slot).expect("wipe end");
        let report = recovery.join().expect("recovery thread").expect("recover");
        assert_eq!(report.scanned, 1);
        // Our own reference keeps the object alive past the recovery pass.
        assert_eq!(report.deferred, vec![id]);
    });
    assert_eq!(fs.table().refs(id), Some(1));

    let report = release_and_delete(&fs, record);
    assert!(report.is_deleted());
    assert!(fs.scan_orphans(slot).expect("scan").is_empty());
}

#[test]
fn failed_detach_leaves_the_object_orphaned_for_recovery() {
    let faulty = Arc::new(FaultyBlockDevice::new(memory_device()));
    let device: Arc<dyn BlockDevice> = faulty.clone();
    let cluster = Cluster::on(device);
    let fs = cluster.mount(1, 0);

    let record = fs.create(&NewObject::default()).expect("create");
    let id = record.id();
    fs.unlink(&record).expect("unlink");

    faulty.fail_writes_to(ALLOC_BLOCK);
    let report = release_and_delete(&fs, record);
    assert!(matches!(report.outcome, DeleteOutcome::Failed(CfsError::Io(_))));
    assert!(!fs.table().contains(id));

    let inspection = fs.inspect(id).expect("inspect");
    assert!(inspection.is_valid());
    assert!(inspection.record.is_orphaned());
    assert_eq!(inspection.record.deletion_time, 0);
    let entries = fs.scan_orphans(SlotNumber(0)).expect("scan");
    assert_eq!(entries.len(), 1);
    let alloc = fs.allocator_snapshot().expect("allocator");
    assert!(is_allocated(&alloc, id).expect("bit"));

    faulty.heal();
    let recovered = fs.recover_orphans(SlotNumber(0)).expect("recover");
    assert_eq!(recovered.deleted, vec![id]);
    assert!(!fs.inspect(id).expect("inspect").is_valid());
    let alloc = fs.allocator_snapshot().expect("allocator");
    assert!(!is_allocated(&alloc, id).expect("bit"));
}

#[test]
fn recovery_of_an_empty_slot_reports_nothing() {
    let cluster = Cluster::new();
    let fs = cluster.mount(1, 2);
    let report = fs.recover_orphans(SlotNumber(3)).expect("recover");
    assert_eq!(report.scanned, 0);
    assert!(report.is_clean());
    let json = serde_json::to_value(&report).expect("json");
    assert_eq!(json["slot"], 3);
    assert!(matches!(
        fs.recover_orphans(SlotNumber(9)),
        Err(CfsError::InvalidArgument(_))
    ));
}
