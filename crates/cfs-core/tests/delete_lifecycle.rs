mod common;

use cfs_alloc::is_allocated;
use cfs_core::{
    DeferReason, DeleteOutcome, DeleteState, FormatOptions, MountOptions, NewObject, NodeFs,
    OpenFlags, RetireReason, mkfs,
};
use cfs_dlm::{LockCoordinator, LockKind, LockMode, LockResource, LockWait};
use cfs_inode::LocalFlags;
use cfs_journal::credits;
use cfs_types::{
    DYN_INDEXED_DIR_FL, NodeId, ObjectId, RECORD_ORPHANED_FL, RECORD_VALID_FL, S_IFDIR,
    SlotNumber,
};
use common::{Cluster, TOTAL_CLUSTERS, release_and_delete};
use std::sync::{Arc, Barrier};
use std::thread;

fn assert_fully_deleted(fs: &NodeFs, id: ObjectId, slot: SlotNumber) {
    let inspection = fs.inspect(id).expect("inspect");
    assert!(!inspection.is_valid(), "validator must refuse a deleted record");
    assert_eq!(inspection.record.flags & RECORD_VALID_FL, 0);
    assert!(!inspection.record.is_orphaned());
    assert_ne!(inspection.record.deletion_time, 0);
    assert_eq!(inspection.record.cluster_count, 0);
    assert_eq!(inspection.record.size, 0);

    let entries = fs.scan_orphans(slot).expect("scan");
    assert!(entries.iter().all(|entry| entry.identity != id));

    let alloc = fs.allocator_snapshot().expect("allocator");
    assert!(!is_allocated(&alloc, id).expect("bit"));
    assert_eq!(alloc.free_clusters, TOTAL_CLUSTERS);
    assert!(!fs.table().contains(id));
}

#[test]
fn unlinked_object_is_wiped_on_last_release() {
    let cluster = Cluster::new();
    let fs = cluster.mount(1, 3);
    let free_before = fs.allocator_snapshot().expect("allocator").free_bits;

    let record = fs
        .create(&NewObject {
            near: Some(ObjectId(1000)),
            generation: Some(7),
            ..NewObject::default()
        })
        .expect("create");
    let id = record.id();
    assert_eq!(id, ObjectId(1000));
    fs.extend(&record, 10, 5000).expect("extend");
    assert_eq!(
        fs.allocator_snapshot().expect("allocator").free_clusters,
        TOTAL_CLUSTERS - 10
    );

    fs.unlink(&record).expect("unlink");
    let entries = fs.scan_orphans(SlotNumber(3)).expect("scan");
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].name(), "1000/gen7");
    let on_disk = fs.inspect(id).expect("inspect");
    assert!(on_disk.is_valid());
    assert!(on_disk.record.is_orphaned());
    assert_eq!(on_disk.record.orphaned_slot, SlotNumber(3));

    let report = release_and_delete(&fs, record);
    assert!(report.is_deleted(), "outcome: {:?}", report.outcome);
    assert_eq!(
        report.trace,
        vec![
            DeleteState::Live,
            DeleteState::CandidateForDelete,
            DeleteState::AttemptExclusiveOpen,
            DeleteState::Wiping,
            DeleteState::DetachingAuxiliaryStorage,
            DeleteState::Detaching,
            DeleteState::Deleted,
        ]
    );
    assert_fully_deleted(&fs, id, SlotNumber(3));
    assert_eq!(fs.allocator_snapshot().expect("allocator").free_bits, free_before);

    let open = LockResource::new(id, LockKind::Open);
    assert!(cluster.dlm.holders(open).is_empty());
}

#[test]
fn linked_object_stays_cached_on_release() {
    let cluster = Cluster::new();
    let fs = cluster.mount(1, 0);
    let record = fs.create(&NewObject::default()).expect("create");
    let id = record.id();
    fs.link(&record).expect("link");
    fs.unlink(&record).expect("unlink one of two names");

    assert!(fs.release(record).expect("release").is_none());
    assert!(fs.table().contains(id));
    assert_eq!(fs.table().refs(id), Some(0));
    assert!(fs.scan_orphans(SlotNumber(0)).expect("scan").is_empty());
    assert_eq!(fs.inspect(id).expect("inspect").record.link_count, 1);
}

#[test]
fn directory_is_orphaned_by_its_last_name() {
    let cluster = Cluster::new();
    let fs = cluster.mount(1, 0);
    let dir = fs.create(&NewObject::with_mode(S_IFDIR | 0o755)).expect("mkdir");
    let id = dir.id();
    assert_eq!(dir.disk().link_count, 2);
    fs.link(&dir).expect("second name");

    fs.unlink(&dir).expect("drop one name");
    let inspection = fs.inspect(id).expect("inspect");
    assert_eq!(inspection.record.link_count, 2);
    assert!(!inspection.record.is_orphaned());
    assert!(fs.scan_orphans(SlotNumber(0)).expect("scan").is_empty());

    fs.unlink(&dir).expect("rmdir");
    let inspection = fs.inspect(id).expect("inspect");
    assert_eq!(inspection.record.link_count, 0);
    assert!(inspection.record.is_orphaned());

    let report = release_and_delete(&fs, dir);
    assert!(report.is_deleted());
    assert_fully_deleted(&fs, id, SlotNumber(0));
}

#[test]
fn root_cannot_be_unlinked() {
    let cluster = Cluster::new();
    let fs = cluster.mount(1, 0);
    let root = fs.acquire(fs.root(), OpenFlags::empty()).expect("root");
    assert!(matches!(
        fs.unlink(&root),
        Err(cfs_error::CfsError::InvalidArgument(_))
    ));
    assert!(fs.release(root).expect("release").is_none());
}

#[test]
fn delete_is_deferred_while_another_node_has_it_open() {
    let cluster = Cluster::new();
    let node1 = cluster.mount(1, 0);
    let node2 = cluster.mount(2, 1);

    let record1 = node1.create(&NewObject::default()).expect("create");
    let id = record1.id();
    node1.extend(&record1, 3, 1500).expect("extend");
    let record2 = node2.acquire(id, OpenFlags::empty()).expect("open on node 2");

    node1.unlink(&record1).expect("unlink");
    let report = release_and_delete(&node1, record1);
    assert!(matches!(
        report.outcome,
        DeleteOutcome::Deferred(DeferReason::OpenElsewhere)
    ));
    assert!(report.visited(DeleteState::AttemptExclusiveOpen));
    assert!(!report.visited(DeleteState::Wiping));

    // Untouched: still orphaned with its entry and its clusters.
    let inspection = node1.inspect(id).expect("inspect");
    assert!(inspection.is_valid());
    assert!(inspection.record.is_orphaned());
    assert_eq!(inspection.record.cluster_count, 3);
    assert!(
        node1
            .registry()
            .contains(node1.journal(), SlotNumber(0), id)
            .expect("contains")
    );

    // Node 2 learned of the unlink through invalidation; its last release wipes.
    assert!(record2.is_stale());
    let report = release_and_delete(&node2, record2);
    assert!(report.is_deleted(), "outcome: {:?}", report.outcome);
    assert_fully_deleted(&node2, id, SlotNumber(0));
}

#[test]
fn deferred_object_is_deleted_by_a_later_attempt() {
    let cluster = Cluster::new();
    let fs = cluster.mount(1, 0);
    let record = fs.create(&NewObject::default()).expect("create");
    let id = record.id();

    // A node that never mounted holds the object open.
    let open = LockResource::new(id, LockKind::Open);
    let grant = cluster
        .dlm
        .lock(NodeId(9), open, LockMode::Shared, LockWait::Blocking)
        .expect("remote open");
    assert!(grant.is_granted());

    fs.unlink(&record).expect("unlink");
    let report = release_and_delete(&fs, record);
    assert!(matches!(
        report.outcome,
        DeleteOutcome::Deferred(DeferReason::OpenElsewhere)
    ));
    assert!(cluster.dlm.holders(open).iter().all(|(node, _)| *node == NodeId(9)));

    cluster
        .dlm
        .unlock(NodeId(9), open, LockMode::Shared)
        .expect("remote close");

    let again = fs.acquire(id, OpenFlags::empty()).expect("reopen orphan");
    assert_eq!(again.disk().link_count, 0);
    let report = release_and_delete(&fs, again);
    assert!(report.is_deleted(), "outcome: {:?}", report.outcome);
    assert_fully_deleted(&fs, id, SlotNumber(0));
}

#[test]
fn racing_last_releases_wipe_exactly_once() {
    for _ in 0..16 {
        let cluster = Cluster::new();
        let node1 = cluster.mount(1, 0);
        let node2 = cluster.mount(2, 1);

        let record1 = node1.create(&NewObject::default()).expect("create");
        let id = record1.id();
        node1.extend(&record1, 5, 2048).expect("extend");
        let record2 = node2.acquire(id, OpenFlags::empty()).expect("open on node 2");
        node1.unlink(&record1).expect("unlink");

        let barrier = Barrier::new(2);
        let (first, second) = thread::scope(|scope| {
            let a = scope.spawn(|| {
                barrier.wait();
                release_and_delete(&node1, record1)
            });
            let b = scope.spawn(|| {
                barrier.wait();
                release_and_delete(&node2, record2)
            });
            (a.join().expect("node 1"), b.join().expect("node 2"))
        });

        let detached = [&first, &second]
            .iter()
            .filter(|report| report.visited(DeleteState::Detaching))
            .count();
        assert_eq!(detached, 1, "{:?} / {:?}", first.outcome, second.outcome);
        let (winner, loser) = if first.is_deleted() {
            (&first, &second)
        } else {
            (&second, &first)
        };
        assert!(winner.is_deleted());
        assert!(matches!(
            loser.outcome,
            DeleteOutcome::Deferred(DeferReason::OpenElsewhere)
        ));
        assert!(!loser.visited(DeleteState::Wiping));
        assert_fully_deleted(&node1, id, SlotNumber(0));
        assert!(!node2.table().contains(id));
    }
}

#[test]
fn local_image_runs_the_whole_lifecycle() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("local.img");
    let options = FormatOptions {
        block_size: 1024,
        block_count: 512,
        slot_count: 2,
        total_clusters: 256,
        ..FormatOptions::default()
    };
    mkfs(&path, &options).expect("mkfs");

    let fs = NodeFs::open_image(
        &path,
        MountOptions {
            slot: SlotNumber(1),
            ..MountOptions::default()
        },
    )
    .expect("open image");
    let record = fs.create(&NewObject::default()).expect("create");
    let id = record.id();
    fs.extend(&record, 100, 100 * 1024).expect("extend");
    fs.unlink(&record).expect("unlink");
    let report = release_and_delete(&fs, record);
    assert!(report.is_deleted());
    drop(fs);

    // Everything reached the file.
    let fs = NodeFs::open_image(&path, MountOptions::default()).expect("reopen");
    let inspection = fs.inspect(id).expect("inspect");
    assert!(!inspection.is_valid());
    assert_ne!(inspection.record.deletion_time, 0);
    let alloc = fs.allocator_snapshot().expect("allocator");
    assert!(!is_allocated(&alloc, id).expect("bit"));
    assert_eq!(alloc.free_clusters, 256);
    assert!(fs.scan_orphans(SlotNumber(1)).expect("scan").is_empty());
}

#[test]
fn node_fs_handles_are_shareable_across_threads() {
    fn assert_send_sync<T: Send + Sync>() {}
    assert_send_sync::<NodeFs>();
    assert_send_sync::<Arc<cfs_inode::ObjectRecord>>();
}

#[test]
fn skip_delete_marker_retires_without_wiping() {
    let cluster = Cluster::new();
    let fs = cluster.mount(1, 0);
    let record = fs.create(&NewObject::default()).expect("create");
    let id = record.id();
    fs.extend(&record, 2, 900).expect("extend");
    fs.unlink(&record).expect("unlink");
    record.set_flags(LocalFlags::SKIP_DELETE);

    let report = release_and_delete(&fs, record);
    assert!(matches!(
        report.outcome,
        DeleteOutcome::Retired(RetireReason::SkipDelete)
    ));
    assert!(!report.visited(DeleteState::AttemptExclusiveOpen));
    assert!(!fs.table().contains(id));
    let inspection = fs.inspect(id).expect("inspect");
    assert!(inspection.is_valid());
    assert!(inspection.record.is_orphaned());
    assert_eq!(inspection.record.cluster_count, 2);
    assert_eq!(fs.scan_orphans(SlotNumber(0)).expect("scan").len(), 1);

    // The marker is local to that record; a fresh load deletes.
    let again = fs.acquire(id, OpenFlags::empty()).expect("reopen");
    let report = release_and_delete(&fs, again);
    assert!(report.is_deleted(), "outcome: {:?}", report.outcome);
    assert_fully_deleted(&fs, id, SlotNumber(0));
}

#[test]
fn skip_orphan_dir_detaches_without_an_orphan_entry() {
    let cluster = Cluster::new();
    let fs = cluster.mount(1, 0);
    let record = fs.create(&NewObject::default()).expect("create");
    let id = record.id();

    // Unlinked without ever entering the orphan directory.
    let mut disk = fs.inspect(id).expect("inspect").record;
    disk.link_count = 0;
    assert_eq!(disk.flags & RECORD_ORPHANED_FL, 0);
    cluster.write_record(&disk);
    record.set_flags(LocalFlags::SKIP_ORPHAN_DIR);
    record.set_flags(LocalFlags::MAYBE_ORPHANED);

    let dir_block = fs.registry().dir_block(SlotNumber(0)).expect("dir block");
    let dir_before = cluster.device.read_block(dir_block).expect("read dir");

    let report = release_and_delete(&fs, record);
    assert!(report.is_deleted(), "outcome: {:?}", report.outcome);
    assert!(report.visited(DeleteState::Detaching));
    let dir_after = cluster.device.read_block(dir_block).expect("read dir");
    assert_eq!(dir_before.as_slice(), dir_after.as_slice());
    assert_fully_deleted(&fs, id, SlotNumber(0));
}

#[test]
fn indexed_directory_releases_its_index_while_wiping() {
    let cluster = Cluster::new();
    let fs = cluster.mount(1, 0);
    let dir = fs.create(&NewObject::with_mode(S_IFDIR | 0o755)).expect("mkdir");
    let id = dir.id();
    fs.set_dynamic_flags(&dir, DYN_INDEXED_DIR_FL).expect("index");
    fs.unlink(&dir).expect("rmdir");

    let before = fs.journal().committed();
    let report = release_and_delete(&fs, dir);
    assert!(report.is_deleted(), "outcome: {:?}", report.outcome);
    assert!(report.visited(DeleteState::Wiping));
    // Index release, then the detach.
    assert_eq!(fs.journal().committed() - before, 2);
    let inspection = fs.inspect(id).expect("inspect");
    assert_eq!(inspection.record.dynamic_flags & DYN_INDEXED_DIR_FL, 0);
    assert_fully_deleted(&fs, id, SlotNumber(0));
}

#[test]
fn unmount_gives_back_open_locks_of_cached_objects() {
    let cluster = Cluster::new();
    let node1 = cluster.mount(1, 0);
    let node2 = cluster.mount(2, 1);

    let record = node1.create(&NewObject::default()).expect("create");
    let id = record.id();
    assert!(node1.release(record).expect("release").is_none());
    assert!(node1.table().contains(id));

    let open = LockResource::new(id, LockKind::Open);
    drop(node1);
    assert!(cluster.dlm.holders(open).is_empty());

    let record = node2.acquire(id, OpenFlags::empty()).expect("open on node 2");
    node2.unlink(&record).expect("unlink");
    let report = release_and_delete(&node2, record);
    assert!(report.is_deleted(), "outcome: {:?}", report.outcome);
    assert_fully_deleted(&node2, id, SlotNumber(1));
}

#[test]
fn unmount_drops_locks_of_records_still_referenced() {
    let cluster = Cluster::new();
    let node1 = cluster.mount(1, 0);
    let node2 = cluster.mount(2, 1);

    let held = node1.create(&NewObject::default()).expect("create");
    let id = held.id();
    assert!(node1.unmount().is_empty());
    assert!(!node1.table().contains(id));
    let open = LockResource::new(id, LockKind::Open);
    assert!(cluster.dlm.holders(open).is_empty());

    let record = node2.acquire(id, OpenFlags::empty()).expect("open on node 2");
    node2.unlink(&record).expect("unlink");
    let report = release_and_delete(&node2, record);
    assert!(report.is_deleted(), "outcome: {:?}", report.outcome);
    assert!(node1.release(held).is_err(), "the handle died with the cache");
}

#[test]
fn unmount_wipes_idle_objects_that_lost_their_last_link() {
    let cluster = Cluster::new();
    let fs = cluster.mount(1, 0);
    let record = fs.create(&NewObject::default()).expect("create");
    let id = record.id();
    let idle = Arc::clone(&record);
    assert!(fs.release(record).expect("release").is_none());

    // Orphaned on disk behind the cached copy, as a remote unlink would leave it.
    let mut disk = fs.inspect(id).expect("inspect").record;
    let mut tx = fs.journal().begin(credits::ORPHAN_ADD).expect("begin");
    fs.registry()
        .add(&mut tx, SlotNumber(0), id, disk.generation)
        .expect("orphan entry");
    tx.commit().expect("commit");
    disk.link_count = 0;
    disk.flags |= RECORD_ORPHANED_FL;
    disk.orphaned_slot = SlotNumber(0);
    cluster.write_record(&disk);
    idle.set_flags(LocalFlags::MAYBE_ORPHANED);
    drop(idle);

    let reports = fs.unmount();
    assert_eq!(reports.len(), 1);
    assert!(reports[0].is_deleted(), "outcome: {:?}", reports[0].outcome);
    assert_eq!(reports[0].object, id);
    assert_fully_deleted(&fs, id, SlotNumber(0));
}
