//! Identity-keyed, reference-counted record table.
//!
//! Lock order: the table mutex may be taken before a record's state mutex,
//! never after. No cluster lock call happens while the table mutex is held.

use crate::ObjectRecord;
use cfs_error::{CfsError, Result};
use cfs_types::ObjectId;
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tracing::trace;

enum Slot {
    /// Someone is reading the record from disk; others wait for the result.
    Loading,
    Live {
        record: Arc<ObjectRecord>,
        refs: u32,
    },
    /// Being torn down (deleted or evicted); a new load waits until it is gone.
    Freeing,
}

#[derive(Default)]
struct Inner {
    slots: HashMap<ObjectId, Slot>,
    /// Unreferenced live records, oldest first.
    lru: VecDeque<ObjectId>,
}

impl Inner {
    fn unlink_lru(&mut self, id: ObjectId) {
        if let Some(pos) = self.lru.iter().position(|&cached| cached == id) {
            self.lru.remove(pos);
        }
    }

    /// Turn an unreferenced live slot into Freeing and hand back its record.
    fn start_free(&mut self, id: ObjectId) -> Option<Arc<ObjectRecord>> {
        match self.slots.get(&id) {
            Some(Slot::Live { refs: 0, .. }) => {}
            _ => return None,
        }
        self.unlink_lru(id);
        match self.slots.insert(id, Slot::Freeing) {
            Some(Slot::Live { record, .. }) => Some(record),
            _ => None,
        }
    }
}

/// Outcome of [`ObjectTable::acquire`].
pub enum Acquire<'t> {
    /// A live record was found and a reference taken.
    Hit(Arc<ObjectRecord>),
    /// The caller must load the record and hand it to the ticket.
    Miss(LoadTicket<'t>),
}

/// Exclusive right to load one identity. Dropping it without
/// [`complete`](Self::complete) abandons the load and wakes waiters.
pub struct LoadTicket<'t> {
    table: &'t ObjectTable,
    id: ObjectId,
    done: bool,
}

impl LoadTicket<'_> {
    #[must_use]
    pub fn id(&self) -> ObjectId {
        self.id
    }

    /// Publish the loaded record with one reference held by the caller.
    pub fn complete(mut self, record: Arc<ObjectRecord>) -> Arc<ObjectRecord> {
        self.done = true;
        let mut inner = self.table.inner.lock();
        inner.slots.insert(
            self.id,
            Slot::Live {
                record: Arc::clone(&record),
                refs: 1,
            },
        );
        drop(inner);
        self.table.changed.notify_all();
        record
    }
}

impl Drop for LoadTicket<'_> {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        let mut inner = self.table.inner.lock();
        if matches!(inner.slots.get(&self.id), Some(Slot::Loading)) {
            inner.slots.remove(&self.id);
        }
        drop(inner);
        self.table.changed.notify_all();
        trace!(target: "cfs::cache", event = "load_abandoned", object = self.id.0);
    }
}

/// Outcome of dropping a reference.
pub enum Release {
    /// Other local users still hold the record.
    Referenced,
    /// Kept cached for reuse. `evicted` records were pushed out of the cache
    /// and are now Freeing; the caller must tear them down.
    Cached { evicted: Vec<Arc<ObjectRecord>> },
    /// Last reference and the caller asked to drop it; the slot is Freeing.
    Dropping(Arc<ObjectRecord>),
}

pub struct ObjectTable {
    inner: Mutex<Inner>,
    changed: Condvar,
    capacity: usize,
}

impl std::fmt::Debug for ObjectTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("ObjectTable")
            .field("slots", &inner.slots.len())
            .field("unreferenced", &inner.lru.len())
            .field("capacity", &self.capacity)
            .finish()
    }
}

impl ObjectTable {
    /// `capacity` bounds the number of unreferenced records kept cached.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            changed: Condvar::new(),
            capacity,
        }
    }

    /// Take a reference to `id`, or the right to load it.
    ///
    /// Waits while another thread is loading or freeing the same identity.
    pub fn acquire(&self, id: ObjectId) -> Acquire<'_> {
        let mut inner = self.inner.lock();
        loop {
            match inner.slots.get_mut(&id) {
                Some(Slot::Live { record, refs }) => {
                    *refs += 1;
                    let record = Arc::clone(record);
                    if *refs == 1 {
                        inner.unlink_lru(id);
                    }
                    trace!(target: "cfs::cache", event = "cache_hit", object = id.0);
                    return Acquire::Hit(record);
                }
                Some(Slot::Loading | Slot::Freeing) => {
                    self.changed.wait(&mut inner);
                }
                None => {
                    inner.slots.insert(id, Slot::Loading);
                    trace!(target: "cfs::cache", event = "cache_miss", object = id.0);
                    return Acquire::Miss(LoadTicket {
                        table: self,
                        id,
                        done: false,
                    });
                }
            }
        }
    }

    /// Reference a live record without ever loading or waiting.
    #[must_use]
    pub fn lookup(&self, id: ObjectId) -> Option<Arc<ObjectRecord>> {
        let mut inner = self.inner.lock();
        let Some(Slot::Live { record, refs }) = inner.slots.get_mut(&id) else {
            return None;
        };
        *refs += 1;
        let record = Arc::clone(record);
        if *refs == 1 {
            inner.unlink_lru(id);
        }
        Some(record)
    }

    /// The live record for `id` without taking a reference.
    #[must_use]
    pub fn peek(&self, id: ObjectId) -> Option<Arc<ObjectRecord>> {
        match self.inner.lock().slots.get(&id) {
            Some(Slot::Live { record, .. }) => Some(Arc::clone(record)),
            _ => None,
        }
    }

    /// Drop one reference. At zero, `should_drop` decides (under the table
    /// lock) between tearing the record down and keeping it cached.
    pub fn release(
        &self,
        record: &ObjectRecord,
        should_drop: impl FnOnce(&ObjectRecord) -> bool,
    ) -> Result<Release> {
        let id = record.id();
        let mut inner = self.inner.lock();
        let Some(Slot::Live { refs, .. }) = inner.slots.get_mut(&id) else {
            return Err(CfsError::InvalidArgument(format!(
                "release of object {id} that is not live in the cache"
            )));
        };
        if *refs == 0 {
            return Err(CfsError::InvalidArgument(format!(
                "release of unreferenced object {id}"
            )));
        }
        *refs -= 1;
        if *refs > 0 {
            return Ok(Release::Referenced);
        }

        if should_drop(record) {
            let dropped = inner.start_free(id).ok_or_else(|| {
                CfsError::InvalidArgument(format!("object {id} vanished during release"))
            })?;
            return Ok(Release::Dropping(dropped));
        }

        inner.lru.push_back(id);
        let mut evicted = Vec::new();
        while inner.lru.len() > self.capacity {
            let Some(oldest) = inner.lru.front().copied() else {
                break;
            };
            match inner.start_free(oldest) {
                Some(victim) => evicted.push(victim),
                None => {
                    inner.lru.pop_front();
                }
            }
        }
        Ok(Release::Cached { evicted })
    }

    /// Pull an unreferenced cached record out for teardown.
    #[must_use]
    pub fn take_unreferenced(&self, id: ObjectId) -> Option<Arc<ObjectRecord>> {
        self.inner.lock().start_free(id)
    }

    /// Pull out every unreferenced record beyond the newest `keep`.
    #[must_use]
    pub fn shrink(&self, keep: usize) -> Vec<Arc<ObjectRecord>> {
        let mut inner = self.inner.lock();
        let mut out = Vec::new();
        while inner.lru.len() > keep {
            let Some(oldest) = inner.lru.front().copied() else {
                break;
            };
            match inner.start_free(oldest) {
                Some(victim) => out.push(victim),
                None => {
                    inner.lru.pop_front();
                }
            }
        }
        out
    }

    /// Pull out every live record, referenced or not, with the references
    /// still held on it. Each comes back Freeing.
    #[must_use]
    pub fn drain(&self) -> Vec<(Arc<ObjectRecord>, u32)> {
        let mut inner = self.inner.lock();
        inner.lru.clear();
        let mut out = Vec::new();
        for slot in inner.slots.values_mut() {
            if !matches!(slot, Slot::Live { .. }) {
                continue;
            }
            if let Slot::Live { record, refs } = std::mem::replace(slot, Slot::Freeing) {
                out.push((record, refs));
            }
        }
        out.sort_unstable_by_key(|(record, _)| record.id());
        out
    }

    /// Finish tearing down a Freeing record; waiting acquirers reload it.
    pub fn finish_free(&self, id: ObjectId) {
        let mut inner = self.inner.lock();
        if matches!(inner.slots.get(&id), Some(Slot::Freeing)) {
            inner.slots.remove(&id);
        }
        drop(inner);
        self.changed.notify_all();
        trace!(target: "cfs::cache", event = "record_freed", object = id.0);
    }

    /// References currently held on a live record.
    #[must_use]
    pub fn refs(&self, id: ObjectId) -> Option<u32> {
        match self.inner.lock().slots.get(&id) {
            Some(Slot::Live { refs, .. }) => Some(*refs),
            _ => None,
        }
    }

    #[must_use]
    pub fn contains(&self, id: ObjectId) -> bool {
        self.inner.lock().slots.contains_key(&id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().slots.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Identities of every live record.
    #[must_use]
    pub fn live_ids(&self) -> Vec<ObjectId> {
        let inner = self.inner.lock();
        let mut ids: Vec<ObjectId> = inner
            .slots
            .iter()
            .filter(|(_, slot)| matches!(slot, Slot::Live { .. }))
            .map(|(id, _)| *id)
            .collect();
        ids.sort_unstable();
        ids
    }
}
