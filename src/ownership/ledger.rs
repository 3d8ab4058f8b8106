//! Borrower-side bookkeeping.
//!
//! A worker that holds handles to objects it does not own keeps one entry per object with
//! the number of live local handles. Only the 0 -> 1 and 1 -> 0 transitions are reported to
//! the owner, each with the next sequence number for that owner. Reports are handed to a
//! sink while the object's entry is still locked, so reports about one object leave this
//! worker in sequence order.

use super::protocol::BorrowerReport;
use super::types::{ObjectId, ObjectRef};
use crate::error::ObjectError;
use crate::membership::types::WorkerId;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

#[derive(Debug, Clone, Copy)]
struct Borrowed {
    object: ObjectRef,
    handles: u64,
}

pub struct BorrowLedger {
    worker: WorkerId,
    borrowed: DashMap<ObjectId, Borrowed>,
    sequences: DashMap<WorkerId, u64>,
    /// Owners known to be dead. Handles to their objects may outlive the entries.
    dead_owners: DashMap<WorkerId, ()>,
}

impl BorrowLedger {
    pub fn new(worker: WorkerId) -> Self {
        Self {
            worker,
            borrowed: DashMap::new(),
            sequences: DashMap::new(),
            dead_owners: DashMap::new(),
        }
    }

    fn next_seq(&self, owner: WorkerId) -> u64 {
        let mut seq = self.sequences.entry(owner).or_insert(0);
        *seq += 1;
        *seq
    }

    fn report(&self, object: &ObjectRef, delta: i64, discovered: Vec<ObjectRef>) -> BorrowerReport {
        BorrowerReport {
            object: object.id,
            borrower: self.worker,
            seq: self.next_seq(object.owner),
            delta,
            discovered,
        }
    }

    /// Adds a local handle. Returns the sink's result when this was the first handle.
    pub fn acquire<R>(
        &self,
        object: &ObjectRef,
        sink: impl FnOnce(BorrowerReport) -> R,
    ) -> Option<R> {
        let mut entry = self.borrowed.entry(object.id).or_insert(Borrowed {
            object: *object,
            handles: 0,
        });
        entry.handles += 1;

        if entry.handles == 1 {
            Some(sink(self.report(object, 1, Vec::new())))
        } else {
            None
        }
    }

    /// Drops a local handle. Returns the sink's result when this was the last one.
    pub fn release<R>(
        &self,
        object: &ObjectRef,
        sink: impl FnOnce(BorrowerReport) -> R,
    ) -> Result<Option<R>, ObjectError> {
        let Entry::Occupied(mut entry) = self.borrowed.entry(object.id) else {
            if self.dead_owners.contains_key(&object.owner) {
                return Ok(None);
            }
            return Err(ObjectError::InvalidRelease {
                object: object.id,
                worker: self.worker,
            });
        };

        entry.get_mut().handles -= 1;
        if entry.get().handles > 0 {
            return Ok(None);
        }

        let result = sink(self.report(object, -1, Vec::new()));
        entry.remove();
        Ok(Some(result))
    }

    /// Reports refs found inside `container` without changing any count.
    pub fn discovered<R>(
        &self,
        container: &ObjectRef,
        discovered: Vec<ObjectRef>,
        sink: impl FnOnce(BorrowerReport) -> R,
    ) -> R {
        // Hold the container's shard so the report cannot overtake a concurrent
        // acquire or release of the same object.
        match self.borrowed.entry(container.id) {
            Entry::Occupied(guard) => {
                let result = sink(self.report(container, 0, discovered));
                drop(guard);
                result
            }
            Entry::Vacant(guard) => {
                let result = sink(self.report(container, 0, discovered));
                drop(guard);
                result
            }
        }
    }

    pub fn local_count(&self, id: &ObjectId) -> u64 {
        self.borrowed.get(id).map(|entry| entry.handles).unwrap_or(0)
    }

    pub fn borrowed_count(&self) -> usize {
        self.borrowed.len()
    }

    /// The owner died: nothing left to report to. Returns how many entries were dropped.
    pub fn forget_owner(&self, owner: WorkerId) -> usize {
        let before = self.borrowed.len();
        self.borrowed.retain(|_, entry| entry.object.owner != owner);
        self.sequences.remove(&owner);
        self.dead_owners.insert(owner, ());
        before - self.borrowed.len()
    }

    pub fn clear(&self) {
        self.borrowed.clear();
    }
}
