//! Ownership Table
//!
//! The authoritative reference counts for every object a worker created. Each record lives
//! in a sharded `DashMap`, so all mutations of one object are linearized by its entry lock
//! while unrelated objects proceed in parallel.
//!
//! The table never talks to other workers. Operations return `Followups`: pin changes that
//! must be delivered to other owners (or applied back to this table) and objects whose
//! count reached zero and must be evicted. The `ReferenceCounter` performs them outside
//! of any lock.

use super::protocol::{BorrowerReport, PinChange};
use super::types::{
    ObjectId, ObjectRef, ObjectState, ObjectStatus, OwnershipRecord, RecordSnapshot, TaskPin,
};
use crate::error::{LostReason, ObjectError};
use crate::executor::types::TaskId;
use crate::membership::types::{NodeId, WorkerId};

use dashmap::DashMap;
use std::collections::hash_map::Entry;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::watch;

/// A pin change addressed to the owner of `target`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PinRequest {
    pub target: ObjectRef,
    pub change: PinChange,
}

/// An object whose count reached zero. Its record is already gone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleasedObject {
    pub object: ObjectRef,
    pub location: Option<NodeId>,
    pub lineage: Option<TaskId>,
}

#[derive(Debug, Default)]
pub struct Followups {
    pub pins: Vec<PinRequest>,
    pub released: Vec<ReleasedObject>,
}

impl Followups {
    pub fn is_empty(&self) -> bool {
        self.pins.is_empty() && self.released.is_empty()
    }

    pub fn extend(&mut self, other: Followups) {
        self.pins.extend(other.pins);
        self.released.extend(other.released);
    }
}

pub struct OwnershipTable {
    owner: WorkerId,
    records: DashMap<ObjectId, OwnershipRecord>,
    /// Workers already dropped by `drop_worker`. Nothing they sent is counted any more.
    departed: DashMap<WorkerId, ()>,
    dead: AtomicBool,
}

impl OwnershipTable {
    pub fn new(owner: WorkerId) -> Self {
        Self {
            owner,
            records: DashMap::new(),
            departed: DashMap::new(),
            dead: AtomicBool::new(false),
        }
    }

    pub fn owner(&self) -> WorkerId {
        self.owner
    }

    pub fn is_dead(&self) -> bool {
        self.dead.load(Ordering::SeqCst)
    }

    pub fn has_departed(&self, worker: &WorkerId) -> bool {
        self.departed.contains_key(worker)
    }

    /// Registers a new owned object with one local reference (the caller's handle).
    ///
    /// Every distinct ref embedded in its payload gets a container pin at its own owner.
    pub fn create(
        &self,
        status: ObjectStatus,
        nested: Vec<ObjectRef>,
        lineage: Option<TaskId>,
    ) -> Result<(ObjectRef, Followups), ObjectError> {
        if self.is_dead() {
            return Err(ObjectError::owner_died(self.owner));
        }

        let object = ObjectRef {
            id: ObjectId::new(),
            owner: self.owner,
        };
        let mut record = OwnershipRecord::new(object, status, lineage);
        let mut followups = Followups::default();

        for inner in nested {
            if record.nested.contains(&inner) {
                continue;
            }
            record.nested.push(inner);
            followups.pins.push(PinRequest {
                target: inner,
                change: PinChange::AddContained {
                    container: object.id,
                    container_owner: self.owner,
                },
            });
        }

        self.records.insert(object.id, record);
        tracing::trace!("Created object {}", object);

        Ok((object, followups))
    }

    pub fn add_local_ref(&self, id: &ObjectId) -> Result<(), ObjectError> {
        match self.records.get_mut(id) {
            Some(mut record) => {
                record.local_refs += 1;
                Ok(())
            }
            None => Err(ObjectError::Lost {
                object: *id,
                reason: LostReason::Evicted,
            }),
        }
    }

    /// Drops one local reference. Releasing a reference that was never taken is a
    /// bookkeeping bug and fails immediately.
    pub fn remove_local_ref(&self, id: &ObjectId) -> Result<Followups, ObjectError> {
        if self.is_dead() {
            return Ok(Followups::default());
        }

        {
            let mut record = self.records.get_mut(id).ok_or(ObjectError::InvalidRelease {
                object: *id,
                worker: self.owner,
            })?;
            if record.local_refs == 0 {
                return Err(ObjectError::InvalidRelease {
                    object: *id,
                    worker: self.owner,
                });
            }
            record.local_refs -= 1;
        }

        Ok(self.release_if_unreferenced(id))
    }

    /// Pins `id` for `task` and forwards the pin to every nested ref already known.
    ///
    /// A pin on behalf of a departed submitter is refused: nobody would release it.
    pub fn add_task_pin(
        &self,
        id: &ObjectId,
        task: TaskId,
        submitter: WorkerId,
    ) -> Result<Followups, ObjectError> {
        if self.is_dead() {
            return Err(ObjectError::owner_died(self.owner));
        }

        let mut record = self.records.get_mut(id).ok_or(ObjectError::Lost {
            object: *id,
            reason: LostReason::Evicted,
        })?;
        // Checked under the entry lock so `drop_worker` cannot slip in between
        if self.has_departed(&submitter) {
            return Err(ObjectError::Worker {
                worker: submitter,
                task: Some(task),
                detail: "submitter of the task died".to_string(),
            });
        }
        let nested = record.nested.clone();
        let mut followups = Followups::default();

        match record.task_pins.entry(task) {
            Entry::Occupied(mut pin) => {
                pin.get_mut().count += 1;
            }
            Entry::Vacant(slot) => {
                followups.pins = nested
                    .iter()
                    .map(|inner| PinRequest {
                        target: *inner,
                        change: PinChange::AddTask { task, submitter },
                    })
                    .collect();
                slot.insert(TaskPin {
                    count: 1,
                    submitter,
                    forwarded: nested,
                });
            }
        }

        Ok(followups)
    }

    pub fn remove_task_pin(&self, id: &ObjectId, task: TaskId) -> Result<Followups, ObjectError> {
        if self.is_dead() {
            return Ok(Followups::default());
        }

        let mut followups = Followups::default();
        {
            let invalid = ObjectError::InvalidRelease {
                object: *id,
                worker: self.owner,
            };
            let mut record = self.records.get_mut(id).ok_or(invalid.clone())?;
            let pin = record.task_pins.get_mut(&task).ok_or(invalid)?;
            pin.count -= 1;

            if pin.count == 0
                && let Some(pin) = record.task_pins.remove(&task)
            {
                followups.pins = pin
                    .forwarded
                    .into_iter()
                    .map(|inner| PinRequest {
                        target: inner,
                        change: PinChange::RemoveTask { task },
                    })
                    .collect();
            }
        }

        followups.extend(self.release_if_unreferenced(id));
        Ok(followups)
    }

    /// Merges a borrower report. Reports at or below the last applied sequence number for
    /// that borrower are duplicates or stale and are dropped.
    pub fn apply_report(&self, report: BorrowerReport) -> Result<Followups, ObjectError> {
        if self.is_dead() {
            return Ok(Followups::default());
        }

        let mut followups;
        {
            let Some(mut record) = self.records.get_mut(&report.object) else {
                tracing::debug!(
                    "Report from {} for unknown object {} ignored",
                    report.borrower,
                    report.object
                );
                return Ok(Followups::default());
            };
            if self.has_departed(&report.borrower) {
                tracing::debug!(
                    "Report from departed borrower {} for {} ignored",
                    report.borrower,
                    report.object
                );
                return Ok(Followups::default());
            }

            let edge = record.borrowers.entry(report.borrower).or_default();
            if report.seq <= edge.last_seq {
                tracing::trace!(
                    "Dropping stale report seq={} (last={}) from {}",
                    report.seq,
                    edge.last_seq,
                    report.borrower
                );
                return Ok(Followups::default());
            }
            edge.last_seq = report.seq;

            let updated = edge.count + report.delta;
            if updated < 0 {
                edge.count = 0;
                return Err(ObjectError::InvalidRelease {
                    object: report.object,
                    worker: report.borrower,
                });
            }
            edge.count = updated;

            followups = merge_nested(&mut record, report.discovered, self.owner);
        }

        followups.extend(self.release_if_unreferenced(&report.object));
        Ok(followups)
    }

    /// Records refs embedded in an owned object's payload, e.g. a task return.
    pub fn record_nested(
        &self,
        id: &ObjectId,
        nested: Vec<ObjectRef>,
    ) -> Result<Followups, ObjectError> {
        let mut record = self.records.get_mut(id).ok_or(ObjectError::Lost {
            object: *id,
            reason: LostReason::Evicted,
        })?;
        Ok(merge_nested(&mut record, nested, self.owner))
    }

    pub fn add_contained(
        &self,
        id: &ObjectId,
        container: ObjectId,
        container_owner: WorkerId,
    ) -> Result<(), ObjectError> {
        if self.is_dead() {
            return Err(ObjectError::owner_died(self.owner));
        }

        let mut record = self.records.get_mut(id).ok_or(ObjectError::Lost {
            object: *id,
            reason: LostReason::Evicted,
        })?;
        if self.has_departed(&container_owner) {
            return Err(ObjectError::Worker {
                worker: container_owner,
                task: None,
                detail: "owner of the container died".to_string(),
            });
        }
        record.contained_in.insert(container, container_owner);
        Ok(())
    }

    /// Idempotent: the pin may already be gone if the container's owner died.
    pub fn remove_contained(&self, id: &ObjectId, container: &ObjectId) -> Followups {
        let removed = self
            .records
            .get_mut(id)
            .map(|mut record| record.contained_in.remove(container).is_some())
            .unwrap_or(false);

        if removed {
            self.release_if_unreferenced(id)
        } else {
            Followups::default()
        }
    }

    pub fn apply_pin(&self, id: &ObjectId, change: PinChange) -> Result<Followups, ObjectError> {
        match change {
            PinChange::AddTask { task, submitter } => self.add_task_pin(id, task, submitter),
            PinChange::RemoveTask { task } => self.remove_task_pin(id, task),
            PinChange::AddContained {
                container,
                container_owner,
            } => self
                .add_contained(id, container, container_owner)
                .map(|_| Followups::default()),
            PinChange::RemoveContained { container } => Ok(self.remove_contained(id, &container)),
        }
    }

    /// Publishes a new status. Returns `false` if the object no longer exists.
    pub fn set_status(&self, id: &ObjectId, status: ObjectStatus) -> bool {
        match self.records.get(id) {
            Some(record) => {
                record.status.send_replace(status);
                true
            }
            None => false,
        }
    }

    /// Flips a `Ready` object back to `Pending` ahead of reconstruction.
    ///
    /// `Some(true)` if this call flipped it, `Some(false)` if it was not `Ready` (someone
    /// else is already rebuilding it, or it failed), `None` if it does not exist.
    pub fn restart(&self, id: &ObjectId) -> Option<bool> {
        self.records.get(id).map(|record| {
            record.status.send_if_modified(|status| {
                if matches!(status, ObjectStatus::Ready { .. }) {
                    *status = ObjectStatus::Pending;
                    true
                } else {
                    false
                }
            })
        })
    }

    pub fn subscribe(&self, id: &ObjectId) -> Option<watch::Receiver<ObjectStatus>> {
        self.records.get(id).map(|record| record.status.subscribe())
    }

    pub fn status(&self, id: &ObjectId) -> Option<ObjectStatus> {
        self.records.get(id).map(|record| record.status.borrow().clone())
    }

    pub fn lineage_of(&self, id: &ObjectId) -> Option<TaskId> {
        self.records.get(id).and_then(|record| record.lineage)
    }

    pub fn total_count(&self, id: &ObjectId) -> Option<u64> {
        self.records.get(id).map(|record| record.total())
    }

    pub fn snapshot(&self, id: &ObjectId) -> Option<RecordSnapshot> {
        self.records.get(id).map(|record| record.snapshot())
    }

    pub fn state(&self, id: &ObjectId) -> ObjectState {
        if self.is_dead() {
            return ObjectState::Lost;
        }
        match self.records.get(id) {
            Some(record) if record.total() > 0 => ObjectState::Active,
            Some(_) => ObjectState::PendingEviction,
            None => ObjectState::Evicted,
        }
    }

    pub fn contains(&self, id: &ObjectId) -> bool {
        self.records.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Forgets everything `dead` contributed: its borrower edges, container pins held by
    /// containers it owned, and pins of tasks it submitted.
    ///
    /// Forwarded task pins are not chased: every owner processes the same death itself.
    /// Later pins and reports from `dead` are refused.
    pub fn drop_worker(&self, dead: WorkerId) -> Followups {
        if self.departed.insert(dead, ()).is_some() {
            return Followups::default();
        }
        let mut affected = Vec::new();

        for mut entry in self.records.iter_mut() {
            let record = entry.value_mut();
            let mut changed = record.borrowers.remove(&dead).is_some();

            let containers = record.contained_in.len();
            record.contained_in.retain(|_, owner| *owner != dead);
            changed |= record.contained_in.len() != containers;

            let pins = record.task_pins.len();
            record.task_pins.retain(|_, pin| pin.submitter != dead);
            changed |= record.task_pins.len() != pins;

            if changed {
                affected.push(*entry.key());
            }
        }

        if !affected.is_empty() {
            tracing::info!(
                "Worker {} is dead: dropped its references to {} object(s) owned by {}",
                dead,
                affected.len(),
                self.owner
            );
        }

        let mut followups = Followups::default();
        for id in affected {
            followups.extend(self.release_if_unreferenced(&id));
        }
        followups
    }

    /// The owner itself died. Every record is discarded; waiters observe the closed status
    /// channel together with `is_dead() == true`.
    pub fn mark_dead(&self) -> usize {
        self.dead.store(true, Ordering::SeqCst);
        let count = self.records.len();
        self.records.clear();
        count
    }

    fn release_if_unreferenced(&self, id: &ObjectId) -> Followups {
        let mut followups = Followups::default();

        let Some((_, record)) = self.records.remove_if(id, |_, record| record.total() == 0) else {
            return followups;
        };

        let location = match &*record.status.borrow() {
            ObjectStatus::Ready { node, .. } => Some(*node),
            _ => None,
        };

        tracing::debug!(
            "Object {} has no references left (nested: {})",
            record.object,
            record.nested.len()
        );

        followups.pins = record
            .nested
            .iter()
            .map(|inner| PinRequest {
                target: *inner,
                change: PinChange::RemoveContained { container: *id },
            })
            .collect();
        followups.released.push(ReleasedObject {
            object: record.object,
            location,
            lineage: record.lineage,
        });

        followups
    }
}

/// Adds newly discovered nested refs: each gets a container pin, and every task currently
/// pinning the container extends its pin to it.
fn merge_nested(
    record: &mut OwnershipRecord,
    discovered: Vec<ObjectRef>,
    owner: WorkerId,
) -> Followups {
    let mut followups = Followups::default();
    let container = record.object.id;

    for inner in discovered {
        if record.nested.contains(&inner) {
            continue;
        }
        record.nested.push(inner);
        followups.pins.push(PinRequest {
            target: inner,
            change: PinChange::AddContained {
                container,
                container_owner: owner,
            },
        });

        for (task, pin) in record.task_pins.iter_mut() {
            pin.forwarded.push(inner);
            followups.pins.push(PinRequest {
                target: inner,
                change: PinChange::AddTask {
                    task: *task,
                    submitter: pin.submitter,
                },
            });
        }
    }

    followups
}
