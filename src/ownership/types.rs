use crate::error::ObjectError;
use crate::executor::types::TaskId;
use crate::membership::types::{NodeId, WorkerId};

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use tokio::sync::watch;
use uuid::Uuid;

/// Cluster-unique object identifier.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId(pub Uuid);

impl ObjectId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ObjectId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An object identifier plus the worker that owns its reference count.
/// The owner is fixed at creation and never reassigned.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ObjectRef {
    pub id: ObjectId,
    pub owner: WorkerId,
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.id, self.owner)
    }
}

/// Where the payload of an object stands, as seen by its owner.
#[derive(Debug, Clone, PartialEq)]
pub enum ObjectStatus {
    /// The producing task has not returned yet (or the payload is being reconstructed).
    Pending,
    Ready { node: NodeId, size: u64 },
    /// Terminal. Every `get` returns this error.
    Failed(ObjectError),
}

impl ObjectStatus {
    pub fn is_pending(&self) -> bool {
        matches!(self, ObjectStatus::Pending)
    }
}

/// Lifecycle state derived from an owner's table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectState {
    Active,
    /// Count reached zero and the record is being torn down.
    PendingEviction,
    Evicted,
    /// The owner is gone.
    Lost,
}

/// A borrower's edge on an owned object. The edge stays in the record after its count
/// drops to zero so that late duplicates of older reports are still recognized as stale.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BorrowerEdge {
    pub last_seq: u64,
    pub count: i64,
}

/// Pins a task holds on one object, and the nested refs the pin was forwarded to.
#[derive(Debug, Clone)]
pub struct TaskPin {
    pub count: u32,
    pub submitter: WorkerId,
    pub forwarded: Vec<ObjectRef>,
}

/// Authoritative bookkeeping for one object, held only by its owner.
#[derive(Debug)]
pub struct OwnershipRecord {
    pub object: ObjectRef,
    pub local_refs: u64,
    pub task_pins: HashMap<TaskId, TaskPin>,
    pub borrowers: HashMap<WorkerId, BorrowerEdge>,
    /// Containers whose payload embeds this object, with the container's owner.
    pub contained_in: HashMap<ObjectId, WorkerId>,
    /// Refs embedded in this object's own payload.
    pub nested: Vec<ObjectRef>,
    pub lineage: Option<TaskId>,
    pub status: watch::Sender<ObjectStatus>,
}

impl OwnershipRecord {
    pub fn new(object: ObjectRef, status: ObjectStatus, lineage: Option<TaskId>) -> Self {
        let (status, _) = watch::channel(status);
        Self {
            object,
            local_refs: 1,
            task_pins: HashMap::new(),
            borrowers: HashMap::new(),
            contained_in: HashMap::new(),
            nested: Vec::new(),
            lineage,
            status,
        }
    }

    pub fn task_pin_count(&self) -> u64 {
        self.task_pins.values().map(|pin| pin.count as u64).sum()
    }

    pub fn borrower_count(&self) -> u64 {
        self.borrowers
            .values()
            .map(|edge| edge.count.max(0) as u64)
            .sum()
    }

    /// local handles + task pins + borrower edges + container pins
    pub fn total(&self) -> u64 {
        self.local_refs
            + self.task_pin_count()
            + self.borrower_count()
            + self.contained_in.len() as u64
    }

    pub fn snapshot(&self) -> RecordSnapshot {
        RecordSnapshot {
            object: self.object,
            local_refs: self.local_refs,
            task_pins: self.task_pin_count(),
            borrowers: self.borrower_count(),
            contained_in: self.contained_in.len() as u64,
            nested: self.nested.clone(),
            total: self.total(),
            status: self.status.borrow().clone(),
            lineage: self.lineage,
        }
    }
}

/// Point-in-time copy of a record, for inspection and tests.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordSnapshot {
    pub object: ObjectRef,
    pub local_refs: u64,
    pub task_pins: u64,
    pub borrowers: u64,
    pub contained_in: u64,
    pub nested: Vec<ObjectRef>,
    pub total: u64,
    pub status: ObjectStatus,
    pub lineage: Option<TaskId>,
}
