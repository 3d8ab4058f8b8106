//! Reference-Count Protocol Definitions
//!
//! Messages exchanged between borrowers and owners. They travel bincode-encoded through
//! the owner's inbox channel, so delivery order is FIFO per inbox. Borrower reports carry
//! a sequence number that is monotonic per (borrower, owner) pair; owners drop anything
//! at or below the last sequence they applied for that borrower on that object.

use crate::error::ObjectError;
use crate::executor::types::TaskId;
use crate::membership::types::WorkerId;

use super::types::{ObjectId, ObjectRef};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

/// A borrower telling the owner how its local handles changed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BorrowerReport {
    pub object: ObjectId,
    pub borrower: WorkerId,
    pub seq: u64,
    /// +1 when the first local handle appears, -1 when the last one goes, 0 for a pure
    /// discovery report.
    pub delta: i64,
    /// Refs found embedded in the object's payload when the borrower deserialized it.
    pub discovered: Vec<ObjectRef>,
}

/// A pin change addressed to the owner of `object`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PinChange {
    AddTask { task: TaskId, submitter: WorkerId },
    RemoveTask { task: TaskId },
    AddContained { container: ObjectId, container_owner: WorkerId },
    RemoveContained { container: ObjectId },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ProtocolMessage {
    Report(BorrowerReport),
    Pin { object: ObjectId, change: PinChange },
    /// Acknowledged once everything sent before it on the same inbox was applied.
    Flush,
}

/// Unit of delivery on an owner's inbox.
#[derive(Debug)]
pub struct Envelope {
    pub from: WorkerId,
    pub bytes: Vec<u8>,
    pub ack: Option<oneshot::Sender<()>>,
}

pub fn encode(message: &ProtocolMessage) -> Result<Vec<u8>, ObjectError> {
    Ok(bincode::serialize(message)?)
}

pub fn decode(bytes: &[u8]) -> Result<ProtocolMessage, ObjectError> {
    Ok(bincode::deserialize(bytes)?)
}
