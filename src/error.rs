//! Error kinds surfaced by `get`, `put` and task submission.
//!
//! Process and network failures always resolve to one of these variants. The binary and
//! the tests wrap them in `anyhow` at the edges.

use crate::executor::types::TaskId;
use crate::membership::types::{NodeId, WorkerId};
use crate::ownership::types::ObjectId;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Why an object can no longer be produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LostReason {
    /// The owner's count reached zero and the payload was freed.
    Evicted,
    /// The node holding the only copy failed.
    NodeFailed,
    /// The copy is gone and the object was `put`, so there is nothing to re-execute.
    NoLineage,
    /// The producing task already used its whole reconstruction budget.
    LineageExhausted,
    /// Re-executing the producing task did not bring the object back.
    ReconstructionFailed,
}

impl fmt::Display for LostReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            LostReason::Evicted => "evicted after its last reference was released",
            LostReason::NodeFailed => "the node holding it failed",
            LostReason::NoLineage => "cannot reconstruct: no lineage",
            LostReason::LineageExhausted => "cannot reconstruct: lineage budget exhausted",
            LostReason::ReconstructionFailed => "cannot reconstruct: re-execution failed",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ObjectError {
    /// The object may still exist; the caller can retry.
    #[error("timed out after {timeout:?} waiting for object {object}")]
    Timeout { object: ObjectId, timeout: Duration },

    #[error("object {object} is lost: {reason}")]
    Lost { object: ObjectId, reason: LostReason },

    /// The owning or executing process died.
    #[error("worker {worker} died: {detail}")]
    Worker {
        worker: WorkerId,
        task: Option<TaskId>,
        detail: String,
    },

    #[error(
        "object store on node {node} is full: {requested} bytes requested, {used}/{capacity} used after {attempts} eviction attempts"
    )]
    StoreFull {
        node: NodeId,
        requested: u64,
        used: u64,
        capacity: u64,
        attempts: u32,
    },

    /// The task handler itself returned an error. Never retried.
    #[error("task {task} failed: {message}")]
    Task { task: TaskId, message: String },

    #[error("worker {worker} released object {object} without holding a reference to it")]
    InvalidRelease { object: ObjectId, worker: WorkerId },

    #[error("payload codec error: {0}")]
    Codec(String),

    #[error("cluster has shut down")]
    Shutdown,
}

impl ObjectError {
    /// Only timeouts are worth retrying; every other kind is final for that call.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ObjectError::Timeout { .. })
    }

    pub fn owner_died(worker: WorkerId) -> Self {
        ObjectError::Worker {
            worker,
            task: None,
            detail: "owner of the object died".to_string(),
        }
    }
}

impl From<bincode::Error> for ObjectError {
    fn from(err: bincode::Error) -> Self {
        ObjectError::Codec(err.to_string())
    }
}
