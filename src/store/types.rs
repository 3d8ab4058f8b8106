use crate::membership::types::NodeId;
use crate::ownership::types::ObjectRef;

use serde::Serialize;
use std::sync::Arc;

/// A sealed, immutable object payload on one node.
#[derive(Debug, Clone)]
pub struct StoreEntry {
    pub object: ObjectRef,
    pub payload: Arc<[u8]>,
    pub size: u64,
}

impl StoreEntry {
    pub fn new(object: ObjectRef, payload: Vec<u8>) -> Self {
        let size = payload.len() as u64;
        Self {
            object,
            payload: payload.into(),
            size,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub node: NodeId,
    pub capacity_bytes: u64,
    pub used_bytes: u64,
    pub objects: usize,
    pub evictions: u64,
    pub failed: bool,
}
