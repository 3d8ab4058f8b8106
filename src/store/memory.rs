//! In-Memory Object Store
//!
//! Payloads sealed on one node, with atomic capacity accounting and eviction under
//! pressure. Whether a copy may go is asked of the owners through `ReferenceProbe`.

use super::types::{StoreEntry, StoreStats};
use crate::error::{LostReason, ObjectError};
use crate::eviction::policy::StoreRetryPolicy;
use crate::membership::types::{NodeId, WorkerId};
use crate::ownership::types::{ObjectId, ObjectRef};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

const TOMBSTONE_LIMIT: usize = 10_000;

/// Answers whether anyone still counts a reference to an object.
pub trait ReferenceProbe: Send + Sync {
    fn is_referenced(&self, object: &ObjectRef) -> bool;
}

/// Bounded in-memory store for one node.
pub struct ObjectStore {
    node: NodeId,
    capacity_bytes: u64,
    used_bytes: AtomicU64,
    entries: DashMap<ObjectId, StoreEntry>,
    /// Why an object that used to be here is gone.
    tombstones: DashMap<ObjectId, LostReason>,
    evictions: AtomicU64,
    failed: AtomicBool,
}

impl ObjectStore {
    pub fn new(node: NodeId, capacity_bytes: u64) -> Self {
        Self {
            node,
            capacity_bytes,
            used_bytes: AtomicU64::new(0),
            entries: DashMap::new(),
            tombstones: DashMap::new(),
            evictions: AtomicU64::new(0),
            failed: AtomicBool::new(false),
        }
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    pub fn capacity(&self) -> u64 {
        self.capacity_bytes
    }

    pub fn used_bytes(&self) -> u64 {
        self.used_bytes.load(Ordering::SeqCst)
    }

    pub fn is_failed(&self) -> bool {
        self.failed.load(Ordering::SeqCst)
    }

    fn try_reserve(&self, size: u64) -> bool {
        self.used_bytes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |used| {
                let updated = used.checked_add(size)?;
                (updated <= self.capacity_bytes).then_some(updated)
            })
            .is_ok()
    }

    /// Seals `entry` into the store.
    ///
    /// While the store is full, each retry first evicts copies `probe` reports as
    /// unreferenced and then backs off. After `retry.max_retries` failed retries the put
    /// fails with `StoreFull`. An object larger than the whole store fails immediately.
    pub async fn put(
        &self,
        entry: StoreEntry,
        probe: &dyn ReferenceProbe,
        retry: StoreRetryPolicy,
    ) -> Result<(), ObjectError> {
        let id = entry.object.id;
        let size = entry.size;

        if self.is_failed() {
            return Err(ObjectError::Lost {
                object: id,
                reason: LostReason::NodeFailed,
            });
        }
        if self.entries.contains_key(&id) {
            tracing::trace!("Object {} already sealed on {}", id, self.node);
            return Ok(());
        }

        let mut attempts = 0;
        if size > self.capacity_bytes {
            return Err(self.full(size, attempts));
        }

        while !self.try_reserve(size) {
            if attempts >= retry.max_retries {
                tracing::warn!(
                    "Store {} full: {} bytes requested, {}/{} used after {} attempt(s)",
                    self.node,
                    size,
                    self.used_bytes(),
                    self.capacity_bytes,
                    attempts
                );
                return Err(self.full(size, attempts));
            }
            attempts += 1;

            let freed = self.evict_unreferenced(probe);
            if freed > 0 {
                tracing::debug!(
                    "Store {} reclaimed {} unreferenced object(s) on attempt {}",
                    self.node,
                    freed,
                    attempts
                );
                continue;
            }

            let delay = retry.delay_for(attempts);
            tokio::time::sleep(delay + StoreRetryPolicy::jitter(delay)).await;
        }

        match self.entries.entry(id) {
            Entry::Occupied(_) => {
                self.used_bytes.fetch_sub(size, Ordering::SeqCst);
            }
            Entry::Vacant(slot) => {
                slot.insert(entry);
            }
        }
        self.tombstones.remove(&id);

        tracing::trace!("Sealed {} ({} bytes) on {}", id, size, self.node);
        Ok(())
    }

    fn full(&self, requested: u64, attempts: u32) -> ObjectError {
        ObjectError::StoreFull {
            node: self.node,
            requested,
            used: self.used_bytes(),
            capacity: self.capacity_bytes,
            attempts,
        }
    }

    pub fn contains(&self, id: &ObjectId) -> bool {
        self.entries.contains_key(id)
    }

    /// Reads a sealed copy. Callers only ask once the owner reports the object ready, so a
    /// missing copy is lost, for the reason its tombstone records (`Evicted` once the
    /// tombstone itself has been forgotten).
    pub fn get(&self, id: &ObjectId) -> Result<Arc<[u8]>, ObjectError> {
        if let Some(entry) = self.entries.get(id) {
            return Ok(entry.payload.clone());
        }

        let reason = self
            .tombstones
            .get(id)
            .map(|reason| *reason)
            .unwrap_or(LostReason::Evicted);
        Err(ObjectError::Lost { object: *id, reason })
    }

    fn bury(&self, id: ObjectId, reason: LostReason) {
        if self.tombstones.len() > TOMBSTONE_LIMIT {
            self.tombstones.clear();
        }
        self.tombstones.insert(id, reason);
    }

    fn remove(&self, id: &ObjectId, reason: LostReason) -> bool {
        match self.entries.remove(id) {
            Some((_, entry)) => {
                self.used_bytes.fetch_sub(entry.size, Ordering::SeqCst);
                self.evictions.fetch_add(1, Ordering::Relaxed);
                self.bury(*id, reason);
                true
            }
            None => false,
        }
    }

    pub fn evict(&self, id: &ObjectId) -> bool {
        let evicted = self.remove(id, LostReason::Evicted);
        if evicted {
            tracing::trace!("Evicted {} from {}", id, self.node);
        }
        evicted
    }

    /// Drops every copy whose owner is `owner`.
    pub fn evict_owned_by(&self, owner: &WorkerId) -> usize {
        let owned: Vec<ObjectId> = self
            .entries
            .iter()
            .filter(|entry| entry.object.owner == *owner)
            .map(|entry| *entry.key())
            .collect();

        let evicted = owned
            .iter()
            .filter(|id| self.remove(id, LostReason::Evicted))
            .count();
        if evicted > 0 {
            tracing::info!(
                "Evicted {} object(s) owned by dead worker {} from {}",
                evicted,
                owner,
                self.node
            );
        }
        evicted
    }

    /// Drops every copy nobody references any more.
    pub fn evict_unreferenced(&self, probe: &dyn ReferenceProbe) -> usize {
        let candidates: Vec<ObjectRef> = self.entries.iter().map(|entry| entry.object).collect();

        candidates
            .iter()
            .filter(|object| !probe.is_referenced(object))
            .filter(|object| self.remove(&object.id, LostReason::Evicted))
            .count()
    }

    /// The node is gone: every copy is lost and later puts fail.
    pub fn fail(&self) -> usize {
        self.failed.store(true, Ordering::SeqCst);
        let ids: Vec<ObjectId> = self.entries.iter().map(|entry| *entry.key()).collect();
        let lost = ids
            .iter()
            .filter(|id| self.remove(id, LostReason::NodeFailed))
            .count();

        tracing::warn!("Node {} failed, {} object(s) lost", self.node, lost);
        lost
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> StoreStats {
        StoreStats {
            node: self.node,
            capacity_bytes: self.capacity_bytes,
            used_bytes: self.used_bytes(),
            objects: self.entries.len(),
            evictions: self.evictions.load(Ordering::Relaxed),
            failed: self.is_failed(),
        }
    }
}
