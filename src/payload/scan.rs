//! Nested Ref Scans

use crate::ownership::types::{ObjectId, ObjectRef};

use dashmap::DashMap;
use std::sync::Arc;

const SCAN_CACHE_LIMIT: usize = 10_000;

/// Memoized nested-ref scans, one cache per worker.
///
/// The first scan of an object is also the moment its refs are discovered by this worker;
/// `scan` reports that to the caller so discovery happens at most once.
pub struct ScanCache {
    scanned: DashMap<ObjectId, Arc<Vec<ObjectRef>>>,
}

impl ScanCache {
    pub fn new() -> Self {
        Self {
            scanned: DashMap::new(),
        }
    }

    /// Returns the refs and whether this call performed the scan.
    pub fn scan(
        &self,
        id: ObjectId,
        scan: impl FnOnce() -> Vec<ObjectRef>,
    ) -> (Arc<Vec<ObjectRef>>, bool) {
        if let Some(refs) = self.scanned.get(&id) {
            return (refs.clone(), false);
        }

        // Simple cleanup: rescans are harmless, discovery is idempotent at the owner
        if self.scanned.len() > SCAN_CACHE_LIMIT {
            self.scanned.clear();
        }

        let mut first = false;
        let refs = self
            .scanned
            .entry(id)
            .or_insert_with(|| {
                first = true;
                Arc::new(scan())
            })
            .clone();

        (refs, first)
    }

    pub fn forget(&self, id: &ObjectId) {
        self.scanned.remove(id);
    }

    pub fn len(&self) -> usize {
        self.scanned.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scanned.is_empty()
    }

    pub fn clear(&self) {
        self.scanned.clear();
    }
}

impl Default for ScanCache {
    fn default() -> Self {
        Self::new()
    }
}
