use super::counter::ReferenceCounter;
use super::types::{ObjectId, ObjectRef};
use crate::membership::types::WorkerId;

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// A counted reference to an object, held by one worker.
///
/// Cloning takes another reference, dropping gives it back. Whether that touches the local
/// ownership table or the borrow ledger depends on whether the holder owns the object.
pub struct ObjectHandle {
    object: ObjectRef,
    counter: Arc<ReferenceCounter>,
}

impl ObjectHandle {
    /// Wraps a reference that was already counted against `counter`.
    pub(crate) fn counted(object: ObjectRef, counter: Arc<ReferenceCounter>) -> Self {
        Self { object, counter }
    }

    pub fn object_ref(&self) -> ObjectRef {
        self.object
    }

    pub fn id(&self) -> ObjectId {
        self.object.id
    }

    pub fn owner(&self) -> WorkerId {
        self.object.owner
    }

    /// The worker whose bookkeeping this handle counts against.
    pub fn holder(&self) -> WorkerId {
        self.counter.worker()
    }

    pub fn is_owned_by_holder(&self) -> bool {
        self.object.owner == self.counter.worker()
    }
}

impl Clone for ObjectHandle {
    fn clone(&self) -> Self {
        self.counter.retain(&self.object);
        Self {
            object: self.object,
            counter: self.counter.clone(),
        }
    }
}

impl Drop for ObjectHandle {
    fn drop(&mut self) {
        self.counter.release(&self.object);
    }
}

impl PartialEq for ObjectHandle {
    fn eq(&self, other: &Self) -> bool {
        self.object == other.object
    }
}

impl Eq for ObjectHandle {}

impl Hash for ObjectHandle {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.object.hash(state);
    }
}

impl fmt::Debug for ObjectHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectHandle")
            .field("object", &self.object)
            .field("holder", &self.counter.worker())
            .finish()
    }
}
