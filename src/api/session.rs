//! Driver Session
//!
//! HTTP clients cannot hold an `ObjectHandle`, so the session holds one per object on
//! their behalf: from the put, task submission or read that produced the ref until the
//! client deletes it. Dropping the session releases everything it still holds.

use super::protocol::{json_to_value, value_to_json};
use crate::cluster::{Cluster, Worker};
use crate::error::ObjectError;
use crate::executor::types::TaskSpec;
use crate::ownership::handle::ObjectHandle;
use crate::ownership::types::{ObjectId, ObjectRef};

use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;

/// Why a session operation did not reach the cluster, or what the cluster answered.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("object {0} is not held by this session")]
    UnknownObject(ObjectId),
    #[error("{0}")]
    BadRequest(String),
    #[error(transparent)]
    Object(#[from] ObjectError),
}

pub struct DriverSession {
    cluster: Arc<Cluster>,
    driver: Arc<Worker>,
    handles: DashMap<ObjectId, ObjectHandle>,
}

impl DriverSession {
    pub fn new(cluster: Arc<Cluster>, driver: Arc<Worker>) -> Arc<Self> {
        Arc::new(Self {
            cluster,
            driver,
            handles: DashMap::new(),
        })
    }

    pub fn cluster(&self) -> &Arc<Cluster> {
        &self.cluster
    }

    pub fn driver(&self) -> &Arc<Worker> {
        &self.driver
    }

    pub fn lookup(&self, id: &ObjectId) -> Option<ObjectRef> {
        self.handles.get(id).map(|handle| handle.object_ref())
    }

    fn resolve(&self, id: ObjectId) -> Option<ObjectHandle> {
        self.handles.get(&id).map(|handle| handle.clone())
    }

    /// Keeps `handle` alive until the client releases it. A second handle to the same
    /// object is simply dropped.
    fn hold(&self, handle: ObjectHandle) -> ObjectId {
        let id = handle.id();
        self.handles.entry(id).or_insert(handle);
        id
    }

    pub async fn put_json(&self, json: &serde_json::Value) -> Result<ObjectId, SessionError> {
        let value =
            json_to_value(json, &|id| self.resolve(id)).map_err(SessionError::BadRequest)?;
        let handle = self.driver.put(value).await?;
        Ok(self.hold(handle))
    }

    /// Reads an object. Refs inside it become held by the session so the client can use
    /// them in later calls.
    pub async fn get_json(
        &self,
        id: &ObjectId,
        timeout: Option<Duration>,
    ) -> Result<serde_json::Value, SessionError> {
        let object = self.lookup(id).ok_or(SessionError::UnknownObject(*id))?;
        let value = self.driver.get(&object, timeout).await?;

        for handle in value.handles() {
            self.hold(handle.clone());
        }
        Ok(value_to_json(&value))
    }

    pub fn release(&self, id: &ObjectId) -> bool {
        self.handles.remove(id).is_some()
    }

    pub async fn submit(
        &self,
        spec: TaskSpec,
        args: &[ObjectId],
    ) -> Result<ObjectHandle, SessionError> {
        let args = args
            .iter()
            .map(|id| self.lookup(id).ok_or(SessionError::UnknownObject(*id)))
            .collect::<Result<Vec<_>, _>>()?;

        let handle = self.driver.submit_task(spec, args).await?;
        self.hold(handle.clone());
        Ok(handle)
    }

    pub fn held(&self) -> usize {
        self.handles.len()
    }
}
