//! Worker Process
//!
//! A driver or executor process. Every worker owns the objects it creates and the return
//! objects of tasks it submits, borrows everything else, and can execute tasks.

use super::cluster::Cluster;
use crate::error::{LostReason, ObjectError};
use crate::executor::manager::TaskManager;
use crate::executor::registry::{TaskContext, WorkerExit};
use crate::executor::types::{AttemptFailure, TaskId, TaskSpec};
use crate::membership::service::LivenessService;
use crate::membership::types::{NodeId, WorkerId, WorkerKind, WorkerState};
use crate::ownership::counter::ReferenceCounter;
use crate::ownership::handle::ObjectHandle;
use crate::ownership::types::{ObjectRef, ObjectStatus};
use crate::payload::{self, Value};
use crate::store::types::StoreEntry;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

pub struct Worker {
    id: WorkerId,
    node: NodeId,
    kind: WorkerKind,
    counter: Arc<ReferenceCounter>,
    tasks: Arc<TaskManager>,
    cluster: Weak<Cluster>,
    /// Flips to `true` exactly once, when the worker dies.
    death: watch::Sender<bool>,
    /// Set to simulate a network partition: heartbeats stop, nothing else changes.
    partitioned: AtomicBool,
}

impl Worker {
    pub(crate) fn new(
        node: NodeId,
        kind: WorkerKind,
        counter: Arc<ReferenceCounter>,
        tasks: Arc<TaskManager>,
        cluster: Weak<Cluster>,
    ) -> Self {
        let (death, _) = watch::channel(false);
        Self {
            id: counter.worker(),
            node,
            kind,
            counter,
            tasks,
            cluster,
            death,
            partitioned: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> WorkerId {
        self.id
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    pub fn kind(&self) -> WorkerKind {
        self.kind
    }

    pub fn counter(&self) -> &Arc<ReferenceCounter> {
        &self.counter
    }

    pub fn tasks(&self) -> &Arc<TaskManager> {
        &self.tasks
    }

    pub fn is_alive(&self) -> bool {
        !*self.death.borrow()
    }

    pub fn death_signal(&self) -> watch::Receiver<bool> {
        self.death.subscribe()
    }

    fn cluster(&self) -> Result<Arc<Cluster>, ObjectError> {
        self.cluster.upgrade().ok_or(ObjectError::Shutdown)
    }

    fn ensure_alive(&self) -> Result<(), ObjectError> {
        if self.is_alive() {
            Ok(())
        } else {
            Err(ObjectError::Worker {
                worker: self.id,
                task: None,
                detail: "worker is dead".to_string(),
            })
        }
    }

    /// Stores `value` on this worker's node and returns the owner's handle.
    ///
    /// Refs embedded in `value` are pinned by the new object before this returns.
    pub async fn put(&self, value: Value) -> Result<ObjectHandle, ObjectError> {
        self.ensure_alive()?;
        let cluster = self.cluster()?;

        let encoded = value.encode()?;
        let handle = self
            .counter
            .create_owned(ObjectStatus::Pending, encoded.nested, None)
            .await?;
        drop(value);

        let directory = cluster.directory();
        let store = directory.store(&self.node).ok_or(ObjectError::Lost {
            object: handle.id(),
            reason: LostReason::NodeFailed,
        })?;
        let size = encoded.bytes.len() as u64;
        store
            .put(
                StoreEntry::new(handle.object_ref(), encoded.bytes),
                directory.as_ref(),
                cluster.config().store_retry(),
            )
            .await?;

        self.counter.table().set_status(
            &handle.id(),
            ObjectStatus::Ready {
                node: self.node,
                size,
            },
        );
        tracing::debug!("{} put {} ({} bytes)", self.id, handle.object_ref(), size);

        Ok(handle)
    }

    /// Resolves `object` to its value, waiting for it to become ready.
    ///
    /// Refs inside the value come back as handles held by this worker.
    pub async fn get(&self, object: &ObjectRef, timeout: Option<Duration>) -> Result<Value, ObjectError> {
        self.ensure_alive()?;
        let cluster = self.cluster()?;
        let deadline = timeout.map(|timeout| tokio::time::Instant::now() + timeout);

        loop {
            let table = cluster
                .directory()
                .table(&object.owner)
                .ok_or_else(|| ObjectError::owner_died(object.owner))?;
            if table.is_dead() {
                return Err(ObjectError::owner_died(object.owner));
            }
            let Some(mut status) = table.subscribe(&object.id) else {
                return Err(ObjectError::Lost {
                    object: object.id,
                    reason: LostReason::Evicted,
                });
            };

            let settled = {
                let wait = status.wait_for(|status| !status.is_pending());
                match deadline {
                    Some(deadline) => match tokio::time::timeout_at(deadline, wait).await {
                        Ok(settled) => settled.map(|status| (*status).clone()),
                        Err(_) => {
                            return Err(ObjectError::Timeout {
                                object: object.id,
                                timeout: timeout.unwrap_or_default(),
                            });
                        }
                    },
                    None => wait.await.map(|status| (*status).clone()),
                }
            };

            // A closed channel means the record is gone
            let settled = match settled {
                Ok(status) => status,
                Err(_) if table.is_dead() => return Err(ObjectError::owner_died(object.owner)),
                Err(_) => {
                    return Err(ObjectError::Lost {
                        object: object.id,
                        reason: LostReason::Evicted,
                    });
                }
            };

            match settled {
                ObjectStatus::Failed(err) => return Err(err),
                ObjectStatus::Pending => continue,
                ObjectStatus::Ready { node, .. } => {
                    let copy = cluster
                        .directory()
                        .store(&node)
                        .ok_or(ObjectError::Lost {
                            object: object.id,
                            reason: LostReason::NodeFailed,
                        })
                        .and_then(|store| store.get(&object.id));

                    match copy {
                        Ok(bytes) => return self.materialize(object, &bytes).await,
                        Err(ObjectError::Lost { reason, .. }) => {
                            tracing::warn!(
                                "{} is referenced but its copy on {} is gone: {}",
                                object,
                                node,
                                reason
                            );
                            cluster.recover(object, reason)?;
                        }
                        Err(e) => return Err(e),
                    }
                }
            }
        }
    }

    async fn materialize(&self, container: &ObjectRef, bytes: &[u8]) -> Result<Value, ObjectError> {
        let wire = payload::decode(bytes)?;
        let nested = self.counter.scan_payload(container, &wire);

        let mut handles = HashMap::with_capacity(nested.len());
        for object in nested.iter() {
            handles.insert(*object, self.counter.adopt(*object).await?);
        }

        wire.into_value(&handles)
    }

    /// Takes a counted handle on a ref received out of band (e.g. over HTTP).
    pub async fn adopt(&self, object: ObjectRef) -> Result<ObjectHandle, ObjectError> {
        self.ensure_alive()?;
        self.counter.adopt(object).await
    }

    pub async fn submit_task(
        &self,
        spec: TaskSpec,
        args: Vec<ObjectRef>,
    ) -> Result<ObjectHandle, ObjectError> {
        self.ensure_alive()?;
        self.tasks.submit(spec, args).await
    }

    /// Waits until every owner this worker reported to has applied those reports.
    pub async fn flush(&self) {
        self.counter.flush().await;
    }

    /// Runs one attempt of a task on this worker.
    pub(crate) async fn execute(
        self: Arc<Self>,
        task_id: TaskId,
        handler: String,
        args: Vec<ObjectRef>,
        attempt: u32,
    ) -> Result<Value, AttemptFailure> {
        let cluster = self
            .cluster()
            .map_err(|err| AttemptFailure::Crash(err.to_string()))?;

        let mut values = Vec::with_capacity(args.len());
        for arg in &args {
            match self.get(arg, None).await {
                Ok(value) => values.push(value),
                Err(_) if !self.is_alive() => {
                    return Err(AttemptFailure::Crash("executor died".to_string()));
                }
                Err(err) => return Err(AttemptFailure::Argument(err)),
            }
        }

        let ctx = TaskContext::new(task_id, attempt, values, self.clone());
        match cluster.registry().execute(&handler, ctx).await {
            Ok(value) => Ok(value),
            Err(err) if err.is::<WorkerExit>() => Err(AttemptFailure::Crash(err.to_string())),
            Err(err) => Err(AttemptFailure::Handler(err.to_string())),
        }
    }

    /// Simulated process exit.
    pub fn exit(&self) {
        match self.cluster.upgrade() {
            Some(cluster) => cluster.kill_worker(self.id),
            None => self.crash(),
        }
    }

    /// Fences this worker: it stops heartbeating and nothing it owns or holds counts.
    pub(crate) fn crash(&self) {
        if self.death.send_replace(true) {
            return;
        }
        self.counter.shutdown();
        tracing::warn!("{} ({:?}) on {} crashed", self.id, self.kind, self.node);
    }

    /// Stops heartbeats without killing the worker, so the failure detector has to find it.
    pub fn partition(&self) {
        self.partitioned.store(true, Ordering::SeqCst);
        tracing::warn!("{} is partitioned from the cluster", self.id);
    }

    pub(crate) fn spawn_heartbeat(self: &Arc<Self>, membership: Arc<LivenessService>) -> JoinHandle<()> {
        let worker = Arc::downgrade(self);
        let id = self.id;
        let mut death = self.death_signal();
        let interval = membership.timing().heartbeat_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            let mut incarnation = 1;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = death.wait_for(|dead| *dead) => break,
                }

                let Some(alive) = worker.upgrade() else { break };
                if alive.partitioned.load(Ordering::SeqCst) {
                    continue;
                }

                match membership.heartbeat(id, incarnation) {
                    Some(WorkerState::Suspect) => {
                        incarnation += 1;
                        tracing::debug!("{} refuting suspicion with incarnation {}", id, incarnation);
                        membership.heartbeat(id, incarnation);
                    }
                    Some(WorkerState::Dead) | None => break,
                    Some(WorkerState::Alive) => {}
                }
            }

            tracing::trace!("Heartbeat loop of {} stopped", id);
        })
    }
}
