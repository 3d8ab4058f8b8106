//! Task Lifecycle Manager
//!
//! Lives on the submitting worker. A submission registers the return object (owned by the
//! submitter, status `Pending`), pins every argument for the task, records lineage and
//! drives attempts on executor workers until one returns, fails terminally, or the retry
//! budget runs out.
//!
//! ## Attempt outcomes
//! - **Returned**: the value is encoded, its nested refs are pinned by the return object,
//!   the payload is sealed on the executor's node and the return object becomes `Ready`.
//! - **Crashed**: the executor died. Retried after the retry delay while attempts remain.
//! - **Failed**: handler error or unfetchable argument. Terminal, never retried.
//!
//! Argument pins are released exactly once, when the task reaches a terminal state.

use super::types::{AttemptFailure, PendingTask, TaskId, TaskSpec, TaskStatus, now_ms};
use crate::cluster::{Cluster, Worker};
use crate::config::ClusterConfig;
use crate::error::{LostReason, ObjectError};
use crate::eviction::lineage::LineageEntry;
use crate::eviction::policy::{Recovery, StoreRetryPolicy, plan_recovery};
use crate::membership::types::WorkerId;
use crate::ownership::counter::ReferenceCounter;
use crate::ownership::handle::ObjectHandle;
use crate::ownership::types::{ObjectRef, ObjectStatus};
use crate::payload::Value;
use crate::store::types::StoreEntry;

use dashmap::DashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

enum AttemptOutcome {
    Returned { value: Value, executor: Arc<Worker> },
    Crashed { worker: WorkerId, detail: String },
    Failed(ObjectError),
}

pub struct TaskManager {
    worker: WorkerId,
    counter: Arc<ReferenceCounter>,
    cluster: Weak<Cluster>,
    tasks: DashMap<TaskId, PendingTask>,
    /// Executor of the attempt currently running, per task.
    running: DashMap<TaskId, WorkerId>,
    default_max_retries: u32,
    default_retry_delay: Duration,
    store_retry: StoreRetryPolicy,
}

impl TaskManager {
    pub fn new(
        counter: Arc<ReferenceCounter>,
        cluster: Weak<Cluster>,
        config: &ClusterConfig,
    ) -> Arc<Self> {
        let manager = Arc::new(Self {
            worker: counter.worker(),
            counter: counter.clone(),
            cluster,
            tasks: DashMap::new(),
            running: DashMap::new(),
            default_max_retries: config.default_max_retries,
            default_retry_delay: config.task_retry_delay(),
            store_retry: config.store_retry(),
        });
        counter.attach_tasks(&manager);
        manager
    }

    fn cluster(&self) -> Result<Arc<Cluster>, ObjectError> {
        self.cluster.upgrade().ok_or(ObjectError::Shutdown)
    }

    /// Submits a task and returns a handle to its (pending) return object.
    ///
    /// Arguments are pinned before this returns. If an argument cannot be pinned, its
    /// error becomes the return object's terminal failure.
    pub async fn submit(
        self: &Arc<Self>,
        spec: TaskSpec,
        args: Vec<ObjectRef>,
    ) -> Result<ObjectHandle, ObjectError> {
        let task_id = TaskId::new();
        let max_retries = spec.max_retries.unwrap_or(self.default_max_retries);
        let retry_delay = spec.retry_delay.unwrap_or(self.default_retry_delay);

        let handle = self
            .counter
            .create_owned(ObjectStatus::Pending, Vec::new(), Some(task_id))
            .await?;
        let return_ref = handle.object_ref();

        let mut task = PendingTask {
            task_id,
            spec: spec.clone(),
            args: args.clone(),
            return_ref,
            max_retries,
            retry_delay,
            attempts: 0,
            status: TaskStatus::Pending,
            pins: None,
            pin_releases: 0,
            reconstruction: false,
            created_at: now_ms(),
        };

        if let Err(err) = self.pin_arguments(task_id, &args) {
            tracing::warn!("Task {} cannot pin its arguments: {}", task_id, err);
            task.status = TaskStatus::Failed {
                error: err.to_string(),
            };
            task.pin_releases = 1;
            self.tasks.insert(task_id, task);
            self.counter
                .table()
                .set_status(&return_ref.id, ObjectStatus::Failed(err));
            return Ok(handle);
        }

        task.pins = Some(args.clone());
        let handler = spec.handler.clone();
        self.counter.lineage().insert(LineageEntry {
            task_id,
            spec,
            args,
            return_ref,
            max_retries,
            retry_delay,
            reconstructions_left: max_retries,
        });
        self.tasks.insert(task_id, task);

        tracing::info!(
            "Submitted task {} ({}) returning {}",
            task_id,
            handler,
            return_ref
        );

        let manager = self.clone();
        tokio::spawn(async move { manager.drive(task_id).await });

        Ok(handle)
    }

    /// Pins every argument, or none of them.
    fn pin_arguments(&self, task_id: TaskId, args: &[ObjectRef]) -> Result<(), ObjectError> {
        for (pinned, arg) in args.iter().enumerate() {
            if let Err(err) = self.counter.pin_for_task(arg, task_id, self.worker) {
                for earlier in &args[..pinned] {
                    self.counter.unpin_for_task(earlier, task_id);
                }
                return Err(err);
            }
        }
        Ok(())
    }

    async fn drive(self: Arc<Self>, task_id: TaskId) {
        let Some(task) = self.tasks.get(&task_id).map(|task| task.clone()) else {
            return;
        };

        let mut attempt = 0;
        let result = loop {
            if !self.counter.is_alive() {
                tracing::debug!("Submitter of task {} died, abandoning it", task_id);
                return;
            }

            attempt += 1;
            match self.run_attempt(&task, attempt).await {
                AttemptOutcome::Returned { value, executor } => {
                    break self.seal_return(&task, value, &executor).await;
                }
                AttemptOutcome::Failed(err) => break Err(err),
                AttemptOutcome::Crashed { worker, detail } => {
                    if attempt <= task.max_retries {
                        tracing::warn!(
                            "Task {} attempt {} crashed on {} ({}), retrying in {:?}",
                            task_id,
                            attempt,
                            worker,
                            detail,
                            task.retry_delay
                        );
                        self.update(&task_id, |task| {
                            task.status = TaskStatus::Retrying { attempt }
                        });
                        tokio::time::sleep(task.retry_delay).await;
                        continue;
                    }

                    break Err(ObjectError::Worker {
                        worker,
                        task: Some(task_id),
                        detail: format!("{} (after {} attempt(s))", detail, attempt),
                    });
                }
            }
        };

        self.finish(task_id, result);
    }

    async fn run_attempt(&self, task: &PendingTask, attempt: u32) -> AttemptOutcome {
        let cluster = match self.cluster() {
            Ok(cluster) => cluster,
            Err(err) => return AttemptOutcome::Failed(err),
        };
        let executor = cluster.pick_executor();
        let task_id = task.task_id;

        self.running.insert(task_id, executor.id());
        self.update(&task_id, |task| {
            task.attempts = attempt;
            task.status = TaskStatus::Running {
                attempt,
                worker: executor.id(),
            };
        });
        tracing::debug!(
            "Task {} attempt {} running on {}",
            task_id,
            attempt,
            executor.id()
        );

        let mut death = executor.death_signal();
        let mut execution = tokio::spawn(executor.clone().execute(
            task_id,
            task.spec.handler.clone(),
            task.args.clone(),
            attempt,
        ));

        let outcome = tokio::select! {
            joined = &mut execution => match joined {
                Ok(Ok(value)) => AttemptOutcome::Returned { value, executor: executor.clone() },
                Ok(Err(AttemptFailure::Crash(detail))) => AttemptOutcome::Crashed { worker: executor.id(), detail },
                Ok(Err(AttemptFailure::Argument(err))) => AttemptOutcome::Failed(err),
                Ok(Err(AttemptFailure::Handler(message))) => {
                    AttemptOutcome::Failed(ObjectError::Task { task: task_id, message })
                }
                Err(join_err) => AttemptOutcome::Crashed {
                    worker: executor.id(),
                    detail: if join_err.is_panic() {
                        "handler panicked".to_string()
                    } else {
                        "attempt was cancelled".to_string()
                    },
                },
            },
            _ = death.wait_for(|dead| *dead) => {
                execution.abort();
                AttemptOutcome::Crashed {
                    worker: executor.id(),
                    detail: "executor died mid-execution".to_string(),
                }
            }
        };

        self.running.remove(&task_id);
        outcome
    }

    /// Pins the refs embedded in the returned value on behalf of the return object, then
    /// seals the payload on the executor's node. Returns the status to publish.
    async fn seal_return(
        &self,
        task: &PendingTask,
        value: Value,
        executor: &Arc<Worker>,
    ) -> Result<ObjectStatus, ObjectError> {
        let encoded = value.encode()?;
        let return_id = task.return_ref.id;

        match self
            .counter
            .table()
            .record_nested(&return_id, encoded.nested.clone())
        {
            Ok(followups) => self.counter.dispatch_and_wait(followups).await,
            Err(_) => {
                tracing::debug!(
                    "Return object of task {} released before completion",
                    task.task_id
                );
                return Err(ObjectError::Lost {
                    object: return_id,
                    reason: LostReason::Evicted,
                });
            }
        }
        // The executor's handles may go now that the return object pins them
        drop(value);

        let directory = self.counter.directory();
        let store = directory.store(&executor.node()).ok_or(ObjectError::Lost {
            object: return_id,
            reason: LostReason::NodeFailed,
        })?;
        let size = encoded.bytes.len() as u64;
        store
            .put(
                StoreEntry::new(task.return_ref, encoded.bytes),
                directory.as_ref(),
                self.store_retry,
            )
            .await?;

        Ok(ObjectStatus::Ready {
            node: executor.node(),
            size,
        })
    }

    /// Releases argument pins (once), then publishes the outcome on the return object.
    fn finish(&self, task_id: TaskId, result: Result<ObjectStatus, ObjectError>) {
        let (pins, return_ref, reconstruction) = {
            let Some(mut task) = self.tasks.get_mut(&task_id) else {
                return;
            };
            let pins = task.pins.take();
            if pins.is_some() {
                task.pin_releases += 1;
            }
            task.status = match &result {
                Ok(_) => TaskStatus::Completed,
                Err(err) => TaskStatus::Failed {
                    error: err.to_string(),
                },
            };
            (pins, task.return_ref, task.reconstruction)
        };

        for arg in pins.iter().flatten() {
            self.counter.unpin_for_task(arg, task_id);
        }

        let table = self.counter.table();
        match result {
            Ok(status) => {
                let node = match &status {
                    ObjectStatus::Ready { node, .. } => Some(*node),
                    _ => None,
                };
                if table.set_status(&return_ref.id, status) {
                    tracing::info!("Task {} completed", task_id);
                } else if let Some(store) = node.and_then(|node| self.counter.directory().store(&node)) {
                    // Nobody wanted the result any more
                    store.evict(&return_ref.id);
                }
            }
            Err(err) => {
                let err = if reconstruction {
                    tracing::error!("Reconstruction of {} via task {} failed: {}", return_ref, task_id, err);
                    ObjectError::Lost {
                        object: return_ref.id,
                        reason: LostReason::ReconstructionFailed,
                    }
                } else {
                    tracing::error!("Task {} failed: {}", task_id, err);
                    err
                };
                self.counter.lineage().remove(&task_id);
                table.set_status(&return_ref.id, ObjectStatus::Failed(err));
            }
        }

        // Released while running: nothing will ask about this task again
        if !table.contains(&return_ref.id) {
            self.tasks.remove(&task_id);
        }
    }

    /// Re-runs the task that produced `object` after its stored copy was lost to `cause`.
    ///
    /// Returns `Ok` if a reconstruction is now under way (started here or by a concurrent
    /// caller). Fails with `Lost` when there is no lineage or its budget is used up; the
    /// object is then marked failed for every reader. A `put` object whose node failed
    /// reports `NodeFailed` rather than `NoLineage`.
    pub fn reconstruct(
        self: &Arc<Self>,
        object: &ObjectRef,
        cause: LostReason,
    ) -> Result<(), ObjectError> {
        let table = self.counter.table();
        let lost = |reason| ObjectError::Lost {
            object: object.id,
            reason,
        };

        match table.restart(&object.id) {
            Some(true) => {}
            Some(false) => return Ok(()),
            None => return Err(lost(LostReason::Evicted)),
        }

        let entry = match plan_recovery(table.lineage_of(&object.id), self.counter.lineage()) {
            Recovery::Reconstruct(entry) => entry,
            Recovery::Lost(reason) => {
                let reason = match (reason, cause) {
                    (LostReason::NoLineage, LostReason::NodeFailed) => LostReason::NodeFailed,
                    (reason, _) => reason,
                };
                tracing::warn!("Object {} cannot be reconstructed: {}", object, reason);
                table.set_status(&object.id, ObjectStatus::Failed(lost(reason)));
                return Err(lost(reason));
            }
        };

        if let Err(err) = self.pin_arguments(entry.task_id, &entry.args) {
            tracing::warn!("Arguments of task {} are gone: {}", entry.task_id, err);
            let err = lost(LostReason::ReconstructionFailed);
            table.set_status(&object.id, ObjectStatus::Failed(err.clone()));
            return Err(err);
        }

        tracing::info!(
            "Reconstructing {} by re-executing task {} ({} reconstruction(s) left)",
            object,
            entry.task_id,
            entry.reconstructions_left
        );

        self.tasks.insert(
            entry.task_id,
            PendingTask {
                task_id: entry.task_id,
                spec: entry.spec,
                args: entry.args.clone(),
                return_ref: entry.return_ref,
                max_retries: entry.max_retries,
                retry_delay: entry.retry_delay,
                attempts: 0,
                status: TaskStatus::Pending,
                pins: Some(entry.args),
                pin_releases: 0,
                reconstruction: true,
                created_at: now_ms(),
            },
        );

        let manager = self.clone();
        let task_id = entry.task_id;
        tokio::spawn(async move { manager.drive(task_id).await });

        Ok(())
    }

    /// Fault injection: crashes the worker running the current attempt of `task_id`.
    pub fn kill(&self, task_id: &TaskId) -> Option<WorkerId> {
        let worker = self.running.get(task_id).map(|worker| *worker)?;
        let cluster = self.cluster().ok()?;
        tracing::warn!("Killing {} while it runs task {}", worker, task_id);
        cluster.kill_worker(worker);
        Some(worker)
    }

    /// Forgets a finished task whose return object was released. A task still running
    /// is retired by `finish` instead.
    pub(crate) fn retire(&self, task_id: &TaskId) -> bool {
        let retired = self
            .tasks
            .remove_if(task_id, |_, task| task.status.is_terminal())
            .is_some();
        if retired {
            tracing::trace!("Retired task {}", task_id);
        }
        retired
    }

    fn update(&self, task_id: &TaskId, change: impl FnOnce(&mut PendingTask)) {
        if let Some(mut task) = self.tasks.get_mut(task_id) {
            change(&mut task);
        }
    }

    pub fn task(&self, task_id: &TaskId) -> Option<PendingTask> {
        self.tasks.get(task_id).map(|task| task.clone())
    }

    pub fn status(&self, task_id: &TaskId) -> Option<TaskStatus> {
        self.tasks.get(task_id).map(|task| task.status.clone())
    }

    /// The task whose return object is `object`.
    pub fn task_for(&self, object: &ObjectRef) -> Option<TaskId> {
        self.counter.table().lineage_of(&object.id)
    }

    pub fn running_on(&self, task_id: &TaskId) -> Option<WorkerId> {
        self.running.get(task_id).map(|worker| *worker)
    }

    /// Tasks not yet in a terminal state.
    pub fn pending_count(&self) -> usize {
        self.tasks
            .iter()
            .filter(|task| !task.status.is_terminal())
            .count()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}
