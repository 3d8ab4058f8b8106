//! Reference Counter
//!
//! One per worker. Ties the worker's own `OwnershipTable` (objects it owns) to its
//! `BorrowLedger` (objects it borrows) and delivers whatever follow-up work the table
//! produces: pin changes to other owners and evictions of released objects.

use super::directory::OwnerDirectory;
use super::handle::ObjectHandle;
use super::ledger::BorrowLedger;
use super::protocol::{self, BorrowerReport, Envelope, PinChange, ProtocolMessage};
use super::table::{Followups, OwnershipTable, PinRequest, ReleasedObject};
use super::types::{ObjectRef, ObjectStatus};
use crate::error::ObjectError;
use crate::eviction::lineage::LineageTable;
use crate::executor::manager::TaskManager;
use crate::executor::types::TaskId;
use crate::membership::types::WorkerId;
use crate::payload::WireValue;
use crate::payload::scan::ScanCache;

use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

pub struct ReferenceCounter {
    worker: WorkerId,
    table: Arc<OwnershipTable>,
    ledger: BorrowLedger,
    directory: Arc<OwnerDirectory>,
    scans: ScanCache,
    lineage: LineageTable,
    /// Retires a task's record once its return object is released.
    tasks: OnceLock<Weak<TaskManager>>,
    /// Owners this worker has sent anything to, for `flush`.
    peers: DashMap<WorkerId, ()>,
    alive: AtomicBool,
}

impl ReferenceCounter {
    pub fn new(
        worker: WorkerId,
        table: Arc<OwnershipTable>,
        directory: Arc<OwnerDirectory>,
    ) -> Arc<Self> {
        Arc::new(Self {
            worker,
            table,
            ledger: BorrowLedger::new(worker),
            directory,
            scans: ScanCache::new(),
            lineage: LineageTable::new(),
            tasks: OnceLock::new(),
            peers: DashMap::new(),
            alive: AtomicBool::new(true),
        })
    }

    pub fn worker(&self) -> WorkerId {
        self.worker
    }

    pub fn table(&self) -> &Arc<OwnershipTable> {
        &self.table
    }

    pub fn ledger(&self) -> &BorrowLedger {
        &self.ledger
    }

    pub fn directory(&self) -> &Arc<OwnerDirectory> {
        &self.directory
    }

    pub fn lineage(&self) -> &LineageTable {
        &self.lineage
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    pub(crate) fn attach_tasks(&self, tasks: &Arc<TaskManager>) {
        if self.tasks.set(Arc::downgrade(tasks)).is_err() {
            tracing::warn!("{} already has a task manager", self.worker);
        }
    }

    /// Creates an owned object and returns its first handle. Returns once every owner of
    /// a nested ref has applied its container pin.
    pub async fn create_owned(
        self: &Arc<Self>,
        status: ObjectStatus,
        nested: Vec<ObjectRef>,
        lineage: Option<TaskId>,
    ) -> Result<ObjectHandle, ObjectError> {
        let (object, followups) = self.table.create(status, nested, lineage)?;
        let handle = ObjectHandle::counted(object, self.clone());
        self.dispatch_and_wait(followups).await;
        Ok(handle)
    }

    /// Takes a new handle on `object`. A first borrowed handle is registered with the
    /// owner before this returns.
    pub async fn adopt(self: &Arc<Self>, object: ObjectRef) -> Result<ObjectHandle, ObjectError> {
        if !self.is_alive() {
            return Err(ObjectError::owner_died(self.worker));
        }

        if object.owner == self.worker {
            self.table.add_local_ref(&object.id)?;
            return Ok(ObjectHandle::counted(object, self.clone()));
        }
        if self
            .directory
            .table(&object.owner)
            .is_none_or(|table| table.is_dead())
        {
            return Err(ObjectError::owner_died(object.owner));
        }

        let pending = self
            .ledger
            .acquire(&object, |report| self.send_report(object.owner, report, true))
            .flatten();
        if let Some(ack) = pending
            && ack.await.is_err()
        {
            tracing::debug!(
                "Owner {} went away before acknowledging borrow of {}",
                object.owner,
                object.id
            );
        }

        Ok(ObjectHandle::counted(object, self.clone()))
    }

    /// Called by `ObjectHandle::clone`.
    pub(crate) fn retain(&self, object: &ObjectRef) {
        if !self.is_alive() {
            return;
        }

        if object.owner == self.worker {
            if let Err(e) = self.table.add_local_ref(&object.id) {
                tracing::error!("Failed to retain {}: {}", object, e);
            }
        } else {
            self.ledger
                .acquire(object, |report| self.send_report(object.owner, report, false));
        }
    }

    /// Called by `ObjectHandle::drop`.
    pub(crate) fn release(&self, object: &ObjectRef) {
        if !self.is_alive() {
            return;
        }

        if object.owner == self.worker {
            match self.table.remove_local_ref(&object.id) {
                Ok(followups) => self.dispatch(followups),
                Err(e) => tracing::error!("{}", e),
            }
        } else if let Err(e) = self
            .ledger
            .release(object, |report| self.send_report(object.owner, report, false))
        {
            tracing::error!("{}", e);
        }
    }

    pub(crate) fn pin_for_task(
        &self,
        object: &ObjectRef,
        task: TaskId,
        submitter: WorkerId,
    ) -> Result<(), ObjectError> {
        if object.owner == self.worker {
            let followups = self.table.add_task_pin(&object.id, task, submitter)?;
            self.dispatch(followups);
            return Ok(());
        }

        let message = ProtocolMessage::Pin {
            object: object.id,
            change: PinChange::AddTask { task, submitter },
        };
        self.directory.send(self.worker, object.owner, message, false)?;
        self.peers.insert(object.owner, ());
        Ok(())
    }

    pub(crate) fn unpin_for_task(&self, object: &ObjectRef, task: TaskId) {
        if object.owner == self.worker {
            match self.table.remove_task_pin(&object.id, task) {
                Ok(followups) => self.dispatch(followups),
                Err(e) => tracing::error!("Failed to unpin {} for task {}: {}", object, task, e),
            }
            return;
        }

        let message = ProtocolMessage::Pin {
            object: object.id,
            change: PinChange::RemoveTask { task },
        };
        if let Err(e) = self.directory.send(self.worker, object.owner, message, false) {
            tracing::debug!("Pin release for {} not delivered: {}", object, e);
        }
    }

    /// Scans a deserialized payload for embedded refs. The first time this worker scans a
    /// borrowed container, the refs are reported to the container's owner.
    pub fn scan_payload(&self, container: &ObjectRef, wire: &WireValue) -> Arc<Vec<ObjectRef>> {
        let (refs, first) = self.scans.scan(container.id, || wire.refs());
        if !first || refs.is_empty() {
            return refs;
        }

        if container.owner == self.worker {
            match self.table.record_nested(&container.id, refs.to_vec()) {
                Ok(followups) => self.dispatch(followups),
                Err(e) => tracing::debug!("Container {} gone before scan: {}", container, e),
            }
        } else {
            self.ledger.discovered(container, refs.to_vec(), |report| {
                self.send_report(container.owner, report, false)
            });
        }

        refs
    }

    /// Delivers follow-ups without waiting for remote owners.
    pub fn dispatch(&self, followups: Followups) {
        if followups.is_empty() {
            return;
        }
        self.deliver(followups, false);
    }

    /// Delivers follow-ups and waits until every remote owner applied its pin change.
    pub async fn dispatch_and_wait(&self, followups: Followups) {
        if followups.is_empty() {
            return;
        }
        for ack in self.deliver(followups, true) {
            let _ = ack.await;
        }
    }

    fn deliver(&self, followups: Followups, want_ack: bool) -> Vec<oneshot::Receiver<()>> {
        let mut acks = Vec::new();
        let mut queue = VecDeque::from([followups]);

        while let Some(Followups { pins, released }) = queue.pop_front() {
            for object in released {
                self.on_released(object);
            }

            for PinRequest { target, change } in pins {
                if target.owner == self.worker {
                    match self.table.apply_pin(&target.id, change) {
                        Ok(more) => queue.push_back(more),
                        Err(e) => tracing::warn!("Local pin change on {} failed: {}", target, e),
                    }
                    continue;
                }

                let message = ProtocolMessage::Pin {
                    object: target.id,
                    change,
                };
                match self.directory.send(self.worker, target.owner, message, want_ack) {
                    Ok(ack) => {
                        self.peers.insert(target.owner, ());
                        acks.extend(ack);
                    }
                    Err(e) => tracing::debug!("Pin change for {} dropped: {}", target, e),
                }
            }
        }

        acks
    }

    fn on_released(&self, released: ReleasedObject) {
        if let Some(node) = released.location
            && let Some(store) = self.directory.store(&node)
        {
            store.evict(&released.object.id);
        }
        if let Some(task) = released.lineage {
            self.lineage.remove(&task);
            if let Some(tasks) = self.tasks.get().and_then(Weak::upgrade) {
                tasks.retire(&task);
            }
        }
        self.scans.forget(&released.object.id);
    }

    fn send_report(
        &self,
        owner: WorkerId,
        report: BorrowerReport,
        want_ack: bool,
    ) -> Option<oneshot::Receiver<()>> {
        match self
            .directory
            .send(self.worker, owner, ProtocolMessage::Report(report), want_ack)
        {
            Ok(ack) => {
                self.peers.insert(owner, ());
                ack
            }
            Err(e) => {
                tracing::debug!("Report to {} not delivered: {}", owner, e);
                None
            }
        }
    }

    /// Drains this worker's inbox until every sender is gone.
    pub fn spawn_inbox(
        self: &Arc<Self>,
        mut inbox: mpsc::UnboundedReceiver<Envelope>,
    ) -> JoinHandle<()> {
        let counter = self.clone();
        tokio::spawn(async move {
            while let Some(envelope) = inbox.recv().await {
                counter.handle_envelope(envelope);
            }
            tracing::trace!("Inbox of {} closed", counter.worker);
        })
    }

    /// Applies one queued message. Messages a worker sent before it was declared dead are
    /// discarded unread; their acks still go out.
    pub fn handle_envelope(&self, envelope: Envelope) {
        if self.table.has_departed(&envelope.from) {
            tracing::debug!("Discarding message from dead worker {}", envelope.from);
        } else {
            match protocol::decode(&envelope.bytes) {
                Ok(message) => {
                    if let Err(e) = self.apply_message(message) {
                        tracing::warn!("Message from {} rejected: {}", envelope.from, e);
                    }
                }
                Err(e) => tracing::warn!("Failed to decode message from {}: {}", envelope.from, e),
            }
        }

        if let Some(ack) = envelope.ack {
            let _ = ack.send(());
        }
    }

    fn apply_message(&self, message: ProtocolMessage) -> Result<(), ObjectError> {
        let followups = match message {
            ProtocolMessage::Report(report) => self.table.apply_report(report)?,
            ProtocolMessage::Pin { object, change } => self.table.apply_pin(&object, change)?,
            ProtocolMessage::Flush => Followups::default(),
        };
        self.dispatch(followups);
        Ok(())
    }

    /// Waits until every owner this worker has talked to applied all earlier messages.
    pub async fn flush(&self) {
        let peers: Vec<WorkerId> = self.peers.iter().map(|peer| *peer.key()).collect();
        let acks: Vec<_> = peers
            .into_iter()
            .filter_map(|peer| {
                self.directory
                    .send(self.worker, peer, ProtocolMessage::Flush, true)
                    .ok()
                    .flatten()
            })
            .collect();

        for ack in acks {
            let _ = ack.await;
        }
    }

    /// Another worker died: drop its references to objects owned here and anything
    /// borrowed from it.
    pub fn on_worker_dead(&self, dead: WorkerId) {
        if dead == self.worker || !self.is_alive() {
            return;
        }

        let followups = self.table.drop_worker(dead);
        self.dispatch(followups);

        let forgotten = self.ledger.forget_owner(dead);
        if forgotten > 0 {
            tracing::debug!(
                "{} forgot {} object(s) borrowed from dead owner {}",
                self.worker,
                forgotten,
                dead
            );
        }
        self.peers.remove(&dead);
    }

    /// This worker died. Nothing it held or owned is counted any more.
    pub fn shutdown(&self) {
        if !self.alive.swap(false, Ordering::SeqCst) {
            return;
        }
        let records = self.table.mark_dead();
        self.ledger.clear();
        self.scans.clear();
        self.lineage.clear();
        tracing::debug!("{} shut down with {} owned record(s)", self.worker, records);
    }
}
