//! Owner Directory
//!
//! The in-process stand-in for the cluster's RPC layer: routes protocol messages to owner
//! inboxes, answers status lookups against owner tables, and locates node stores.

use super::protocol::{self, Envelope, ProtocolMessage};
use super::table::OwnershipTable;
use super::types::ObjectRef;
use crate::error::ObjectError;
use crate::membership::types::{NodeId, WorkerId};
use crate::store::memory::{ObjectStore, ReferenceProbe};

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

pub struct OwnerDirectory {
    inboxes: DashMap<WorkerId, mpsc::UnboundedSender<Envelope>>,
    tables: DashMap<WorkerId, Arc<OwnershipTable>>,
    stores: DashMap<NodeId, Arc<ObjectStore>>,
}

impl OwnerDirectory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inboxes: DashMap::new(),
            tables: DashMap::new(),
            stores: DashMap::new(),
        })
    }

    pub fn register_worker(
        &self,
        worker: WorkerId,
        inbox: mpsc::UnboundedSender<Envelope>,
        table: Arc<OwnershipTable>,
    ) {
        self.inboxes.insert(worker, inbox);
        self.tables.insert(worker, table);
    }

    /// Stops delivery to a dead worker. Its table stays reachable so lookups can tell
    /// "owner died" apart from "never existed".
    pub fn disconnect(&self, worker: &WorkerId) -> bool {
        self.inboxes.remove(worker).is_some()
    }

    pub fn register_store(&self, store: Arc<ObjectStore>) {
        self.stores.insert(store.node(), store);
    }

    pub fn store(&self, node: &NodeId) -> Option<Arc<ObjectStore>> {
        self.stores.get(node).map(|store| store.clone())
    }

    pub fn stores(&self) -> Vec<Arc<ObjectStore>> {
        self.stores.iter().map(|store| store.value().clone()).collect()
    }

    pub fn table(&self, worker: &WorkerId) -> Option<Arc<OwnershipTable>> {
        self.tables.get(worker).map(|table| table.clone())
    }

    /// Encodes and enqueues `message` on `to`'s inbox. With `want_ack`, the returned
    /// receiver resolves once the owner applied it.
    pub fn send(
        &self,
        from: WorkerId,
        to: WorkerId,
        message: ProtocolMessage,
        want_ack: bool,
    ) -> Result<Option<oneshot::Receiver<()>>, ObjectError> {
        let bytes = protocol::encode(&message)?;
        let inbox = self
            .inboxes
            .get(&to)
            .map(|inbox| inbox.clone())
            .ok_or_else(|| ObjectError::owner_died(to))?;

        let (ack, receiver) = if want_ack {
            let (tx, rx) = oneshot::channel();
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };

        inbox
            .send(Envelope { from, bytes, ack })
            .map_err(|_| ObjectError::owner_died(to))?;

        Ok(receiver)
    }
}

impl ReferenceProbe for OwnerDirectory {
    fn is_referenced(&self, object: &ObjectRef) -> bool {
        self.table(&object.owner)
            .filter(|table| !table.is_dead())
            .and_then(|table| table.total_count(&object.id))
            .map(|total| total > 0)
            .unwrap_or(false)
    }
}
