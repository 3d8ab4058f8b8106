//! Cluster Runtime
//!
//! Wires nodes, stores, workers and the liveness service together in one process.
//! Worker death, whether injected or detected from missed heartbeats, always funnels into
//! `handle_worker_death`, which fences the worker and lets every other component forget it.

use super::worker::Worker;
use crate::config::ClusterConfig;
use crate::error::{LostReason, ObjectError};
use crate::executor::manager::TaskManager;
use crate::executor::registry::TaskHandlerRegistry;
use crate::membership::service::LivenessService;
use crate::membership::types::{MembershipEvent, NodeId, WorkerId, WorkerKind};
use crate::ownership::counter::ReferenceCounter;
use crate::ownership::directory::OwnerDirectory;
use crate::ownership::table::OwnershipTable;
use crate::ownership::types::ObjectRef;
use crate::store::memory::ObjectStore;
use crate::store::types::StoreStats;

use anyhow::Result;
use dashmap::DashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Serialize)]
pub struct WorkerStats {
    pub id: WorkerId,
    pub node: NodeId,
    pub kind: WorkerKind,
    pub alive: bool,
    pub owned_objects: usize,
    pub borrowed_objects: usize,
    pub pending_tasks: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClusterStats {
    pub nodes: Vec<StoreStats>,
    pub workers: Vec<WorkerStats>,
}

pub struct Cluster {
    config: ClusterConfig,
    membership: Arc<LivenessService>,
    directory: Arc<OwnerDirectory>,
    registry: Arc<TaskHandlerRegistry>,
    workers: DashMap<WorkerId, Arc<Worker>>,
    nodes: Vec<NodeId>,
    next_executor: AtomicUsize,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl Cluster {
    /// Starts the nodes, their stores, the failure detector and `num_workers` executors.
    pub async fn start(
        config: ClusterConfig,
        registry: Arc<TaskHandlerRegistry>,
    ) -> Result<Arc<Self>> {
        config.validate()?;

        let directory = OwnerDirectory::new();
        let nodes: Vec<NodeId> = (0..config.num_nodes).map(|_| NodeId::new()).collect();
        for node in &nodes {
            directory.register_store(Arc::new(ObjectStore::new(
                *node,
                config.object_store_memory,
            )));
        }

        let cluster = Arc::new(Self {
            membership: LivenessService::new(config.liveness_timing()),
            config,
            directory,
            registry,
            workers: DashMap::new(),
            nodes,
            next_executor: AtomicUsize::new(0),
            background: Mutex::new(Vec::new()),
        });

        let detector = cluster.membership.clone().start();
        let events = cluster.spawn_event_loop();
        cluster.track(detector);
        cluster.track(events);

        for i in 0..cluster.config.num_workers {
            let node = cluster.nodes[i % cluster.nodes.len()];
            cluster.spawn_worker(WorkerKind::Executor, node);
        }

        tracing::info!(
            "Cluster started: {} node(s), {} executor(s), {} bytes per store",
            cluster.nodes.len(),
            cluster.config.num_workers,
            cluster.config.object_store_memory
        );

        Ok(cluster)
    }

    fn track(&self, handle: JoinHandle<()>) {
        if let Ok(mut background) = self.background.lock() {
            background.push(handle);
        }
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    pub fn directory(&self) -> &Arc<OwnerDirectory> {
        &self.directory
    }

    pub fn registry(&self) -> &Arc<TaskHandlerRegistry> {
        &self.registry
    }

    pub fn membership(&self) -> &Arc<LivenessService> {
        &self.membership
    }

    pub fn nodes(&self) -> &[NodeId] {
        &self.nodes
    }

    pub fn store(&self, node: &NodeId) -> Option<Arc<ObjectStore>> {
        self.directory.store(node)
    }

    pub fn worker(&self, id: &WorkerId) -> Option<Arc<Worker>> {
        self.workers.get(id).map(|worker| worker.clone())
    }

    /// Connects a new driver process on the first node.
    pub fn driver(self: &Arc<Self>) -> Arc<Worker> {
        self.spawn_worker(WorkerKind::Driver, self.nodes[0])
    }

    /// Connects a new driver process on `node`.
    pub fn driver_on(self: &Arc<Self>, node: NodeId) -> Arc<Worker> {
        self.spawn_worker(WorkerKind::Driver, node)
    }

    pub fn spawn_worker(self: &Arc<Self>, kind: WorkerKind, node: NodeId) -> Arc<Worker> {
        let id = WorkerId::new();
        let table = Arc::new(OwnershipTable::new(id));
        let counter = ReferenceCounter::new(id, table.clone(), self.directory.clone());

        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        self.directory.register_worker(id, inbox_tx, table);
        let inbox = counter.spawn_inbox(inbox_rx);

        let tasks = TaskManager::new(counter.clone(), Arc::downgrade(self), &self.config);
        let worker = Arc::new(Worker::new(
            node,
            kind,
            counter,
            tasks,
            Arc::downgrade(self),
        ));

        self.workers.insert(id, worker.clone());
        self.membership.register(id, node, kind);
        let heartbeat = worker.spawn_heartbeat(self.membership.clone());
        self.track(inbox);
        self.track(heartbeat);

        tracing::info!("Started {:?} {} on {}", kind, id, node);
        worker
    }

    /// Round-robin over live executors. Starts a replacement when none is left.
    pub fn pick_executor(self: &Arc<Self>) -> Arc<Worker> {
        let alive: Vec<Arc<Worker>> = self
            .membership
            .alive_executors()
            .into_iter()
            .filter_map(|id| self.worker(&id))
            .filter(|worker| worker.is_alive())
            .collect();

        if alive.is_empty() {
            let node = self.first_live_node();
            tracing::info!("No live executor, starting a replacement on {}", node);
            return self.spawn_worker(WorkerKind::Executor, node);
        }

        let next = self.next_executor.fetch_add(1, Ordering::Relaxed);
        alive[next % alive.len()].clone()
    }

    fn first_live_node(&self) -> NodeId {
        self.nodes
            .iter()
            .copied()
            .find(|node| {
                self.directory
                    .store(node)
                    .map(|store| !store.is_failed())
                    .unwrap_or(false)
            })
            .unwrap_or(self.nodes[0])
    }

    /// Rebuilds a referenced object whose stored copy is gone, through its owner.
    pub fn recover(&self, object: &ObjectRef, cause: LostReason) -> Result<(), ObjectError> {
        let owner = self
            .worker(&object.owner)
            .filter(|owner| owner.is_alive())
            .ok_or_else(|| ObjectError::owner_died(object.owner))?;
        owner.tasks().reconstruct(object, cause)
    }

    /// Crashes a worker immediately.
    pub fn kill_worker(&self, id: WorkerId) {
        self.handle_worker_death(id);
    }

    /// Stops a worker's heartbeats; the failure detector declares it dead later.
    pub fn partition_worker(&self, id: &WorkerId) -> bool {
        match self.worker(id) {
            Some(worker) => {
                worker.partition();
                true
            }
            None => false,
        }
    }

    /// Loses a whole node: its store and every worker on it.
    pub fn fail_node(&self, node: &NodeId) {
        if let Some(store) = self.directory.store(node) {
            store.fail();
        }

        let residents: Vec<WorkerId> = self
            .workers
            .iter()
            .filter(|worker| worker.node() == *node)
            .map(|worker| worker.id())
            .collect();
        for id in residents {
            self.handle_worker_death(id);
        }
    }

    /// Idempotent. Fences the dead worker, evicts what it owned from every store and makes
    /// every live worker drop the references it contributed. The worker leaves the cluster.
    pub fn handle_worker_death(&self, dead: WorkerId) {
        let Some((_, worker)) = self.workers.remove(&dead) else {
            return;
        };

        worker.crash();
        self.membership.declare_dead(dead);
        self.directory.disconnect(&dead);

        let evicted: usize = self
            .directory
            .stores()
            .iter()
            .map(|store| store.evict_owned_by(&dead))
            .sum();

        let survivors: Vec<Arc<Worker>> = self
            .workers
            .iter()
            .filter(|worker| worker.is_alive())
            .map(|worker| worker.clone())
            .collect();
        for worker in survivors {
            worker.counter().on_worker_dead(dead);
        }

        tracing::warn!(
            "Worker {} is dead; evicted {} object(s) it owned",
            dead,
            evicted
        );
    }

    fn spawn_event_loop(self: &Arc<Self>) -> JoinHandle<()> {
        let mut events = self.membership.subscribe();
        let cluster = Arc::downgrade(self);

        tokio::spawn(async move {
            loop {
                let event = events.recv().await;
                let Some(cluster) = cluster.upgrade() else {
                    break;
                };

                match event {
                    Ok(MembershipEvent::Dead(worker)) => cluster.handle_worker_death(worker),
                    Ok(MembershipEvent::Suspected(worker)) => {
                        tracing::debug!("Worker {} is suspected", worker);
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::warn!("Missed {} membership events, reconciling", missed);
                        cluster.reconcile();
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    /// Handles every death the event stream may have skipped.
    fn reconcile(&self) {
        let ids: Vec<WorkerId> = self.workers.iter().map(|worker| worker.id()).collect();
        for id in ids {
            if !self.membership.is_alive(&id) {
                self.handle_worker_death(id);
            }
        }
    }

    pub fn stats(&self) -> ClusterStats {
        let mut nodes: Vec<StoreStats> = self
            .directory
            .stores()
            .iter()
            .map(|store| store.stats())
            .collect();
        nodes.sort_by_key(|stats| self.nodes.iter().position(|node| *node == stats.node));

        let workers = self
            .workers
            .iter()
            .map(|worker| WorkerStats {
                id: worker.id(),
                node: worker.node(),
                kind: worker.kind(),
                alive: worker.is_alive(),
                owned_objects: worker.counter().table().len(),
                borrowed_objects: worker.counter().ledger().borrowed_count(),
                pending_tasks: worker.tasks().pending_count(),
            })
            .collect();

        ClusterStats { nodes, workers }
    }

    /// Stops background loops and kills every worker.
    pub fn shutdown(&self) {
        let ids: Vec<WorkerId> = self.workers.iter().map(|worker| worker.id()).collect();
        for id in ids {
            if let Some(worker) = self.worker(&id) {
                worker.crash();
            }
        }
        if let Ok(mut background) = self.background.lock() {
            for handle in background.drain(..) {
                handle.abort();
            }
        }
        tracing::info!("Cluster shut down");
    }
}
