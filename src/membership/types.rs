use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Identity of a worker process. Owners of objects are identified by this.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkerId(pub Uuid);

impl WorkerId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for WorkerId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "worker-{}", &self.0.simple().to_string()[..8])
    }
}

/// Identity of a node, i.e. a machine hosting one object store.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub Uuid);

impl NodeId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node-{}", &self.0.simple().to_string()[..8])
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum WorkerState {
    Alive,
    Suspect,
    /// Terminal. A dead worker never rejoins; a restarted process gets a new id.
    Dead,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum WorkerKind {
    /// Submits work and holds references, never executes tasks.
    Driver,
    Executor,
}

/// A single member known to the liveness service.
///
/// The `incarnation` field is a logical clock used to order updates: a worker refutes a
/// suspicion by heartbeating with a higher incarnation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Member {
    pub id: WorkerId,
    pub node: NodeId,
    pub kind: WorkerKind,
    pub state: WorkerState,
    pub incarnation: u64,

    #[serde(skip)]
    pub last_seen: Option<Instant>,
}

/// Events published to everyone who subscribed to the liveness service.
///
/// `WorkerDead` is what ownership tables and object stores consume to release what the
/// dead worker held or owned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MembershipEvent {
    Joined(WorkerId),
    Suspected(WorkerId),
    Refuted(WorkerId),
    Dead(WorkerId),
}

#[derive(Debug, Clone, Copy)]
pub struct LivenessTiming {
    pub heartbeat_interval: Duration,
    pub suspect_timeout: Duration,
    pub dead_timeout: Duration,
}

impl LivenessTiming {
    /// How often the failure detector scans members.
    pub fn detection_interval(&self) -> Duration {
        (self.suspect_timeout / 4).max(Duration::from_millis(10))
    }
}
