use dashmap::DashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::info;

use super::types::{LivenessTiming, Member, MembershipEvent, NodeId, WorkerId, WorkerKind, WorkerState};

const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Liveness service shared by every worker of the cluster.
///
/// Workers heartbeat into it; a background loop moves silent workers from `Alive` to
/// `Suspect` and then `Dead`, publishing a `MembershipEvent` for each transition.
pub struct LivenessService {
    pub members: Arc<DashMap<WorkerId, Member>>,
    events: broadcast::Sender<MembershipEvent>,
    timing: LivenessTiming,
}

impl LivenessService {
    pub fn new(timing: LivenessTiming) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Arc::new(Self {
            members: Arc::new(DashMap::new()),
            events,
            timing,
        })
    }

    pub fn timing(&self) -> LivenessTiming {
        self.timing
    }

    /// Spawns the failure detection loop and returns its handle.
    pub fn start(self: Arc<Self>) -> JoinHandle<()> {
        tracing::info!("Starting liveness service...");
        tokio::spawn(async move {
            self.failure_detection_loop().await;
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MembershipEvent> {
        self.events.subscribe()
    }

    pub fn register(&self, id: WorkerId, node: NodeId, kind: WorkerKind) {
        let member = Member {
            id,
            node,
            kind,
            state: WorkerState::Alive,
            incarnation: 1,
            last_seen: Some(Instant::now()),
        };
        self.members.insert(id, member);

        info!("Worker {} ({:?}) joined on {}", id, kind, node);
        info!("Cluster size now: {}", self.members.len());
        self.publish(MembershipEvent::Joined(id));
    }

    /// Records a heartbeat. Returns the state the worker is in afterwards, or `None` for
    /// an unknown worker.
    pub fn heartbeat(&self, from: WorkerId, incarnation: u64) -> Option<WorkerState> {
        let mut refuted = false;
        let state = {
            let mut member = self.members.get_mut(&from)?;

            match member.state {
                WorkerState::Dead => {
                    tracing::debug!("Ignoring heartbeat from dead worker {}", from);
                }
                WorkerState::Alive => {
                    member.last_seen = Some(Instant::now());
                    if incarnation > member.incarnation {
                        member.incarnation = incarnation;
                    }
                }
                WorkerState::Suspect => {
                    if incarnation > member.incarnation {
                        tracing::info!(
                            "Worker {} refuted suspicion (inc {} -> {})",
                            from,
                            member.incarnation,
                            incarnation
                        );
                        member.state = WorkerState::Alive;
                        member.incarnation = incarnation;
                        member.last_seen = Some(Instant::now());
                        refuted = true;
                    } else {
                        // Stale incarnation cannot clear a suspicion.
                        member.last_seen = Some(Instant::now());
                    }
                }
            }
            member.state
        };

        if refuted {
            self.publish(MembershipEvent::Refuted(from));
        }
        Some(state)
    }

    pub fn state(&self, id: &WorkerId) -> Option<WorkerState> {
        self.members.get(id).map(|m| m.state)
    }

    pub fn incarnation(&self, id: &WorkerId) -> Option<u64> {
        self.members.get(id).map(|m| m.incarnation)
    }

    /// A suspected worker is still reachable; only `Dead` is final.
    pub fn is_alive(&self, id: &WorkerId) -> bool {
        matches!(
            self.state(id),
            Some(WorkerState::Alive) | Some(WorkerState::Suspect)
        )
    }

    /// Marks a worker dead right away, e.g. after a confirmed crash.
    /// Returns `true` if this call performed the transition.
    pub fn declare_dead(&self, id: WorkerId) -> bool {
        let transitioned = match self.members.get_mut(&id) {
            Some(mut member) if member.state != WorkerState::Dead => {
                member.state = WorkerState::Dead;
                true
            }
            _ => false,
        };

        if transitioned {
            tracing::warn!("Worker {} declared DEAD", id);
            info!("Cluster size now: {} alive workers", self.get_alive_members().len());
            self.publish(MembershipEvent::Dead(id));
        }
        transitioned
    }

    pub fn get_alive_members(&self) -> Vec<Member> {
        self.members
            .iter()
            .filter(|entry| entry.value().state != WorkerState::Dead)
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Live executors sorted by id, so callers can round-robin deterministically.
    pub fn alive_executors(&self) -> Vec<WorkerId> {
        let mut ids: Vec<WorkerId> = self
            .members
            .iter()
            .filter(|entry| {
                entry.value().kind == WorkerKind::Executor
                    && entry.value().state == WorkerState::Alive
            })
            .map(|entry| *entry.key())
            .collect();
        ids.sort();
        ids
    }

    /// One pass of the failure detector at `now`. Returns the events it published.
    pub fn detect_failures(&self, now: Instant) -> Vec<MembershipEvent> {
        let mut events = Vec::new();

        for mut entry in self.members.iter_mut() {
            let member = entry.value_mut();

            let Some(last_seen) = member.last_seen else {
                member.last_seen = Some(now);
                continue;
            };
            let elapsed = now.saturating_duration_since(last_seen);

            match member.state {
                WorkerState::Alive => {
                    if elapsed > self.timing.suspect_timeout {
                        tracing::warn!(
                            "Worker {} suspected (no heartbeat for {:?})",
                            member.id,
                            elapsed
                        );
                        member.state = WorkerState::Suspect;
                        events.push(MembershipEvent::Suspected(member.id));
                    }
                }
                WorkerState::Suspect => {
                    if elapsed > self.timing.dead_timeout {
                        tracing::warn!(
                            "Worker {} declared DEAD (no heartbeat for {:?})",
                            member.id,
                            elapsed
                        );
                        member.state = WorkerState::Dead;
                        events.push(MembershipEvent::Dead(member.id));
                    }
                }
                WorkerState::Dead => {}
            }
        }

        for event in &events {
            self.publish(event.clone());
        }
        events
    }

    async fn failure_detection_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.timing.detection_interval());

        loop {
            interval.tick().await;
            let events = self.detect_failures(Instant::now());
            if events.iter().any(|e| matches!(e, MembershipEvent::Dead(_))) {
                tracing::info!(
                    "Cluster size now: {} alive workers",
                    self.get_alive_members().len()
                );
            }
        }
    }

    fn publish(&self, event: MembershipEvent) {
        // No subscribers is fine: nobody cares yet.
        let _ = self.events.send(event);
    }
}
