use crate::error::ObjectError;
use crate::membership::types::WorkerId;
use crate::ownership::types::ObjectRef;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

/// Unique identifier for a task within the cluster.
///
/// A reconstruction re-runs the task under the same id.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(pub Uuid);

impl TaskId {
    /// Generates a new random UUID v4-based TaskId.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task-{}", &self.0.simple().to_string()[..8])
    }
}

/// Represents the lifecycle state of a task.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum TaskStatus {
    /// Submitted, arguments pinned, no attempt started yet.
    Pending,
    /// An attempt is executing on `worker`.
    Running { attempt: u32, worker: WorkerId },
    /// The previous attempt crashed; waiting out the retry delay.
    Retrying { attempt: u32 },
    /// Task finished and its return object is sealed.
    Completed,
    /// Terminal failure. The return object carries the same error.
    Failed { error: String },
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed { .. })
    }
}

/// The definition of a unit of work.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskSpec {
    /// The name of the registered handler to invoke.
    pub handler: String,
    /// Retries after a worker crash. `None` takes the cluster default.
    pub max_retries: Option<u32>,
    /// Delay between retries. `None` takes the cluster default.
    pub retry_delay: Option<Duration>,
}

impl TaskSpec {
    pub fn new(handler: impl Into<String>) -> Self {
        Self {
            handler: handler.into(),
            max_retries: None,
            retry_delay: None,
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = Some(retry_delay);
        self
    }
}

/// The submitter's record of one task.
#[derive(Debug, Clone)]
pub struct PendingTask {
    pub task_id: TaskId,
    pub spec: TaskSpec,
    pub args: Vec<ObjectRef>,
    pub return_ref: ObjectRef,
    pub max_retries: u32,
    pub retry_delay: Duration,
    /// Attempts started so far (in the current run, for a reconstruction).
    pub attempts: u32,
    pub status: TaskStatus,
    /// Argument pins still held; taken exactly once when the task ends.
    pub pins: Option<Vec<ObjectRef>>,
    /// How many times the pins were released. Never more than one per run.
    pub pin_releases: u32,
    /// Whether this run rebuilds a lost return object.
    pub reconstruction: bool,
    /// Timestamp (ms) when the task was submitted.
    pub created_at: u64,
}

/// Why one attempt did not produce a value.
#[derive(Debug, Clone)]
pub enum AttemptFailure {
    /// The executing worker died. Retryable.
    Crash(String),
    /// An argument could not be fetched. Terminal, with the argument's error.
    Argument(ObjectError),
    /// The handler returned an error. Terminal.
    Handler(String),
}

/// Helper to get the current system time in milliseconds.
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or_default()
}
