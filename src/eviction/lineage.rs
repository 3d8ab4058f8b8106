use crate::error::LostReason;
use crate::executor::types::{TaskId, TaskSpec};
use crate::ownership::types::ObjectRef;

use dashmap::DashMap;
use std::time::Duration;

/// Everything needed to run a task again, kept by the owner of its return object for as
/// long as that object is referenced.
#[derive(Debug, Clone)]
pub struct LineageEntry {
    pub task_id: TaskId,
    pub spec: TaskSpec,
    pub args: Vec<ObjectRef>,
    pub return_ref: ObjectRef,
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub reconstructions_left: u32,
}

pub struct LineageTable {
    entries: DashMap<TaskId, LineageEntry>,
}

impl LineageTable {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    pub fn insert(&self, entry: LineageEntry) {
        self.entries.insert(entry.task_id, entry);
    }

    pub fn get(&self, task: &TaskId) -> Option<LineageEntry> {
        self.entries.get(task).map(|entry| entry.clone())
    }

    /// Uses up one reconstruction and returns the entry to re-execute.
    pub fn take_attempt(&self, task: &TaskId) -> Result<LineageEntry, LostReason> {
        let mut entry = self.entries.get_mut(task).ok_or(LostReason::NoLineage)?;
        if entry.reconstructions_left == 0 {
            return Err(LostReason::LineageExhausted);
        }
        entry.reconstructions_left -= 1;
        Ok(entry.clone())
    }

    pub fn remove(&self, task: &TaskId) -> Option<LineageEntry> {
        self.entries.remove(task).map(|(_, entry)| entry)
    }

    pub fn contains(&self, task: &TaskId) -> bool {
        self.entries.contains_key(task)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&self) {
        self.entries.clear();
    }
}

impl Default for LineageTable {
    fn default() -> Self {
        Self::new()
    }
}
