use super::lineage::{LineageEntry, LineageTable};
use crate::error::LostReason;
use crate::executor::types::TaskId;

use std::time::Duration;

const MAX_STORE_RETRY_DELAY: Duration = Duration::from_millis(1200);

/// How hard a full store tries to make room before failing a put.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreRetryPolicy {
    pub max_retries: u32,
    pub initial_delay: Duration,
}

impl StoreRetryPolicy {
    /// Backoff before retry `attempt` (1-based), doubling up to a cap.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.saturating_sub(1).min(16);
        self.initial_delay
            .saturating_mul(factor)
            .min(MAX_STORE_RETRY_DELAY)
    }

    /// Random jitter of up to a third of `delay`.
    pub fn jitter(delay: Duration) -> Duration {
        let bound = delay.as_millis() as u64 / 3 + 1;
        Duration::from_millis(rand::random::<u64>() % bound)
    }
}

impl Default for StoreRetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_delay: Duration::from_millis(10),
        }
    }
}

/// What to do about a referenced object whose stored copy is gone.
#[derive(Debug, Clone)]
pub enum Recovery {
    Reconstruct(LineageEntry),
    Lost(LostReason),
}

/// Consumes one reconstruction from the object's lineage budget, if there is any left.
pub fn plan_recovery(lineage: Option<TaskId>, table: &LineageTable) -> Recovery {
    let Some(task) = lineage else {
        return Recovery::Lost(LostReason::NoLineage);
    };

    match table.take_attempt(&task) {
        Ok(entry) => Recovery::Reconstruct(entry),
        Err(reason) => Recovery::Lost(reason),
    }
}
