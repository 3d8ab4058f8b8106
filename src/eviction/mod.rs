//! Eviction & Reconstruction Module
//!
//! Objects leave a store in two ways: their owner's count reaches zero (eager eviction,
//! driven by the ownership layer) or a full store reclaims copies nobody references any
//! more while a put waits for room. A referenced object whose copy was lost is rebuilt by
//! re-running the task recorded in its lineage, within that task's retry budget.

pub mod lineage;
pub mod policy;
