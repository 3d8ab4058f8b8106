//! Cluster Module
//!
//! The in-process cluster: nodes with their object stores, driver and executor workers,
//! the liveness service, and the glue that turns a worker death into cleanup everywhere.
//!
//! ## Fault injection
//! - `Cluster::kill_worker`: immediate crash, as if the process exited.
//! - `Cluster::partition_worker`: heartbeats stop; the failure detector declares the
//!   worker dead after the dead timeout.
//! - `Cluster::fail_node`: the node's store loses every copy and its workers die.

#[allow(clippy::module_inception)]
pub mod cluster;
pub mod worker;

pub use cluster::{Cluster, ClusterStats, WorkerStats};
pub use worker::Worker;

#[cfg(test)]
mod tests;
