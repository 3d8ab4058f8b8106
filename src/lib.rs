//! Distributed Object Lifetime Library
//!
//! This library crate implements reference-counted lifetime management for objects held
//! in a cluster-wide object store. It serves as the foundation for the node binary (`main.rs`).
//!
//! ## Architecture Modules
//! The system is composed of loosely coupled subsystems, leaf-first:
//!
//! - **`store`**: Per-node object store with bounded capacity, atomic byte accounting,
//!   eviction under pressure and tombstones for freed objects.
//! - **`ownership`**: The authoritative per-owner reference counts (`OwnershipTable`), the
//!   borrower side (`BorrowLedger`), RAII `ObjectHandle`s and the bincode wire protocol
//!   exchanged between owners and borrowers.
//! - **`executor`**: The task lifecycle manager. Pins task arguments, drives attempts on
//!   executor workers, retries crashed attempts and surfaces terminal errors.
//! - **`eviction`**: Lineage bookkeeping and the reconstruction decision for objects whose
//!   store copy disappeared while still referenced.
//! - **`membership`**: Heartbeat-based liveness detection (Alive -> Suspect -> Dead) that
//!   publishes worker death events.
//! - **`payload`**: The value tree stored in objects and the memoized scan for embedded refs.
//! - **`cluster`**: Wires nodes and workers together and exposes `put`/`get`/`submit_task`.
//! - **`api`**: HTTP handlers used by the node binary.

pub mod api;
pub mod cluster;
pub mod config;
pub mod error;
pub mod eviction;
pub mod executor;
pub mod membership;
pub mod ownership;
pub mod payload;
pub mod store;

pub use cluster::{Cluster, Worker};
pub use config::ClusterConfig;
pub use error::{LostReason, ObjectError};
pub use executor::registry::{TaskContext, TaskHandlerRegistry};
pub use executor::types::{TaskId, TaskSpec};
pub use ownership::handle::ObjectHandle;
pub use ownership::types::{ObjectId, ObjectRef};
pub use payload::Value;
