//! Membership & Liveness Module
//!
//! Tracks which worker processes are alive and turns silence into death notifications.
//! "Owner died" is a membership event consumed by ownership tables and object stores, not
//! a signal handler.
//!
//! ## Core Mechanisms
//! - **Heartbeats**: Every worker periodically reports to the `LivenessService`.
//! - **Failure Detection**: A "Suspect" -> "Dead" transition model with timeouts.
//! - **Incarnation Numbers**: A suspected worker refutes the suspicion by heartbeating with
//!   a higher incarnation.
//! - **Events**: Transitions are broadcast as `MembershipEvent`s.

pub mod service;
pub mod types;
