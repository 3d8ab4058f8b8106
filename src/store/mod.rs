//! Object Store Module
//!
//! One bounded in-memory store per node. Payloads are immutable once sealed.
//!
//! ## Core Concepts
//! - **Capacity**: Byte accounting is a single atomic counter; a put reserves its size
//!   with a compare-and-swap before the entry becomes visible.
//! - **Pressure**: A put that does not fit evicts unreferenced copies and backs off, up to
//!   a configured number of retries, before failing with `StoreFull`.
//! - **Tombstones**: Removed objects leave a reason behind, so a reader of a missing copy
//!   learns whether it was evicted or went down with its node. Waiting for an object to
//!   be sealed happens on the owner's status, not here.

pub mod memory;
pub mod types;
