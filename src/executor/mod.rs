//! Task Lifecycle Module
//!
//! Tasks are submitted by a worker (driver or executor) and run on executor workers. The
//! submitter owns the task's return object and keeps the task's argument pins for as long
//! as the task can still run.
//!
//! ## Lifecycle
//! 1. **Submission**: The return object is registered as `Pending` and every argument is
//!    pinned, all or nothing. Lineage is recorded for later reconstruction.
//! 2. **Execution**: An executor is picked round-robin. It fetches the arguments, runs the
//!    registered handler and hands the value back.
//! 3. **Retry**: If the executor dies mid-attempt, the task is retried after the retry
//!    delay until `max_retries` is used up.
//! 4. **Completion**: Argument pins are released exactly once, then the return object is
//!    sealed (`Ready`) or failed.
//!
//! ## Submodules
//! - **`manager`**: Per-worker `TaskManager` driving submitted tasks and reconstructions.
//! - **`registry`**: Maps handler names (e.g. "echo") to async Rust functions.
//! - **`types`**: Task identifiers, specs and status.

pub mod manager;
pub mod registry;
pub mod types;
