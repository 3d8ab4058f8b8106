//! Task Handler Registry
//!
//! A dynamic registry that maps string-based task names (e.g., "produce")
//! to executable Rust closures. Handlers receive a `TaskContext` with their resolved
//! arguments and return the task's value.

use super::types::{TaskId, TaskSpec};
use crate::cluster::Worker;
use crate::error::ObjectError;
use crate::membership::types::WorkerId;
use crate::ownership::handle::ObjectHandle;
use crate::ownership::types::ObjectRef;
use crate::payload::Value;

use anyhow::Result;
use dashmap::DashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

/// Type alias for a thread-safe, asynchronous task handler function.
/// It takes a `TaskContext` and returns a Future that resolves to the task's value.
pub type TaskHandlerFn =
    Arc<dyn Fn(TaskContext) -> Pin<Box<dyn Future<Output = Result<Value>> + Send>> + Send + Sync>;

/// Marker error: the worker running the handler exited mid-task.
#[derive(Debug, thiserror::Error)]
#[error("worker {0} exited during task execution")]
pub struct WorkerExit(pub WorkerId);

/// What a handler sees while it runs on an executor worker.
pub struct TaskContext {
    pub task_id: TaskId,
    pub attempt: u32,
    /// Arguments in submission order, already fetched. Refs inside them are handles held
    /// by the executing worker.
    pub args: Vec<Value>,
    worker: Arc<Worker>,
}

impl TaskContext {
    pub fn new(task_id: TaskId, attempt: u32, args: Vec<Value>, worker: Arc<Worker>) -> Self {
        Self {
            task_id,
            attempt,
            args,
            worker,
        }
    }

    pub fn worker(&self) -> &Arc<Worker> {
        &self.worker
    }

    pub fn arg(&self, index: usize) -> Option<&Value> {
        self.args.get(index)
    }

    /// Puts an object owned by the executing worker.
    pub async fn put(&self, value: Value) -> Result<ObjectHandle, ObjectError> {
        self.worker.put(value).await
    }

    pub async fn get(&self, object: &ObjectRef, timeout: Option<Duration>) -> Result<Value, ObjectError> {
        self.worker.get(object, timeout).await
    }

    /// Submits a nested task. The executing worker owns its return object.
    pub async fn submit(&self, spec: TaskSpec, args: Vec<ObjectRef>) -> Result<ObjectHandle, ObjectError> {
        self.worker.submit_task(spec, args).await
    }

    /// Kills the executing worker, like a process calling `exit` mid-task. Return the
    /// result from the handler.
    pub fn exit_worker(&self) -> anyhow::Error {
        self.worker.exit();
        anyhow::Error::new(WorkerExit(self.worker.id()))
    }
}

/// Registry holding the mapping between task names and their implementation.
pub struct TaskHandlerRegistry {
    handlers: DashMap<String, TaskHandlerFn>,
}

impl TaskHandlerRegistry {
    /// Creates a new, empty registry.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            handlers: DashMap::new(),
        })
    }

    /// Registers a new handler function under a specific name.
    pub fn register<F, Fut>(&self, handler_name: &str, handler: F)
    where
        F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        // Type-erase the future so different async functions share one map
        let handler_fn: TaskHandlerFn = Arc::new(move |ctx: TaskContext| {
            Box::pin(handler(ctx)) as Pin<Box<dyn Future<Output = Result<Value>> + Send>>
        });

        self.handlers.insert(handler_name.to_string(), handler_fn);

        tracing::info!("Registered task handler: {}", handler_name);
    }

    /// Looks up a handler by name and runs it.
    ///
    /// # Returns
    /// * `Ok(value)` if the handler executed successfully.
    /// * `Err` if the handler failed or if no handler exists for the given name.
    pub async fn execute(&self, handler: &str, ctx: TaskContext) -> Result<Value> {
        // Clone the Arc out so the map shard is not held across the await
        let handler_fn = self.handlers.get(handler).map(|entry| entry.value().clone());

        match handler_fn {
            Some(handler_fn) => {
                tracing::debug!(
                    "Executing task {} with handler '{}' ({} argument(s))",
                    ctx.task_id,
                    handler,
                    ctx.args.len()
                );
                handler_fn(ctx).await
            }
            None => {
                let error = format!("Unknown task handler: {}", handler);
                tracing::error!("{}", error);
                Err(anyhow::anyhow!(error))
            }
        }
    }

    /// Returns a list of all registered handler names.
    pub fn list_handlers(&self) -> Vec<String> {
        self.handlers
            .iter()
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Checks if a handler is registered.
    pub fn has_handler(&self, handler_name: &str) -> bool {
        self.handlers.contains_key(handler_name)
    }

    /// Returns the total number of registered handlers.
    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }
}

impl Default for TaskHandlerRegistry {
    fn default() -> Self {
        Self {
            handlers: DashMap::new(),
        }
    }
}
