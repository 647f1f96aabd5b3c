//! Task Registry
//!
//! Maps string task names (e.g. "scrape_page") to executable async
//! handlers. The indirection is what lets a task be described entirely by
//! serializable data (`name` + `payload` + `context`) and therefore cross
//! the network: the transport server looks the name up in *its own*
//! registry and runs the local implementation.
//!
//! One registry instance is shared by the local worker pool and the
//! transport server of a process. It is injected explicitly wherever it is
//! needed (there is no process-wide global). Read-mostly: registration
//! happens at startup, lookups happen on every dispatch.

use super::types::{TaskContext, TaskFuture};
use crate::error::SchedulerError;

use dashmap::DashMap;
use std::future::Future;
use std::sync::Arc;

/// Type-erased async handler: `(payload, context) -> Result<result_json>`.
pub type HandlerFn =
    Arc<dyn Fn(serde_json::Value, TaskContext) -> TaskFuture + Send + Sync>;

pub struct TaskRegistry {
    handlers: DashMap<String, HandlerFn>,
}

impl TaskRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            handlers: DashMap::new(),
        })
    }

    /// Registers a handler under `name`. Re-registering a name replaces the
    /// previous handler.
    pub fn register<F, Fut>(&self, name: &str, handler: F)
    where
        F: Fn(serde_json::Value, TaskContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<serde_json::Value>> + Send + 'static,
    {
        // Box::pin erases the concrete Future type so handlers with
        // different bodies can live in the same map.
        let handler_fn: HandlerFn = Arc::new(move |payload, context| {
            Box::pin(handler(payload, context)) as TaskFuture
        });

        self.handlers.insert(name.to_string(), handler_fn);
        tracing::info!("Registered task handler: {}", name);
    }

    /// Looks up `name` and invokes its handler.
    ///
    /// Fails with [`SchedulerError::NotFound`] for unregistered names and
    /// [`SchedulerError::Handler`] when the handler itself errors.
    pub async fn run(
        &self,
        name: &str,
        payload: serde_json::Value,
        context: TaskContext,
    ) -> Result<serde_json::Value, SchedulerError> {
        let handler = match self.handlers.get(name) {
            Some(entry) => entry.value().clone(),
            None => {
                tracing::error!("Unknown task handler: {}", name);
                return Err(SchedulerError::NotFound(name.to_string()));
            }
        };

        handler(payload, context).await.map_err(SchedulerError::Handler)
    }

    pub fn has_handler(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }

    /// Names of all registered handlers.
    pub fn handler_names(&self) -> Vec<String> {
        self.handlers.iter().map(|e| e.key().clone()).collect()
    }
}
