//! Scheduler Error Taxonomy
//!
//! Distinguishes the failure classes that cross component boundaries.
//! Admission rejections are not represented here: a task that fails the
//! admission gate is silently re-queued and never surfaces as an error.
//!
//! Local handler failures are caught inside the worker loop and reported
//! through the `on_task_end` hook; they never unwind out of the pool.
//! Transport failures are the one class that propagates as a `Result::Err`
//! to whoever called `ClusterRouter::submit_task`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SchedulerError {
    /// No handler registered under the given task name.
    #[error("no task handler registered under '{0}'")]
    NotFound(String),

    /// The task's deadline passed before a worker could dispatch it.
    /// The handler is never invoked.
    #[error("deadline passed before dispatch")]
    DeadlineExceeded,

    /// The handler ran and returned an error. Retriable until
    /// `max_retries` is exhausted, after which it is terminal.
    #[error("task handler failed: {0}")]
    Handler(#[from] anyhow::Error),

    /// A remote submission failed: connection error, timeout, or a
    /// non-2xx response. Never falls back to local execution.
    #[error("remote submit to '{node}' failed: {reason}")]
    Transport { node: String, reason: String },

    /// The remote node rejected our bearer token (HTTP 401).
    #[error("node '{0}' rejected credentials")]
    Auth(String),

    /// Submission attempted after `stop` was called.
    #[error("worker pool is stopped")]
    PoolStopped,
}

impl SchedulerError {
    /// Whether a failed attempt with this error may be retried.
    /// Only genuine handler failures go back through the backoff path;
    /// an unregistered name cannot succeed on a later attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SchedulerError::Handler(_))
    }
}
