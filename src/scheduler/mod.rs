//! Local Task Scheduler
//!
//! A priority-based, in-memory work scheduler. Tasks enter through
//! [`pool::WorkerPool::submit`] as either an opaque closure or a
//! registry-backed `(name, payload, context)` description, and a fixed set
//! of workers dispatches them in `(priority, ready_at, sequence)` order,
//! subject to an admission gate (pause state, host resource pressure,
//! per-label token buckets, per-label concurrency caps).
//!
//! ## Submodules
//! - **`types`**: the task envelope (`WorkItem`), priorities, the two-shape
//!   `WorkSpec` union, and retry/backoff math.
//! - **`bucket`**: continuous-refill token bucket rate limiter.
//! - **`registry`**: name → async handler lookup, the indirection that
//!   makes tasks serializable and therefore remote-routable.
//! - **`monitor`**: pluggable resource probe behind a trait.
//! - **`pool`**: the worker loops, queue, admission, and retry logic.

pub mod bucket;
pub mod monitor;
pub mod pool;
pub mod registry;
pub mod types;

#[cfg(test)]
mod tests;
