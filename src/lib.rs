//! taskmesh: priority task scheduling with label-aware cluster routing
//!
//! This library crate defines the two subsystems that make up a node,
//! plus the configuration and error plumbing shared between them:
//!
//! - **`scheduler`**: the local engine. A fixed worker pool drains a shared
//!   priority queue in `(priority, ready_at, sequence)` order, gated by
//!   admission checks (pause state, host resource pressure, per-label token
//!   buckets, per-label concurrency caps), with exponential-backoff retries
//!   and per-attempt observer hooks.
//! - **`cluster`**: the routing layer. A task described as
//!   `(name, payload, context)` can execute locally through the registry or
//!   be forwarded, fire-and-forget, to a labeled remote node over a minimal
//!   HTTP/JSON protocol (`/submit` with bearer auth, `/heartbeat`).
//!
//! Everything is in-memory and best-effort: a process restart loses all
//! queued, in-flight, and retry-pending work.

pub mod cluster;
pub mod config;
pub mod error;
pub mod scheduler;
