//! Cluster Routing Layer
//!
//! Everything above the local scheduler: deciding where a named task runs,
//! the minimal HTTP/JSON wire protocol between nodes, and the server that
//! feeds remote submissions into the local pool.
//!
//! ## Submodules
//! - **`types`**: `RemoteNode`, a labeled endpoint with tracked load and
//!   health, built from static configuration.
//! - **`protocol`**: endpoint constants and request/response DTOs.
//! - **`client`**: outbound reqwest transport (bearer auth, timeout).
//! - **`router`**: the local-vs-remote decision and node selection.
//! - **`handlers`**: inbound axum handlers (`/submit`, `/heartbeat`).
//!
//! The cluster is best-effort and fire-and-forget: a remote submission
//! yields only an enqueue acknowledgment, never a result, and nothing here
//! survives a process restart.

pub mod client;
pub mod handlers;
pub mod protocol;
pub mod router;
pub mod types;
