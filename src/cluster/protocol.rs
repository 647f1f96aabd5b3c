//! Wire Protocol Definitions
//!
//! JSON-over-HTTP DTOs and endpoint constants shared by the transport
//! client and server. This is the entire cross-node surface: a node accepts
//! task submissions and answers heartbeats, nothing else. There is no
//! result channel back to the submitting node (fire-and-forget).

use crate::scheduler::types::TaskContext;
use serde::{Deserialize, Serialize};

pub const ENDPOINT_SUBMIT: &str = "/submit";
pub const ENDPOINT_HEARTBEAT: &str = "/heartbeat";

/// Body of `POST /submit`. `priority` is the 0-3 wire code
/// (0 = Critical .. 3 = Low).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitTaskRequest {
    pub name: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default)]
    pub context: TaskContext,
    pub priority: u8,
    #[serde(default)]
    pub labels: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SubmitTaskResponse {
    pub enqueued: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    pub status: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}
