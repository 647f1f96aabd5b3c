//! Node Configuration
//!
//! A node is configured from a single TOML file: bind address, optional
//! bearer token for inbound submissions, scheduler knobs, and the static
//! list of remote nodes this node may route to. Hook callbacks are wired in
//! code (`TaskHooks`), not here.
//!
//! ```toml
//! bind = "127.0.0.1:7400"
//! auth_token = "s3cret"
//!
//! [scheduler]
//! worker_count = 4
//! cpu_threshold_percent = 90.0
//!
//! [scheduler.rate_limits.llm]
//! fill_rate = 1.0
//! capacity = 2.0
//!
//! [[nodes]]
//! name = "gpu-1"
//! base_url = "http://10.0.0.2:7400"
//! labels = ["gpu"]
//! weight = 2
//! ```

use crate::cluster::types::RemoteNodeConfig;
use crate::scheduler::pool::PoolConfig;

use anyhow::{Context, Result};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::Path;

#[derive(Debug, Clone, Deserialize)]
pub struct NodeConfig {
    pub bind: SocketAddr,
    /// Token required from peers submitting to this node. `None` disables
    /// inbound auth.
    pub auth_token: Option<String>,
    #[serde(default)]
    pub scheduler: PoolConfig,
    /// Remote nodes this node can forward label-matching tasks to.
    #[serde(default)]
    pub nodes: Vec<RemoteNodeConfig>,
    /// Timeout for outbound submissions and heartbeats, milliseconds.
    #[serde(default = "default_transport_timeout_ms")]
    pub transport_timeout_ms: u64,
}

fn default_transport_timeout_ms() -> u64 {
    5_000
}

impl NodeConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let config: NodeConfig = toml::from_str(&raw)
            .with_context(|| format!("parsing config file {}", path.display()))?;
        Ok(config)
    }
}
