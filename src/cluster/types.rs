use serde::Deserialize;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

/// Static description of a remote node, as it appears in the config file.
#[derive(Debug, Clone, Deserialize)]
pub struct RemoteNodeConfig {
    pub name: String,
    /// e.g. `http://10.0.0.2:7400`
    pub base_url: String,
    #[serde(default)]
    pub labels: BTreeSet<String>,
    pub auth_token: Option<String>,
    #[serde(default = "default_weight")]
    pub weight: u32,
}

fn default_weight() -> u32 {
    1
}

/// A labeled HTTP endpoint capable of accepting tasks.
///
/// `inflight` counts remote submissions currently awaiting a response and
/// `last_success_at` records the newest successful submission (epoch ms,
/// 0 = never). Both feed the router's node selection: least loaded first,
/// ties broken toward higher weight, then toward most recently healthy.
#[derive(Debug)]
pub struct RemoteNode {
    pub name: String,
    pub base_url: String,
    pub labels: BTreeSet<String>,
    pub auth_token: Option<String>,
    pub weight: u32,
    inflight: AtomicUsize,
    last_success_at: AtomicU64,
}

impl RemoteNode {
    pub fn new(config: RemoteNodeConfig) -> Arc<Self> {
        Arc::new(Self {
            name: config.name,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            labels: config.labels,
            auth_token: config.auth_token,
            weight: config.weight.max(1),
            inflight: AtomicUsize::new(0),
            last_success_at: AtomicU64::new(0),
        })
    }

    /// Whether any of the task's labels match this node.
    pub fn matches(&self, labels: &BTreeSet<String>) -> bool {
        !self.labels.is_disjoint(labels)
    }

    pub fn inflight_count(&self) -> usize {
        self.inflight.load(Ordering::SeqCst)
    }

    pub fn last_success_at(&self) -> u64 {
        self.last_success_at.load(Ordering::SeqCst)
    }

    pub fn begin_submission(&self) {
        self.inflight.fetch_add(1, Ordering::SeqCst);
    }

    pub fn end_submission(&self) {
        self.inflight.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn record_success(&self, at_ms: u64) {
        self.last_success_at.store(at_ms, Ordering::SeqCst);
    }
}
