//! Cluster Router
//!
//! Decides, per task, whether to execute on the local worker pool or to
//! forward to a labeled remote node. Only registry-backed named tasks pass
//! through here, since they are the only shape that can cross the network.
//!
//! Remote selection among label-matching nodes minimizes the tuple
//! `(inflight asc, weight desc, last_success_at desc)`: least loaded
//! first, ties broken toward higher configured weight, then toward the
//! most recently healthy node. Remote submission is fire-and-forget: the
//! caller gets an acknowledgment string, never the task's result.
//!
//! Transport failures propagate to the caller. There is deliberately no
//! automatic local fallback; a caller that wants one builds it on top.

use super::client::TransportClient;
use super::protocol::SubmitTaskRequest;
use super::types::RemoteNode;
use crate::error::SchedulerError;
use crate::scheduler::pool::{SubmitOptions, WorkerPool};
use crate::scheduler::types::{now_ms, TaskContext, TaskId, WorkSpec};

use std::cmp::Reverse;
use std::sync::Arc;

/// Caller-supplied routing override.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteHint {
    /// Route by label affinity; fall back to local when nothing matches.
    Auto,
    /// Force local execution regardless of label matches.
    Local,
}

/// Where a submission ended up.
#[derive(Debug)]
pub enum RouteOutcome {
    /// Executed (or queued) on the local pool.
    Local(TaskId),
    /// Accepted by a remote node. `ack` is a synthetic receipt; no result
    /// ever comes back for it.
    Remote { node: String, ack: String },
}

/// Decrements a node's in-flight count when the submission attempt ends,
/// whether it succeeded or errored out.
struct SubmissionGuard<'a>(&'a RemoteNode);

impl Drop for SubmissionGuard<'_> {
    fn drop(&mut self) {
        self.0.end_submission();
    }
}

pub struct ClusterRouter {
    pool: Arc<WorkerPool>,
    nodes: Vec<Arc<RemoteNode>>,
    client: TransportClient,
}

impl ClusterRouter {
    pub fn new(
        pool: Arc<WorkerPool>,
        nodes: Vec<Arc<RemoteNode>>,
        client: TransportClient,
    ) -> Arc<Self> {
        Arc::new(Self {
            pool,
            nodes,
            client,
        })
    }

    /// Submits a named task, routing it locally or to a remote node.
    ///
    /// `opts.priority`, `opts.labels`, and `opts.delay` steer routing and
    /// scheduling; the remaining options only apply when the task lands on
    /// the local pool (the remote side schedules with its own defaults).
    pub async fn submit_task(
        &self,
        name: &str,
        payload: serde_json::Value,
        context: TaskContext,
        opts: SubmitOptions,
        hint: RouteHint,
    ) -> Result<RouteOutcome, SchedulerError> {
        let target = match hint {
            RouteHint::Local => None,
            RouteHint::Auto => self.select_node(&opts),
        };

        match target {
            None => self.submit_local(name, payload, context, opts),
            Some(node) => self.submit_remote(&node, name, payload, context, &opts).await,
        }
    }

    fn submit_local(
        &self,
        name: &str,
        payload: serde_json::Value,
        context: TaskContext,
        opts: SubmitOptions,
    ) -> Result<RouteOutcome, SchedulerError> {
        tracing::debug!("Routing task '{}' to local pool", name);

        let spec = WorkSpec::Named {
            name: name.to_string(),
            payload,
            context,
        };
        let id = self.pool.submit(spec, opts)?;
        Ok(RouteOutcome::Local(id))
    }

    async fn submit_remote(
        &self,
        node: &RemoteNode,
        name: &str,
        payload: serde_json::Value,
        context: TaskContext,
        opts: &SubmitOptions,
    ) -> Result<RouteOutcome, SchedulerError> {
        let request = SubmitTaskRequest {
            name: name.to_string(),
            payload,
            context,
            priority: opts.priority.code(),
            labels: opts.labels.iter().cloned().collect(),
        };

        node.begin_submission();
        let guard = SubmissionGuard(node);

        tracing::debug!(
            "Routing task '{}' to node '{}' ({})",
            name,
            node.name,
            node.base_url
        );

        self.client.submit(node, &request).await?;
        drop(guard);

        node.record_success(now_ms());
        let ack = format!("remote:{}:{}", node.name, uuid::Uuid::new_v4());
        tracing::info!("Task '{}' accepted by node '{}'", name, node.name);

        Ok(RouteOutcome::Remote {
            node: node.name.clone(),
            ack,
        })
    }

    /// Picks the least-loaded label-matching node, or `None` when no node
    /// matches and the task should run locally.
    pub(crate) fn select_node(&self, opts: &SubmitOptions) -> Option<Arc<RemoteNode>> {
        self.nodes
            .iter()
            .filter(|node| node.matches(&opts.labels))
            .min_by_key(|node| {
                (
                    node.inflight_count(),
                    Reverse(node.weight),
                    Reverse(node.last_success_at()),
                )
            })
            .cloned()
    }

    pub fn nodes(&self) -> &[Arc<RemoteNode>] {
        &self.nodes
    }
}
