//! Transport Client
//!
//! Thin reqwest wrapper for talking to remote nodes: bearer auth, a
//! per-request timeout, and the status-code-to-error mapping the router
//! relies on. All failures surface synchronously to the caller; nothing is
//! retried here (the submitting side is fire-and-forget by design).

use super::protocol::{ENDPOINT_HEARTBEAT, ENDPOINT_SUBMIT, SubmitTaskRequest};
use super::types::RemoteNode;
use crate::error::SchedulerError;

use std::time::Duration;

#[derive(Clone)]
pub struct TransportClient {
    http: reqwest::Client,
    timeout: Duration,
}

impl TransportClient {
    pub fn new(timeout: Duration) -> Self {
        Self {
            http: reqwest::Client::new(),
            timeout,
        }
    }

    /// Submits a task description to `node`. Success means the remote side
    /// enqueued it; there is no way to retrieve the result later.
    pub async fn submit(
        &self,
        node: &RemoteNode,
        request: &SubmitTaskRequest,
    ) -> Result<(), SchedulerError> {
        let url = format!("{}{}", node.base_url, ENDPOINT_SUBMIT);

        let mut builder = self.http.post(&url).json(request).timeout(self.timeout);
        if let Some(token) = &node.auth_token {
            builder = builder.bearer_auth(token);
        }

        let response = builder.send().await.map_err(|e| SchedulerError::Transport {
            node: node.name.clone(),
            reason: e.to_string(),
        })?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else if status == reqwest::StatusCode::UNAUTHORIZED {
            Err(SchedulerError::Auth(node.name.clone()))
        } else {
            Err(SchedulerError::Transport {
                node: node.name.clone(),
                reason: format!("unexpected status {}", status),
            })
        }
    }

    /// Liveness probe against `node`.
    pub async fn heartbeat(&self, node: &RemoteNode) -> Result<(), SchedulerError> {
        let url = format!("{}{}", node.base_url, ENDPOINT_HEARTBEAT);

        let response = self
            .http
            .get(&url)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| SchedulerError::Transport {
                node: node.name.clone(),
                reason: e.to_string(),
            })?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(SchedulerError::Transport {
                node: node.name.clone(),
                reason: format!("heartbeat status {}", response.status()),
            })
        }
    }
}
