use taskmesh::cluster::client::TransportClient;
use taskmesh::cluster::handlers::{app, ServerState};
use taskmesh::cluster::router::{ClusterRouter, RouteHint};
use taskmesh::cluster::types::RemoteNode;
use taskmesh::config::NodeConfig;
use taskmesh::scheduler::monitor::SystemMonitor;
use taskmesh::scheduler::pool::{SubmitOptions, TaskHooks, WorkerPool};
use taskmesh::scheduler::registry::TaskRegistry;
use taskmesh::scheduler::types::{Priority, TaskContext};

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let args: Vec<String> = std::env::args().collect();

    let mut config_path: Option<PathBuf> = None;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--config" => {
                config_path = Some(PathBuf::from(&args[i + 1]));
                i += 2;
            }
            _ => {
                i += 1;
            }
        }
    }

    let Some(config_path) = config_path else {
        eprintln!("Usage: {} --config <node.toml>", args[0]);
        eprintln!("Example: {} --config node-a.toml", args[0]);
        std::process::exit(1);
    };

    let config = NodeConfig::load(&config_path)?;
    tracing::info!("Starting node on {}", config.bind);

    // 1. Registry: the handlers this node can execute by name.
    let registry = TaskRegistry::new();
    registry.register("echo", |payload, _context| async move {
        tracing::info!("echo: {}", payload);
        Ok(payload)
    });
    registry.register("sleep", |payload, _context| async move {
        let seconds = payload["seconds"].as_f64().unwrap_or(1.0);
        tokio::time::sleep(Duration::from_secs_f64(seconds)).await;
        Ok(serde_json::json!({ "slept": seconds }))
    });

    // 2. Worker pool:
    let pool = WorkerPool::new(
        config.scheduler.clone(),
        registry.clone(),
        Arc::new(SystemMonitor::new()),
        TaskHooks::default(),
    );
    pool.clone().start();

    // 3. Cluster router over the configured remote nodes:
    let nodes: Vec<Arc<RemoteNode>> = config
        .nodes
        .iter()
        .cloned()
        .map(RemoteNode::new)
        .collect();
    if !nodes.is_empty() {
        tracing::info!("Routing to {} remote node(s)", nodes.len());
    }
    let client = TransportClient::new(Duration::from_millis(config.transport_timeout_ms));
    let router = ClusterRouter::new(pool.clone(), nodes, client);

    // Startup self-check: run one low-priority echo through the full
    // submit path before accepting traffic.
    let outcome = router
        .submit_task(
            "echo",
            serde_json::json!({ "message": "node online" }),
            TaskContext::new(),
            SubmitOptions {
                priority: Priority::Low,
                ..SubmitOptions::default()
            },
            RouteHint::Local,
        )
        .await?;
    tracing::info!("Self-check task submitted: {:?}", outcome);

    // 4. HTTP server (task intake + heartbeat):
    let state = Arc::new(ServerState {
        pool: pool.clone(),
        auth_token: config.auth_token.clone(),
    });

    tracing::info!("HTTP server listening on {}", config.bind);
    tracing::info!("Press Ctrl+C to shutdown");

    let listener = tokio::net::TcpListener::bind(config.bind).await?;
    axum::serve(listener, app(state)).await?;

    Ok(())
}
