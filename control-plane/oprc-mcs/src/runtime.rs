use std::sync::Arc;

use anyhow::Context;
use kube::Client;
use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::cluster::KubeClusterApi;
use crate::config::AgentConfig;
use crate::controller::queue::WorkQueue;
use crate::controller::{ControllerContext, ServiceImportController};
use crate::endpoints::PodEndpointWatcherFactory;
use crate::source::KubeImportSource;

/// Builds the controller with its kube-backed collaborators.
pub fn build_controller(client: Client, cfg: &AgentConfig) -> ServiceImportController {
    let ctx = ControllerContext {
        source: Arc::new(KubeImportSource::new(client.clone(), &cfg.namespace)),
        cluster: Arc::new(KubeClusterApi::new(client.clone())),
        watchers: Arc::new(PodEndpointWatcherFactory::new(client)),
        cluster_id: cfg.cluster_id.clone(),
    };
    let queue = WorkQueue::new(cfg.retry.limiter());
    ServiceImportController::new(ctx, queue, cfg.worker_count())
}

/// Cancels `token` on SIGTERM or SIGINT.
pub fn spawn_signal_handler(token: CancellationToken) -> anyhow::Result<()> {
    let mut sigterm =
        signal(SignalKind::terminate()).context("Failed to setup SIGTERM handler")?;
    let mut sigint =
        signal(SignalKind::interrupt()).context("Failed to setup SIGINT handler")?;
    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM, shutting down"),
            _ = sigint.recv() => info!("Received SIGINT, shutting down"),
            _ = token.cancelled() => {}
        }
        token.cancel();
    });
    Ok(())
}

/// Runs the controller until a termination signal arrives, then waits for the
/// workers to drain and stops the endpoint watchers.
pub async fn run(client: Client, cfg: AgentConfig) -> anyhow::Result<()> {
    let token = CancellationToken::new();
    spawn_signal_handler(token.clone())?;

    let controller = build_controller(client, &cfg);
    controller.start(token.clone())?;
    controller.join().await;
    controller.stop_all_watchers();
    info!("Shutdown complete");
    Ok(())
}
