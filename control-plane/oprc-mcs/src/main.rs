use envconfig::Envconfig;
use kube::Client;
use oprc_mcs::{config::AgentConfig, init_tracing, runtime};
use tracing::info;

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let cfg = AgentConfig::init_from_env()?;
    init_tracing(&cfg.log_level);
    info!(?cfg, "Starting ServiceImport agent");

    let client = Client::try_default().await?;
    runtime::run(client, cfg).await
}
