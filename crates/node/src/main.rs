use std::time::Duration;

use anyhow::Context;
use tracing::info;

use stepflow_node::{Node, NodeConfig, demo};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = NodeConfig::load()?;
    stepflow_observability::tracing::init(&config.log);

    let node = Node::start(&config).await?;

    // Engine calls are synchronous and may block on the job store.
    let client = config.client.clone();
    let instances = config.demo.instances;
    let (node, worker) = tokio::task::spawn_blocking(move || -> anyhow::Result<_> {
        let deployment = node
            .runtime
            .deploy(vec![demo::order_process()?])
            .context("failed to deploy the order process")?;
        info!(deployment_id = %deployment, "demo process deployed");

        let worker = demo::payment_worker(&node, &client)?;
        let orders = demo::start_orders(&node, instances)?;
        info!(orders = orders.len(), "demo orders started");
        Ok((node, worker))
    })
    .await??;

    match config.demo.run_for_in_millis {
        Some(ms) => tokio::time::sleep(Duration::from_millis(ms)).await,
        None => {
            tokio::signal::ctrl_c()
                .await
                .context("failed to listen for shutdown signal")?;
            info!("shutdown requested");
        }
    }

    tokio::task::spawn_blocking(move || {
        worker.shutdown();
        node.shutdown();
    })
    .await?;
    Ok(())
}
