mod app_env;

use app_env::{AppConfig, AppEnv};
use broker::app_config::init_console_subscriber;
use clap::Parser;
use prover_agent::spawn_agents;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_console_subscriber();
    let cli = AppConfig::parse();
    debug!("{}", serde_json::to_string_pretty(&cli)?);

    let app_env = AppEnv::new(&cli).await?;
    if let Err(err) = app_env.broker.health_check().await {
        // agents keep polling until the broker comes up
        warn!("Broker is not reachable yet: {:#}", err);
    }

    let shutdown = CancellationToken::new();
    let agents = spawn_agents(
        cli.agent_count,
        Arc::new(app_env.broker.clone()),
        app_env.proof_store.clone(),
        Arc::new(app_env.prover.clone()),
        cli.agent_config(),
        shutdown.clone(),
    );
    info!("Proving agents started against {}", cli.broker_url()?);

    // Keep the agents running until Ctrl+C is pressed
    tokio::signal::ctrl_c().await?;

    shutdown.cancel();
    futures::future::join_all(agents).await;
    info!("Proving agents stopped");

    Ok(())
}
